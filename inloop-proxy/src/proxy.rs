use std::sync::Arc;

use openssl::ssl::SslConnector;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use uuid::Uuid;

use inloop_net::{
    CaCertificate, LeafCache, ParseStatus, Request, RequestParser, ResponseParser, build_acceptor,
    generate_leaf_cert,
};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::fetch::SubstituteFetcher;
use crate::rewrite::{self, RewriteAction, RewriteRule};
use crate::router::{self, Route};
use crate::tunnel::TunnelMap;
use crate::upstream::HostPort;

pub(crate) struct ProxyState {
    pub(crate) config: ProxyConfig,
    pub(crate) rule: RewriteRule,
    pub(crate) ca: CaCertificate,
    pub(crate) leaf_cache: Mutex<LeafCache>,
    pub(crate) tunnels: TunnelMap,
    pub(crate) fetcher: SubstituteFetcher,
    pub(crate) connector: SslConnector,
    pub(crate) upstream_http: Option<HostPort>,
}

pub(crate) async fn accept_loop(listener: TcpListener, state: Arc<ProxyState>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::debug!(error = %err, "accept failed");
                continue;
            }
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let id = Uuid::new_v4();
            let _release = TunnelRelease {
                state: Arc::clone(&state),
                id,
            };
            if let Err(err) = handle_connection(state, stream, id).await {
                tracing::debug!(connection = %id, error = %err, "connection ended with error");
            }
        });
    }
}

// Releases the connection's tunnel record on every exit path, normal close
// and error alike.
struct TunnelRelease {
    state: Arc<ProxyState>,
    id: Uuid,
}

impl Drop for TunnelRelease {
    fn drop(&mut self) {
        self.state.tunnels.release(self.id);
    }
}

async fn handle_connection(
    state: Arc<ProxyState>,
    mut client: TcpStream,
    id: Uuid,
) -> Result<(), ProxyError> {
    let mut parser = RequestParser::new();
    let mut temp = vec![0u8; 8192];

    loop {
        let n = client.read(&mut temp).await?;
        if n == 0 {
            return Ok(());
        }

        // Drain every message already buffered before blocking on the
        // socket again; pipelined requests can arrive in one segment.
        let mut status = parser.push(&temp[..n]);
        loop {
            match status {
                ParseStatus::NeedMore => break,
                ParseStatus::Error { error } => {
                    return Err(ProxyError::Runtime(format!("request parse error {error:?}")));
                }
                ParseStatus::Complete { message } => {
                    if message.line.method.eq_ignore_ascii_case("CONNECT") {
                        let authority = message.line.target.clone();
                        return handle_connect(state, client, authority, id).await;
                    }
                    if !handle_plain_request(&state, &mut client, &message).await? {
                        return Ok(());
                    }
                    status = parser.push(&[]);
                }
            }
        }
    }
}

async fn handle_plain_request<C>(
    state: &ProxyState,
    client: &mut C,
    message: &Request,
) -> Result<bool, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port, path) = resolve_target(message)?;
    let url = plain_url(&host, port, &path);
    tracing::debug!(%url, "proxying http request");

    match rewrite::filter_http_request(&state.rule, &url, &state.config.intercept)? {
        RewriteAction::Redirect(location) => {
            tracing::debug!(from = %url, to = %location, "redirecting matched request");
            let response = format!(
                "HTTP/1.1 302 Found\r\nConnection: close\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n"
            );
            client.write_all(response.as_bytes()).await?;
            client.flush().await?;
            Ok(false)
        }
        RewriteAction::PassThrough => {
            let route = router::plan_route(
                &host,
                port,
                &state.config.intercept,
                state.upstream_http.as_ref(),
            );
            let absolute = matches!(route, Route::Chained(_));
            let mut upstream = router::open_plain(&route, &host, port).await?;

            let request_bytes = serialize_request(message, &host, port, &path, absolute);
            upstream.write_all(&request_bytes).await?;
            upstream.flush().await?;

            let response_bytes = read_response_bytes(&mut upstream).await?;
            client.write_all(&response_bytes).await?;
            client.flush().await?;
            Ok(true)
        }
    }
}

async fn handle_connect(
    state: Arc<ProxyState>,
    mut client: TcpStream,
    authority: String,
    id: Uuid,
) -> Result<(), ProxyError> {
    tracing::debug!(connection = %id, target = %authority, "intercepting connect request");

    // Recorded before any tunneled request can arrive; path-only requests
    // on this connection are resolved against it.
    state.tunnels.record(id, &authority);

    let (host, port) = split_host_port(&authority, 443)?;
    let route = router::plan_route(
        &host,
        port,
        &state.config.intercept,
        state.upstream_http.as_ref(),
    );
    let upstream = router::open_tunnel(&route, &host, port).await?;

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    client.flush().await?;

    let leaf = {
        let mut cache = state.leaf_cache.lock().await;
        match cache.fetch(&host) {
            Some(cert) => cert,
            None => {
                let cert = generate_leaf_cert(&host, &state.ca)
                    .map_err(|err| ProxyError::Runtime(err.message))?;
                cache
                    .store(&host, &cert)
                    .map_err(|err| ProxyError::Runtime(err.message))?;
                cert
            }
        }
    };

    let acceptor = build_acceptor(&leaf).map_err(|err| ProxyError::Runtime(err.message))?;
    let ssl = openssl::ssl::Ssl::new(acceptor.context())
        .map_err(|err| ProxyError::Runtime(err.to_string()))?;
    let mut tls_client = tokio_openssl::SslStream::new(ssl, client)
        .map_err(|err| ProxyError::Runtime(err.to_string()))?;
    std::pin::Pin::new(&mut tls_client)
        .accept()
        .await
        .map_err(|err| ProxyError::Runtime(err.to_string()))?;

    let ssl = state
        .connector
        .configure()
        .and_then(|config| config.into_ssl(&host))
        .map_err(|err| ProxyError::Runtime(err.to_string()))?;
    let mut tls_upstream = tokio_openssl::SslStream::new(ssl, upstream)
        .map_err(|err| ProxyError::Runtime(err.to_string()))?;
    std::pin::Pin::new(&mut tls_upstream)
        .connect()
        .await
        .map_err(|err| ProxyError::Runtime(err.to_string()))?;

    serve_tunnel(state, tls_client, tls_upstream, id).await
}

async fn serve_tunnel<C, U>(
    state: Arc<ProxyState>,
    mut client: C,
    mut upstream: U,
    id: Uuid,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut parser = RequestParser::new();
    let mut temp = vec![0u8; 8192];

    loop {
        let n = client.read(&mut temp).await?;
        if n == 0 {
            return Ok(());
        }

        let mut status = parser.push(&temp[..n]);
        loop {
            match status {
                ParseStatus::NeedMore => break,
                ParseStatus::Error { error } => {
                    return Err(ProxyError::Runtime(format!("request parse error {error:?}")));
                }
                ParseStatus::Complete { message } => {
                    if message.line.method.eq_ignore_ascii_case("CONNECT") {
                        return Err(ProxyError::Runtime(
                            "CONNECT inside an established tunnel".to_string(),
                        ));
                    }
                    let keep_going =
                        handle_tunneled_request(&state, &mut client, &mut upstream, &message, id)
                            .await?;
                    if !keep_going {
                        return Ok(());
                    }
                    status = parser.push(&[]);
                }
            }
        }
    }
}

async fn handle_tunneled_request<C, U>(
    state: &ProxyState,
    client: &mut C,
    upstream: &mut U,
    message: &Request,
    id: Uuid,
) -> Result<bool, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let prefix = state.tunnels.lookup(id).ok_or_else(|| {
        ProxyError::TunnelState(format!("no CONNECT recorded for connection {id}"))
    })?;
    let resolved = rewrite::resolve_tunneled_url(&prefix, &message.line.target);
    let final_url = rewrite::substitute_url(&resolved, &state.config.intercept)?;
    tracing::debug!(connection = %id, url = %resolved, "proxying https request");

    let host = prefix.trim_start_matches("https://");
    let request_bytes = serialize_request(message, host, 443, &message.line.target, false);
    upstream.write_all(&request_bytes).await?;
    upstream.flush().await?;
    let response_bytes = read_response_bytes(upstream).await?;

    if state.rule.matches(&final_url) {
        tracing::debug!(url = %final_url, "replacing response with local fetch");
        let substitute = state.fetcher.fetch(&final_url).await?;
        client.write_all(&substitute).await?;
        client.flush().await?;
        // The substitute says Connection: close; end the tunnel here.
        Ok(false)
    } else {
        client.write_all(&response_bytes).await?;
        client.flush().await?;
        Ok(true)
    }
}

async fn read_response_bytes<S>(stream: &mut S) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut parser = ResponseParser::new();
    let mut raw = Vec::new();
    let mut temp = vec![0u8; 8192];

    loop {
        let n = stream.read(&mut temp).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&temp[..n]);
        match parser.push(&temp[..n]) {
            ParseStatus::NeedMore => continue,
            ParseStatus::Complete { .. } => {
                // Anything past the end of the message is not part of this
                // response and must not reach the client.
                raw.truncate(raw.len() - parser.buffered());
                break;
            }
            ParseStatus::Error { error } => {
                return Err(ProxyError::Runtime(format!(
                    "response parse error {error:?}"
                )));
            }
        }
    }

    if raw.is_empty() {
        return Err(ProxyError::Runtime(
            "empty response from upstream".to_string(),
        ));
    }
    Ok(raw)
}

fn resolve_target(request: &Request) -> Result<(String, u16, String), ProxyError> {
    let target = &request.line.target;

    if target.starts_with("http://") || target.starts_with("https://") {
        let parsed = url::Url::parse(target)
            .map_err(|err| ProxyError::Route(format!("malformed target {target}: {err}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::Route(format!("target {target} has no host")))?
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        return Ok((host, port, path));
    }

    let host_header = request
        .header("host")
        .ok_or_else(|| ProxyError::Route("request has no Host header".to_string()))?;
    let (host, port) = split_host_port(host_header, 80)?;
    Ok((host, port, target.clone()))
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                ProxyError::Route(format!("invalid port in authority {authority}"))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

fn plain_url(host: &str, port: u16, path: &str) -> String {
    if port == 80 {
        format!("http://{host}{path}")
    } else {
        format!("http://{host}:{port}{path}")
    }
}

// Re-serializes a parsed request for the upstream: origin form for direct
// connections, absolute form when chaining through an upstream proxy.
// Hop-by-hop Proxy-Connection is dropped; a Host header is added if the
// client sent none. The parser has already decoded the body, so the
// original framing headers are replaced with a Content-Length matching
// the bytes actually sent.
fn serialize_request(
    request: &Request,
    host: &str,
    port: u16,
    path: &str,
    absolute: bool,
) -> Vec<u8> {
    let target = if absolute {
        plain_url(host, port, path)
    } else {
        path.to_string()
    };

    let mut bytes = Vec::new();
    bytes.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            request.line.method,
            target,
            request.line.version.as_str()
        )
        .as_bytes(),
    );

    let mut has_host = false;
    let mut had_body_framing = false;
    for header in &request.headers {
        if header.is("host") {
            has_host = true;
        }
        if header.is("proxy-connection") {
            continue;
        }
        if header.is("content-length") || header.is("transfer-encoding") {
            had_body_framing = true;
            continue;
        }
        bytes.extend_from_slice(header.raw_name.as_bytes());
        bytes.extend_from_slice(b": ");
        bytes.extend_from_slice(header.value.as_bytes());
        bytes.extend_from_slice(b"\r\n");
    }
    if !has_host {
        bytes.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    }
    if had_body_framing || !request.body.is_empty() {
        bytes.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
    }
    bytes.extend_from_slice(b"\r\n");
    bytes.extend_from_slice(&request.body);
    bytes
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::AsyncWriteExt;

    use super::{plain_url, read_response_bytes, resolve_target, serialize_request, split_host_port};
    use crate::ProxyError;
    use inloop_net::{ParseStatus, RequestParser};

    fn parse(raw: &[u8]) -> inloop_net::Request {
        let mut parser = RequestParser::new();
        match parser.push(raw) {
            ParseStatus::Complete { message } => message,
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn resolves_absolute_form_target() {
        let request = parse(b"GET http://example.com:8081/a/b?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let (host, port, path) = resolve_target(&request).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8081);
        assert_eq!(path, "/a/b?q=1");
    }

    #[test]
    fn resolves_origin_form_via_host_header() {
        let request = parse(b"GET /a HTTP/1.1\r\nHost: example.com:8081\r\n\r\n");
        let (host, port, path) = resolve_target(&request).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8081);
        assert_eq!(path, "/a");
    }

    #[test]
    fn missing_host_is_a_route_error() {
        let request = parse(b"GET /a HTTP/1.1\r\nAccept: */*\r\n\r\n");
        assert_matches!(resolve_target(&request), Err(ProxyError::Route(_)));
    }

    #[test]
    fn invalid_authority_port_is_a_route_error() {
        assert_matches!(
            split_host_port("example.com:not-a-port", 443),
            Err(ProxyError::Route(_))
        );
    }

    #[test]
    fn plain_url_omits_default_port() {
        assert_eq!(plain_url("example.com", 80, "/a"), "http://example.com/a");
        assert_eq!(
            plain_url("example.com", 8081, "/a"),
            "http://example.com:8081/a"
        );
    }

    #[test]
    fn serializes_origin_form_and_strips_proxy_connection() {
        let request = parse(
            b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
        );
        let bytes = serialize_request(&request, "example.com", 80, "/a", false);
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("GET /a HTTP/1.1\r\n"));
        assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
        assert!(text.contains("Host: example.com\r\n"));
    }

    #[test]
    fn serializes_absolute_form_for_chained_route() {
        let request = parse(b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let bytes = serialize_request(&request, "example.com", 80, "/a", true);
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("GET http://example.com/a HTTP/1.1\r\n"));
    }

    #[test]
    fn chunked_request_is_reframed_with_content_length() {
        let request = parse(
            b"POST /upload HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        let bytes = serialize_request(&request, "example.com", 80, "/upload", false);
        let text = String::from_utf8(bytes).unwrap();

        assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn content_length_matches_the_decoded_body() {
        let request =
            parse(b"POST /upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello");
        let bytes = serialize_request(&request, "example.com", 80, "/upload", false);
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(text.matches("Content-Length:").count(), 1);
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn response_relay_excludes_bytes_past_the_message() {
        let (mut server, mut upstream) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhellojunk-after-response")
            .await
            .unwrap();

        let bytes = read_response_bytes(&mut upstream).await.unwrap();

        assert_eq!(
            bytes,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec()
        );
    }

    #[test]
    fn adds_host_header_when_missing() {
        let request = parse(b"GET /a HTTP/1.1\r\nAccept: */*\r\n\r\n");
        let bytes = serialize_request(&request, "example.com", 80, "/a", false);
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains("Host: example.com\r\n"));
    }
}
