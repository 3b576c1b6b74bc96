use std::time::Duration;

use openssl::ssl::SslConnector;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use inloop_net::{ParseStatus, Response, ResponseParser};

use crate::error::ProxyError;

// Performs the plain GET against the intercept target that replaces a
// matched HTTPS response. The fetched status and body are substituted
// faithfully; only the framing headers are rewritten. Bounded by a timeout
// so a stalled target cannot hold its tunnel open forever.
pub struct SubstituteFetcher {
    connector: SslConnector,
    timeout: Duration,
}

impl SubstituteFetcher {
    pub fn new(connector: SslConnector, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, ProxyError> {
        let response = tokio::time::timeout(self.timeout, self.fetch_response(url))
            .await
            .map_err(|_| {
                ProxyError::SubstitutionFetch(format!("fetch of {url} timed out"))
            })??;
        Ok(substitute_bytes(
            response.line.status_code,
            &response.line.reason,
            &response.body,
        ))
    }

    async fn fetch_response(&self, url: &str) -> Result<Response, ProxyError> {
        let parsed = Url::parse(url)
            .map_err(|err| ProxyError::SubstitutionFetch(format!("malformed URL {url}: {err}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::SubstitutionFetch(format!("URL {url} has no host")))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ProxyError::SubstitutionFetch(format!("URL {url} has no port")))?;

        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        let host_header = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: {host_header}\r\nConnection: close\r\n\r\n");

        let stream = TcpStream::connect((host.as_str(), port)).await.map_err(|err| {
            ProxyError::SubstitutionFetch(format!("connect to {host}:{port} failed: {err}"))
        })?;

        if parsed.scheme() == "https" {
            let ssl = self
                .connector
                .configure()
                .and_then(|config| config.into_ssl(&host))
                .map_err(|err| ProxyError::SubstitutionFetch(err.to_string()))?;
            let mut tls = tokio_openssl::SslStream::new(ssl, stream)
                .map_err(|err| ProxyError::SubstitutionFetch(err.to_string()))?;
            std::pin::Pin::new(&mut tls)
                .connect()
                .await
                .map_err(|err| ProxyError::SubstitutionFetch(err.to_string()))?;
            exchange(tls, &request).await
        } else {
            exchange(stream, &request).await
        }
    }
}

async fn exchange<S>(mut stream: S, request: &str) -> Result<Response, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| ProxyError::SubstitutionFetch(err.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|err| ProxyError::SubstitutionFetch(err.to_string()))?;

    let mut parser = ResponseParser::new();
    let mut temp = vec![0u8; 8192];
    loop {
        let n = stream
            .read(&mut temp)
            .await
            .map_err(|err| ProxyError::SubstitutionFetch(err.to_string()))?;
        if n == 0 {
            return parser.finish().ok_or_else(|| {
                ProxyError::SubstitutionFetch("target closed before a full response".to_string())
            });
        }
        match parser.push(&temp[..n]) {
            ParseStatus::NeedMore => continue,
            ParseStatus::Complete { message } => return Ok(message),
            ParseStatus::Error { error } => {
                return Err(ProxyError::SubstitutionFetch(format!(
                    "target response parse error: {error:?}"
                )));
            }
        }
    }
}

fn substitute_bytes(status_code: u16, reason: &str, body: &[u8]) -> Vec<u8> {
    let mut bytes = format!(
        "HTTP/1.1 {status_code} {reason}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

#[cfg(test)]
mod tests {
    use super::substitute_bytes;

    #[test]
    fn substitute_carries_status_and_framing() {
        let bytes = substitute_bytes(200, "OK", b"gadget feed");
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\ngadget feed"));
    }

    #[test]
    fn non_2xx_status_is_substituted_faithfully() {
        let bytes = substitute_bytes(404, "Not Found", b"missing");
        assert!(bytes.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    }
}
