use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::InterceptTarget;
use crate::error::ProxyError;
use crate::upstream::HostPort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Chained(HostPort),
}

// Destinations equal to the intercept target are always dialed directly:
// reaching the target through the very proxy that redirects to it would
// loop. Everything else chains through the captured upstream HTTP proxy
// when one exists.
pub fn plan_route(
    host: &str,
    port: u16,
    target: &InterceptTarget,
    upstream: Option<&HostPort>,
) -> Route {
    if target.matches(host, port) {
        return Route::Direct;
    }
    match upstream {
        Some(proxy) => Route::Chained(proxy.clone()),
        None => Route::Direct,
    }
}

// Connection for a plain-HTTP request. Chained requests are written to the
// upstream proxy itself, in absolute form, so this dials the proxy.
pub async fn open_plain(route: &Route, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    match route {
        Route::Direct => dial(host, port).await,
        Route::Chained(proxy) => dial(&proxy.host, proxy.port).await,
    }
}

// Connection for a CONNECT tunnel. Chained tunnels perform the CONNECT
// handshake against the upstream proxy before the stream is handed back;
// a refused handshake fails the connection with no retry.
pub async fn open_tunnel(route: &Route, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    match route {
        Route::Direct => dial(host, port).await,
        Route::Chained(proxy) => {
            let mut stream = dial(&proxy.host, proxy.port).await?;
            let handshake = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
            stream
                .write_all(handshake.as_bytes())
                .await
                .map_err(|err| ProxyError::Runtime(err.to_string()))?;
            read_connect_reply(&mut stream).await?;
            Ok(stream)
        }
    }
}

async fn dial(host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    TcpStream::connect((host, port))
        .await
        .map_err(|err| ProxyError::Runtime(format!("connect to {host}:{port} failed: {err}")))
}

const MAX_CONNECT_REPLY_BYTES: usize = 8 * 1024;

async fn read_connect_reply(stream: &mut TcpStream) -> Result<(), ProxyError> {
    let mut reply = Vec::new();
    let mut temp = [0u8; 1024];

    loop {
        let n = stream
            .read(&mut temp)
            .await
            .map_err(|err| ProxyError::Runtime(err.to_string()))?;
        if n == 0 {
            return Err(ProxyError::Runtime(
                "upstream proxy closed during CONNECT".to_string(),
            ));
        }
        reply.extend_from_slice(&temp[..n]);
        if reply.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
        if reply.len() > MAX_CONNECT_REPLY_BYTES {
            return Err(ProxyError::Runtime(
                "oversized CONNECT reply from upstream proxy".to_string(),
            ));
        }
    }

    let status = std::str::from_utf8(&reply)
        .ok()
        .and_then(|text| text.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::Runtime("malformed CONNECT reply".to_string()))?;

    if !(200..300).contains(&status) {
        return Err(ProxyError::Runtime(format!(
            "upstream proxy refused CONNECT: status {status}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Route, plan_route};
    use crate::config::InterceptTarget;
    use crate::upstream::HostPort;

    fn target() -> InterceptTarget {
        InterceptTarget {
            address: "jira.internal".to_string(),
            port: 8080,
            use_https: false,
        }
    }

    fn corp_proxy() -> HostPort {
        HostPort {
            host: "proxy.corp.example".to_string(),
            port: 3128,
        }
    }

    #[test]
    fn intercept_target_routes_direct_even_with_upstream() {
        let route = plan_route("jira.internal", 8080, &target(), Some(&corp_proxy()));
        assert_eq!(route, Route::Direct);
    }

    #[test]
    fn other_hosts_chain_through_upstream() {
        let route = plan_route("example.com", 80, &target(), Some(&corp_proxy()));
        assert_eq!(route, Route::Chained(corp_proxy()));
    }

    #[test]
    fn same_host_different_port_still_chains() {
        let route = plan_route("jira.internal", 9999, &target(), Some(&corp_proxy()));
        assert_eq!(route, Route::Chained(corp_proxy()));
    }

    #[test]
    fn no_upstream_means_direct() {
        let route = plan_route("example.com", 80, &target(), None);
        assert_eq!(route, Route::Direct);
    }
}
