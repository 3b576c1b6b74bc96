use std::env;
use std::net::SocketAddr;

const HTTP_VARS: [&str; 2] = ["http_proxy", "HTTP_PROXY"];
const HTTPS_VARS: [&str; 2] = ["https_proxy", "HTTPS_PROXY"];
const NO_PROXY_VARS: [&str; 2] = ["no_proxy", "NO_PROXY"];

const ALL_VARS: [&str; 6] = [
    "http_proxy",
    "HTTP_PROXY",
    "https_proxy",
    "HTTPS_PROXY",
    "no_proxy",
    "NO_PROXY",
];

const LOOPBACK_EXCLUSIONS: &str = "localhost,127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

// Snapshot of the ambient proxy environment, taken once before the session
// overwrites it. Every variable is captured individually, casing included,
// so restoration puts back exactly what was there and nothing more.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamSnapshot {
    saved: Vec<(&'static str, Option<String>)>,
    http: Option<HostPort>,
    https: Option<HostPort>,
}

impl UpstreamSnapshot {
    pub fn capture() -> Self {
        let saved = ALL_VARS
            .iter()
            .map(|name| (*name, env::var(name).ok()))
            .collect();
        let http = read_var(&HTTP_VARS).as_deref().and_then(parse_proxy_value);
        let https = read_var(&HTTPS_VARS).as_deref().and_then(parse_proxy_value);
        Self { saved, http, https }
    }

    pub fn http_proxy(&self) -> Option<&HostPort> {
        self.http.as_ref()
    }

    pub fn https_proxy(&self) -> Option<&HostPort> {
        self.https.as_ref()
    }

    // Points the process's HTTP and HTTPS proxy settings at the local
    // listener, with loopback excluded so the interception target and the
    // listener itself are reached directly.
    pub fn install(listen: SocketAddr) {
        let proxy_url = format!("http://{listen}");
        for name in HTTP_VARS.iter().chain(&HTTPS_VARS) {
            write_var(name, Some(&proxy_url));
        }
        for name in &NO_PROXY_VARS {
            write_var(name, Some(LOOPBACK_EXCLUSIONS));
        }
    }

    // Restores each captured variable verbatim; variables the session
    // introduced are removed, never left behind under another casing.
    pub fn restore(&self) {
        for (name, value) in &self.saved {
            write_var(name, value.as_deref());
        }
    }
}

pub fn parse_proxy_value(value: &str) -> Option<HostPort> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if value.contains("://") {
        let parsed = url::Url::parse(value).ok()?;
        let host = parsed.host_str()?.to_string();
        let port = parsed.port_or_known_default()?;
        return Some(HostPort { host, port });
    }

    let (host, port) = value.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    if host.is_empty() {
        return None;
    }
    Some(HostPort {
        host: host.to_string(),
        port,
    })
}

fn read_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| env::var(name).ok())
}

fn write_var(name: &str, value: Option<&str>) {
    // Env mutation is process-global; callers serialize through the
    // session lock.
    match value {
        Some(value) => unsafe { env::set_var(name, value) },
        None => unsafe { env::remove_var(name) },
    }
}
