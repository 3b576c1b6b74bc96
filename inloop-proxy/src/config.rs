use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub intercept: InterceptTarget,
    pub rewrite: RewriteConfig,
    pub tls: TlsMitmConfig,
    pub fetch_timeout_secs: u64,
}

// The local endpoint matching requests are redirected or substituted to.
// Immutable once a session is started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterceptTarget {
    pub address: String,
    pub port: u16,
    pub use_https: bool,
}

impl InterceptTarget {
    pub fn scheme(&self) -> &'static str {
        if self.use_https { "https" } else { "http" }
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.address == host && self.port == port
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewriteConfig {
    pub pattern_type: RewritePatternType,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RewritePatternType {
    Marker,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsMitmConfig {
    pub ca_common_name: String,
    pub ca_cert_dir: String,
    pub leaf_cert_dir: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            intercept: InterceptTarget {
                address: "127.0.0.1".to_string(),
                port: 8080,
                use_https: false,
            },
            rewrite: RewriteConfig {
                pattern_type: RewritePatternType::Marker,
                pattern: "/rest/gadgets/".to_string(),
            },
            tls: TlsMitmConfig {
                ca_common_name: "Inloop Proxy CA".to_string(),
                ca_cert_dir: "certs".to_string(),
                leaf_cert_dir: "certs/leaf".to_string(),
            },
            fetch_timeout_secs: 30,
        }
    }
}
