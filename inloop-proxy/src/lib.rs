mod config;
mod error;
mod fetch;
mod proxy;
mod rewrite;
mod router;
mod session;
mod tunnel;
mod upstream;

pub use config::{
    InterceptTarget, ProxyConfig, RewriteConfig, RewritePatternType, TlsMitmConfig,
};
pub use error::ProxyError;
pub use rewrite::{RewriteAction, RewriteRule};
pub use router::Route;
pub use session::ProxySession;
pub use upstream::{HostPort, UpstreamSnapshot};
