use clap::Parser;
use std::path::{Path, PathBuf};

use inloop_proxy::{
    InterceptTarget, ProxyConfig, ProxySession, RewriteConfig, RewritePatternType,
};

#[derive(Debug, Parser)]
#[command(name = "inloop-proxy-cli")]
struct Cli {
    /// Host requests matching the pattern are redirected to.
    #[arg(long = "target-host", default_value = "127.0.0.1")]
    target_host: String,

    #[arg(long = "target-port", default_value_t = 8080)]
    target_port: u16,

    /// Reach the target over HTTPS instead of plain HTTP.
    #[arg(long = "target-https")]
    target_https: bool,

    /// Substring a request URL must contain to be intercepted.
    #[arg(long = "marker", default_value = "/rest/gadgets/")]
    marker: String,

    /// Regex matched against the full request URL; overrides --marker.
    #[arg(long = "pattern")]
    pattern: Option<String>,

    #[arg(long = "certs-dir", default_value = "certs")]
    certs_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let leaf_dir = cli.certs_dir.join("leaf");
    ensure_dir(&cli.certs_dir)?;
    ensure_dir(&leaf_dir)?;

    let mut config = ProxyConfig::default();
    config.intercept = InterceptTarget {
        address: cli.target_host,
        port: cli.target_port,
        use_https: cli.target_https,
    };
    config.rewrite = match cli.pattern {
        Some(pattern) => RewriteConfig {
            pattern_type: RewritePatternType::Regex,
            pattern,
        },
        None => RewriteConfig {
            pattern_type: RewritePatternType::Marker,
            pattern: cli.marker,
        },
    };
    config.tls.ca_cert_dir = cli.certs_dir.to_string_lossy().into_owned();
    config.tls.leaf_cert_dir = leaf_dir.to_string_lossy().into_owned();

    let session = ProxySession::new(config);
    let addr = session.start().await.map_err(|err| err.to_string())?;
    println!("intercepting on {addr}");

    tokio::signal::ctrl_c().await.map_err(|err| err.to_string())?;
    session.stop().await;

    Ok(())
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    std::fs::create_dir_all(path).map_err(|err| err.to_string())
}
