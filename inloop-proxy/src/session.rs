use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use inloop_net::{LeafCache, build_insecure_connector, load_or_generate_ca};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::fetch::SubstituteFetcher;
use crate::proxy::{self, ProxyState};
use crate::rewrite::RewriteRule;
use crate::tunnel::TunnelMap;
use crate::upstream::UpstreamSnapshot;

const LEAF_CACHE_CAPACITY: usize = 64;

/// Owns the listener lifecycle and the process proxy environment.
///
/// `start` binds an ephemeral loopback port, spawns the accept loop, and
/// points the process's proxy variables at it; `stop` tears the loop down
/// and puts the captured variables back. The inner lock serializes both
/// against each other and against restarts.
pub struct ProxySession {
    config: ProxyConfig,
    inner: Mutex<Option<ActiveSession>>,
}

struct ActiveSession {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    snapshot: UpstreamSnapshot,
}

impl ProxySession {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Starts the session, restarting it if one is already running. The
    /// previous session is shut down first so the environment capture sees
    /// the original values, never our own installation.
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.take() {
            shutdown(active);
        }

        let snapshot = UpstreamSnapshot::capture();

        // Everything fallible happens before the listener goes live, so a
        // failed start leaves no task running and no environment changes.
        let rule = RewriteRule::from_config(&self.config.rewrite)?;
        let ca = load_or_generate_ca(&self.config.tls.ca_cert_dir, &self.config.tls.ca_common_name)
            .map_err(|err| ProxyError::Init(err.message))?;
        let leaf_cache =
            LeafCache::with_disk_dir(LEAF_CACHE_CAPACITY, &self.config.tls.leaf_cert_dir);
        let connector = build_insecure_connector().map_err(|err| ProxyError::Init(err.message))?;
        let fetch_connector =
            build_insecure_connector().map_err(|err| ProxyError::Init(err.message))?;
        let fetcher = SubstituteFetcher::new(
            fetch_connector,
            Duration::from_secs(self.config.fetch_timeout_secs),
        );

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| ProxyError::Init(format!("unable to bind listener: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| ProxyError::Init(err.to_string()))?;

        let state = Arc::new(ProxyState {
            config: self.config.clone(),
            rule,
            ca,
            leaf_cache: Mutex::new(leaf_cache),
            tunnels: TunnelMap::default(),
            fetcher,
            connector,
            upstream_http: snapshot.http_proxy().cloned(),
        });

        let accept_task = tokio::spawn(proxy::accept_loop(listener, state));
        UpstreamSnapshot::install(local_addr);
        tracing::debug!(%local_addr, "proxy enabled");

        *inner = Some(ActiveSession {
            local_addr,
            accept_task,
            snapshot,
        });
        Ok(local_addr)
    }

    /// Stops the session and restores the captured proxy environment.
    /// Calling it when nothing is running is a no-op.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.take() {
            shutdown(active);
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.as_ref().map(|active| active.local_addr)
    }
}

fn shutdown(active: ActiveSession) {
    active.accept_task.abort();
    active.snapshot.restore();
    tracing::debug!(local_addr = %active.local_addr, "proxy disabled");
}
