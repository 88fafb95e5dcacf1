use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parcel_protocol::wire::write_response;
use parcel_protocol::{DEFAULT_PORT, ErrorKind, ServerResponse};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::handler::handle_connection;
use crate::rate::{Clock, RateLimiter, SystemClock};
use crate::state::SharedServerState;
use crate::{QUOTA_POLL_INTERVAL, ServerError};

/// How long a rejected connection is drained before it is dropped, so the
/// `ERROR:BUSY` line is not lost to a reset.
const BUSY_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// Listening port (0 = auto-assign).
    pub port: u16,
    /// Maximum concurrently served connections.
    pub max_clients: usize,
    /// Shared payload budget in bytes per second.
    pub rate_limit: u64,
    /// Directory that remote paths resolve under.
    pub root: PathBuf,
    /// Sleep between budget checks while the budget is spent.
    pub quota_poll: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_clients: 10,
            rate_limit: 1024 * 1024,
            root: PathBuf::from("."),
            quota_poll: QUOTA_POLL_INTERVAL,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_clients == 0 {
            return Err(ServerError::InvalidConfig(
                "max_clients must be at least 1".into(),
            ));
        }
        if self.rate_limit == 0 {
            return Err(ServerError::InvalidConfig(
                "rate limit must be at least 1 byte per second".into(),
            ));
        }
        if self.quota_poll.is_zero() {
            return Err(ServerError::InvalidConfig(
                "quota poll interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// The parcel transfer server.
///
/// Accepts connections until [`shutdown`](Self::shutdown) and serves each
/// admitted one on its own task.
pub struct TransferServer {
    config: ServerConfig,
    state: Arc<SharedServerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TransferServer {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a server whose rate window follows `clock`.
    pub fn with_clock(config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>, ServerError> {
        config.validate()?;

        let limiter =
            RateLimiter::with_clock(config.rate_limit, clock).with_poll_interval(config.quota_poll);
        let state = Arc::new(SharedServerState::new(limiter, config.max_clients));

        Ok(Arc::new(Self {
            config,
            state,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<SharedServerState> {
        &self.state
    }

    /// Stops accepting connections. [`serve`](Self::serve) returns once the
    /// connections already admitted have finished.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!(
            %local_addr,
            max_clients = self.config.max_clients,
            rate_limit = self.config.rate_limit,
            root = %self.config.root.display(),
            "parcel server listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.dispatch(stream, peer),
                        Err(e) => error!("accept error: {e}"),
                    }
                }
            }
        }

        drop(listener);
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(remaining = self.tracker.len(), "waiting for connections to finish");
        }
        self.tracker.wait().await;
        info!("server stopped");
        Ok(())
    }

    /// Admits `stream` and spawns its worker, or answers `ERROR:BUSY`.
    fn dispatch(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let Some(permit) = self.state.admission.try_admit() else {
            warn!(
                %peer,
                max_clients = self.config.max_clients,
                "at capacity, rejecting connection"
            );
            self.tracker.spawn(reject_busy(stream, peer));
            return;
        };

        debug!(%peer, active = self.state.admission.active(), "connection admitted");

        let server = Arc::clone(self);
        self.tracker.spawn(async move {
            // Held until the worker exits, on every path.
            let _permit = permit;
            match handle_connection(stream, peer, &server.state, &server.config.root).await {
                Ok(outcome) => debug!(%peer, ?outcome, "connection finished"),
                Err(e) => error!(%peer, "connection error: {e}"),
            }
        });
    }
}

async fn reject_busy(mut stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = write_response(&mut stream, &ServerResponse::Error(ErrorKind::Busy)).await {
        debug!(%peer, "failed to send BUSY: {e}");
        return;
    }
    if let Err(e) = stream.shutdown().await {
        debug!(%peer, "shutdown failed: {e}");
        return;
    }

    let mut sink = [0u8; 512];
    let drain = async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    };
    if tokio::time::timeout(BUSY_DRAIN_TIMEOUT, drain).await.is_err() {
        debug!(%peer, "rejected peer did not close in time");
    }
}
