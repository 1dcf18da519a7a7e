//! Sidecar run loop shared by the built-in controllers
//!
//! Waits for the CSI driver socket with exponential backoff, then resyncs on a
//! fixed interval until cancelled. Losing the driver socket after the first
//! connection is fatal and stops the controller.

use crate::domain::ports::ControllerContext;
use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// =============================================================================
// CSI Endpoint
// =============================================================================

/// Unix socket of the CSI driver, from `--csi-address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiEndpoint {
    address: String,
    path: PathBuf,
}

impl CsiEndpoint {
    /// Accepts a bare path or a `unix://` URL
    pub fn parse(address: &str) -> Result<Self> {
        let path = match address.split_once("://") {
            Some(("unix", path)) => path,
            Some((scheme, _)) => {
                return Err(Error::Configuration(format!(
                    "--csi-address {:?}: unsupported scheme {:?}, only unix sockets are supported",
                    address, scheme
                )))
            }
            None => address,
        };
        if path.is_empty() {
            return Err(Error::Configuration("--csi-address must not be empty".into()));
        }

        Ok(Self {
            address: address.to_string(),
            path: PathBuf::from(path),
        })
    }

    /// Address as given on the command line
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open and immediately close a connection to the driver
    pub async fn dial(&self) -> io::Result<()> {
        UnixStream::connect(&self.path).await.map(drop)
    }

    fn connection_lost(&self, source: io::Error) -> Error {
        Error::CsiConnection {
            address: self.address.clone(),
            source,
        }
    }
}

// =============================================================================
// Sidecar Loop
// =============================================================================

/// Connection and resync settings of one controller
#[derive(Debug, Clone)]
pub struct SidecarLoop {
    endpoint: CsiEndpoint,
    retry_interval_start: Duration,
    retry_interval_max: Duration,
    resync: Duration,
}

impl SidecarLoop {
    pub fn new(endpoint: CsiEndpoint) -> Self {
        Self {
            endpoint,
            retry_interval_start: Duration::from_secs(1),
            retry_interval_max: Duration::from_secs(300),
            resync: Duration::from_secs(600),
        }
    }

    /// Bounds of the backoff used while waiting for the driver
    pub fn with_retry(mut self, start: Duration, max: Duration) -> Self {
        self.retry_interval_start = start;
        self.retry_interval_max = max;
        self
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    pub fn endpoint(&self) -> &CsiEndpoint {
        &self.endpoint
    }

    /// Wait until the driver accepts connections.
    ///
    /// Returns `false` when cancelled first.
    pub async fn wait_for_driver(&self, ctx: &ControllerContext) -> Result<bool> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_interval_start)
            .with_max_interval(self.retry_interval_max)
            .with_max_elapsed_time(None)
            .build();

        let dial = || async { self.endpoint.dial().await.map_err(backoff::Error::transient) };
        let notify = |err: io::Error, next: Duration| {
            warn!(
                controller = ctx.name(),
                address = self.endpoint.address(),
                "CSI driver not reachable: {}; retrying in {}",
                err,
                humantime::format_duration(next)
            );
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Ok(false),
            result = backoff::future::retry_notify(policy, dial, notify) => {
                result.map_err(|e| self.endpoint.connection_lost(e))?;
                Ok(true)
            }
        }
    }

    /// Connect, then call `on_resync` with an increasing generation every
    /// resync interval until `ctx` is cancelled
    pub async fn run<F>(&self, ctx: &ControllerContext, mut on_resync: F) -> Result<()>
    where
        F: FnMut(u64) + Send,
    {
        if self.resync.is_zero() {
            return Err(Error::Configuration(format!(
                "{}: resync interval must be greater than zero",
                ctx.name()
            )));
        }

        if !self.wait_for_driver(ctx).await? {
            info!(controller = ctx.name(), "Cancelled before CSI driver became reachable");
            return Ok(());
        }
        info!(
            controller = ctx.name(),
            address = self.endpoint.address(),
            "Connected to CSI driver"
        );

        let mut ticker = tokio::time::interval(self.resync);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut generation = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    info!(controller = ctx.name(), resyncs = generation, "Stopping controller");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.endpoint
                        .dial()
                        .await
                        .map_err(|e| self.endpoint.connection_lost(e))?;
                    generation += 1;
                    debug!(controller = ctx.name(), generation, "Resync");
                    on_resync(generation);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::UnixListener;
    use tokio_util::sync::CancellationToken;

    fn context(token: &CancellationToken) -> ControllerContext {
        ControllerContext::new("test", token.clone(), Arc::new(Configuration::default()))
    }

    fn fast_loop(path: &Path) -> SidecarLoop {
        SidecarLoop::new(CsiEndpoint::parse(path.to_str().unwrap()).unwrap())
            .with_retry(Duration::from_millis(5), Duration::from_millis(20))
            .with_resync(Duration::from_millis(10))
    }

    /// Accept connections forever so dials succeed
    fn serve(listener: UnixListener) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
    }

    #[test]
    fn test_parse_endpoint() {
        let endpoint = CsiEndpoint::parse("unix:///run/csi/socket").unwrap();
        assert_eq!(endpoint.path(), Path::new("/run/csi/socket"));
        assert_eq!(endpoint.address(), "unix:///run/csi/socket");

        let endpoint = CsiEndpoint::parse("/var/lib/csi.sock").unwrap();
        assert_eq!(endpoint.path(), Path::new("/var/lib/csi.sock"));

        assert_matches!(CsiEndpoint::parse("tcp://10.0.0.1:1234"), Err(Error::Configuration(_)));
        assert_matches!(CsiEndpoint::parse(""), Err(Error::Configuration(_)));
        assert_matches!(CsiEndpoint::parse("unix://"), Err(Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_resyncs_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("csi.sock");
        serve(UnixListener::bind(&path).unwrap());

        let token = CancellationToken::new();
        let ctx = context(&token);
        let sidecar = fast_loop(&path);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            sidecar
                .run(&ctx, move |generation| {
                    let _ = tx.send(generation);
                })
                .await
        });

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_waits_for_late_driver() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("csi.sock");

        let token = CancellationToken::new();
        let ctx = context(&token);
        let sidecar = fast_loop(&path);

        let waiter = tokio::spawn(async move { sidecar.wait_for_driver(&ctx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        serve(UnixListener::bind(&path).unwrap());

        let connected = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(connected);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_driver() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.sock");

        let token = CancellationToken::new();
        let ctx = context(&token);
        let sidecar = fast_loop(&path);

        let handle = tokio::spawn(async move { sidecar.run(&ctx, |_| {}).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_lost_driver_stops_loop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("csi.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let token = CancellationToken::new();
        let ctx = context(&token);
        let sidecar = fast_loop(&path);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            sidecar
                .run(&ctx, move |generation| {
                    let _ = tx.send(generation);
                })
                .await
        });

        // The backlog absorbs the first dials without an accept loop
        assert_eq!(rx.recv().await, Some(1));
        drop(listener);
        std::fs::remove_file(&path).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_matches!(result, Err(Error::CsiConnection { .. }));
    }

    #[tokio::test]
    async fn test_zero_resync_is_rejected() {
        let token = CancellationToken::new();
        let ctx = context(&token);
        let sidecar = SidecarLoop::new(CsiEndpoint::parse("/run/csi/socket").unwrap())
            .with_resync(Duration::ZERO);

        assert_matches!(sidecar.run(&ctx, |_| {}).await, Err(Error::Configuration(_)));
    }
}
