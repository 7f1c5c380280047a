use async_trait::async_trait;
use centauri_core::{CentauriError, RouteSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback invoked with each newly loaded route set; wired to the route
/// manager's `set_routes`.
pub type Apply = Arc<
    dyn Fn(RouteSet) -> Pin<Box<dyn Future<Output = Result<(), CentauriError>> + Send>>
        + Send
        + Sync,
>;

/// Delivers route sets to the proxy, either once or repeatedly.
#[async_trait]
pub trait ConfigSource: Send {
    /// Starts delivering configuration. Errors that occur after startup are
    /// reported through the error channel.
    async fn start(
        &mut self,
        apply: Apply,
        err_tx: mpsc::Sender<CentauriError>,
    ) -> Result<(), CentauriError>;

    /// Stops the source's worker.
    async fn stop(&mut self);

    /// Requests that the source re-deliver its configuration, where
    /// supported.
    fn reload(&self);

    /// Parses the configuration without applying it, where supported.
    async fn validate(&self) -> Result<(), CentauriError>;
}
