use anyhow::bail;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, trace};

/// Spawns a future with tracing instrumentation, logging how it finished.
pub fn spawn(
    span: tracing::Span,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    let fut = async move {
        trace!("started");
        match fut.await {
            Ok(_) => trace!("finished"),
            Err(e) => {
                if e.is::<Cancelled>() {
                    trace!("cancelled")
                } else {
                    error!("finished with error: {:#}", e)
                }
            }
        }
    }
    .instrument(span);
    tokio::task::spawn(fut)
}

#[derive(Debug, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Like [`spawn`], but the future is dropped as soon as the token is cancelled.
pub fn spawn_with_cancel(
    span: tracing::Span,
    cancellation_token: CancellationToken,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    spawn(span, async move {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                bail!(Cancelled);
            },
            r = fut => r
        }
    })
}
