//! Teardown on user request.
//!
use std::{future::Future, io};

use tokio_util::sync::CancellationToken;

/// Cancel `cancel` once `signal` fires.
///
/// If the signal cannot be listened for, the pipeline keeps running and the error is logged.
pub async fn cancel_on_signal<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            log::info!("Shutting down");
            cancel.cancel();
        }
        Err(err) => log::error!("Unable to listen for ctrl-c, stop with SIGTERM: {err}"),
    }
}
