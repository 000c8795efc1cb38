mod acknowledged_message;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver, AcknowledgmentSender},
    worker_handle::{WorkerHandle, WorkerHandleListener},
};

use crate::error::{Error, Result};

/// Spawn a task in the background to run a future. Must be called from within a tokio
/// runtime.
pub(crate) fn execute<F, O>(fut: F)
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    let _ = tokio::task::spawn(fut);
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::network_timeout())
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
