use crate::error::ScanError;
use crate::store::ResultsStore;
use crate::types::Verdict;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Cloneable handle workers use to hand verdicts to the single store writer.
#[derive(Clone, Debug)]
pub struct ResultsSink {
    tx: mpsc::Sender<Verdict>,
}

impl ResultsSink {
    /// Queue a verdict for writing. Fails once the writer has stopped.
    pub async fn submit(&self, verdict: Verdict) -> Result<(), ScanError> {
        self.tx
            .send(verdict)
            .await
            .map_err(|_| ScanError::SinkClosed)
    }
}

/// Start the writer task that owns `store`.
///
/// The task drains verdicts until every [`ResultsSink`] clone is dropped and then
/// hands the store back. On a write error it cancels `cancel` so no further
/// candidates are started, and returns the error.
pub fn spawn_sink(
    mut store: ResultsStore,
    buffer: usize,
    cancel: CancellationToken,
) -> (ResultsSink, JoinHandle<Result<ResultsStore, ScanError>>) {
    let (tx, mut rx) = mpsc::channel::<Verdict>(buffer.max(1));
    let handle = tokio::spawn(async move {
        while let Some(verdict) = rx.recv().await {
            if let Err(e) = store.append(&verdict) {
                error!(error = %e, ip = %verdict.ip, "results store write failed, stopping scan");
                cancel.cancel();
                return Err(e);
            }
        }
        Ok(store)
    });
    (ResultsSink { tx }, handle)
}
