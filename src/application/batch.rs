//! All-or-nothing batch transfers.

use super::engine::{Posting, TransferEngine, post};
use crate::domain::ports::{UnitOfWork, UnitOfWorkBox};
use crate::domain::transaction::TransferRequest;
use crate::error::{BatchFailure, LedgerError};
use tracing::{debug, info, warn};

impl TransferEngine {
    /// Applies `requests` in order inside a single unit of work.
    ///
    /// Either every request is committed, or none is: the first request that is
    /// rejected or fails aborts the batch and rolls back the rows before it.
    /// Later rows see the balances left by earlier rows of the same batch.
    /// Rejections are never written to the transaction log here.
    pub async fn batch_transfer(&self, requests: &[TransferRequest]) -> Result<(), BatchFailure> {
        if requests.is_empty() {
            debug!("empty batch, nothing to apply");
            return Ok(());
        }
        self.with_retries(|| self.attempt_batch(requests)).await
    }

    async fn attempt_batch(&self, requests: &[TransferRequest]) -> Result<(), BatchFailure> {
        let timeout = self.config().transfer_timeout();
        // Commit runs outside the deadline, as for single transfers
        let uow = tokio::time::timeout(timeout, self.post_batch(requests))
            .await
            .map_err(|_| BatchFailure::unattributed(LedgerError::Timeout(timeout)))??;

        uow.commit().await.map_err(BatchFailure::unattributed)?;
        info!(rows = requests.len(), "batch committed");
        Ok(())
    }

    async fn post_batch(&self, requests: &[TransferRequest]) -> Result<UnitOfWorkBox, BatchFailure> {
        let mut uow = self.begin().await.map_err(BatchFailure::unattributed)?;

        for (row, request) in requests.iter().enumerate() {
            match post(&mut uow, request).await {
                Ok(Posting::Applied) => {}
                Ok(Posting::Rejected { error, .. }) | Err(error) => {
                    warn!(
                        row,
                        rows = requests.len(),
                        error = %error,
                        "batch aborted, rolling back"
                    );
                    return Err(BatchFailure::at_row(row, error));
                }
            }
        }
        Ok(uow)
    }
}
