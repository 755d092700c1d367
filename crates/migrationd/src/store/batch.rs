use super::{encode, Tx};
use crate::error::{StoreError, StoreResult};
use migration_types::{Batch, BatchStatus};
use rusqlite::params;

impl Tx<'_> {
    pub fn create_batch(&self, batch: &Batch) -> StoreResult<()> {
        if self.get_batch(&batch.name)?.is_some() {
            return Err(StoreError::already_exists("batch", &batch.name));
        }

        self.execute(
            "INSERT INTO batches (name, status, data) VALUES (?1, ?2, ?3)",
            params![batch.name, batch.status.as_str(), encode(batch)?],
        )?;
        Ok(())
    }

    pub fn get_batch(&self, name: &str) -> StoreResult<Option<Batch>> {
        self.query_one("SELECT data FROM batches WHERE name = ?1", params![name])
    }

    /// Like [`get_batch`](Self::get_batch), failing when absent.
    pub fn require_batch(&self, name: &str) -> StoreResult<Batch> {
        self.get_batch(name)?
            .ok_or_else(|| StoreError::not_found("batch", name))
    }

    pub fn get_batches(&self) -> StoreResult<Vec<Batch>> {
        self.query_all("SELECT data FROM batches ORDER BY name", [])
    }

    pub fn get_batches_by_status(&self, status: BatchStatus) -> StoreResult<Vec<Batch>> {
        self.query_all(
            "SELECT data FROM batches WHERE status = ?1 ORDER BY name",
            params![status.as_str()],
        )
    }

    /// Writes `batch` back; refuses status changes the lifecycle forbids.
    pub fn update_batch(&self, batch: &Batch) -> StoreResult<()> {
        let stored = self.require_batch(&batch.name)?;
        if !stored.status.can_transition_to(batch.status) {
            return Err(StoreError::InvalidBatchTransition {
                name: batch.name.clone(),
                from: stored.status,
                to: batch.status,
            });
        }

        self.execute(
            "UPDATE batches SET status = ?2, data = ?3 WHERE name = ?1",
            params![batch.name, batch.status.as_str(), encode(batch)?],
        )?;
        Ok(())
    }

    /// Sets status and message of a batch.
    pub fn set_batch_status(&self, name: &str, status: BatchStatus, message: &str) -> StoreResult<()> {
        let mut batch = self.require_batch(name)?;
        batch.status = status;
        batch.status_message = message.to_string();
        self.update_batch(&batch)
    }

    pub fn delete_batch(&self, name: &str) -> StoreResult<()> {
        let deleted = self.execute("DELETE FROM batches WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(StoreError::not_found("batch", name));
        }
        Ok(())
    }
}
