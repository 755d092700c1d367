use super::{encode, Tx};
use crate::error::{StoreError, StoreResult};
use migration_types::{MigrationStatus, QueueEntry};
use rusqlite::params;
use uuid::Uuid;

impl Tx<'_> {
    /// Inserts a queue entry and moves the instance to the entry's status.
    ///
    /// The entry's token is recorded as issued; a token seen before is
    /// rejected.
    pub fn create_queue_entry(&self, entry: &QueueEntry) -> StoreResult<()> {
        if self.get_queue_entry(entry.instance_uuid)?.is_some() {
            return Err(StoreError::already_exists("queue entry", entry.instance_uuid));
        }

        let issued = self.count(
            "SELECT COUNT(*) FROM issued_tokens WHERE token = ?1",
            params![entry.secret_token.to_string()],
        )?;
        if issued > 0 {
            return Err(StoreError::already_exists("secret token", entry.secret_token));
        }

        self.execute(
            "INSERT INTO issued_tokens (token, instance_uuid) VALUES (?1, ?2)",
            params![
                entry.secret_token.to_string(),
                entry.instance_uuid.to_string()
            ],
        )?;
        self.execute(
            "INSERT INTO queue (instance_uuid, batch_name, migration_status, secret_token, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.instance_uuid.to_string(),
                entry.batch_name,
                entry.migration_status.as_str(),
                entry.secret_token.to_string(),
                encode(entry)?
            ],
        )?;

        self.sync_instance_status(entry)
    }

    pub fn get_queue_entry(&self, uuid: Uuid) -> StoreResult<Option<QueueEntry>> {
        self.query_one(
            "SELECT data FROM queue WHERE instance_uuid = ?1",
            params![uuid.to_string()],
        )
    }

    pub fn require_queue_entry(&self, uuid: Uuid) -> StoreResult<QueueEntry> {
        self.get_queue_entry(uuid)?
            .ok_or_else(|| StoreError::not_found("queue entry", uuid))
    }

    pub fn get_queue_entries_by_batch(&self, batch: &str) -> StoreResult<Vec<QueueEntry>> {
        self.query_all(
            "SELECT data FROM queue WHERE batch_name = ?1 ORDER BY instance_uuid",
            params![batch],
        )
    }

    pub fn get_queue_entries_by_status(&self, status: MigrationStatus) -> StoreResult<Vec<QueueEntry>> {
        self.query_all(
            "SELECT data FROM queue WHERE migration_status = ?1 ORDER BY instance_uuid",
            params![status.as_str()],
        )
    }

    pub fn get_queue_entries_by_batch_and_status(
        &self,
        batch: &str,
        status: MigrationStatus,
    ) -> StoreResult<Vec<QueueEntry>> {
        self.query_all(
            "SELECT data FROM queue WHERE batch_name = ?1 AND migration_status = ?2
             ORDER BY instance_uuid",
            params![batch, status.as_str()],
        )
    }

    pub fn count_queue_entries_by_batch_and_status(
        &self,
        batch: &str,
        status: MigrationStatus,
    ) -> StoreResult<usize> {
        self.count(
            "SELECT COUNT(*) FROM queue WHERE batch_name = ?1 AND migration_status = ?2",
            params![batch, status.as_str()],
        )
    }

    /// Writes `entry` back and mirrors its status onto the instance.
    ///
    /// Status changes the state machine forbids are refused.
    pub fn update_queue_entry(&self, entry: &QueueEntry) -> StoreResult<()> {
        let stored = self.require_queue_entry(entry.instance_uuid)?;
        if !stored
            .migration_status
            .can_transition_to(entry.migration_status)
        {
            return Err(StoreError::InvalidTransition {
                uuid: entry.instance_uuid,
                from: stored.migration_status,
                to: entry.migration_status,
            });
        }
        self.execute(
            "UPDATE queue SET batch_name = ?2, migration_status = ?3, data = ?4
             WHERE instance_uuid = ?1",
            params![
                entry.instance_uuid.to_string(),
                entry.batch_name,
                entry.migration_status.as_str(),
                encode(entry)?
            ],
        )?;

        self.sync_instance_status(entry)
    }

    /// Moves an entry (and its instance) to `status`.
    pub fn set_migration_status(
        &self,
        uuid: Uuid,
        status: MigrationStatus,
        message: &str,
    ) -> StoreResult<QueueEntry> {
        let mut entry = self.require_queue_entry(uuid)?;
        entry.migration_status = status;
        entry.migration_status_message = message.to_string();
        self.update_queue_entry(&entry)?;
        Ok(entry)
    }

    /// Removes every entry of `batch`, returning the removed entries.
    pub fn delete_queue_entries_by_batch(&self, batch: &str) -> StoreResult<Vec<QueueEntry>> {
        let entries = self.get_queue_entries_by_batch(batch)?;
        self.execute("DELETE FROM queue WHERE batch_name = ?1", params![batch])?;
        Ok(entries)
    }

    fn sync_instance_status(&self, entry: &QueueEntry) -> StoreResult<()> {
        let mut instance = self.require_instance(entry.instance_uuid)?;
        instance.migration_status = entry.migration_status;
        instance.migration_status_message = entry.migration_status_message.clone();
        if entry.last_worker_update.is_some() {
            instance.last_update_from_worker = entry.last_worker_update;
        }
        self.update_instance(&instance)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StoreError;
    use crate::store::Store;
    use migration_types::{
        Batch, Instance, InstanceProperties, MigrationStatus, QueueEntry, SourceType,
    };
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn seeded() -> (Store, Uuid) {
        let store = Store::open_in_memory().unwrap();
        let mut vm = Instance::new(
            Uuid::new_v4(),
            "vcenter",
            SourceType::Vmware,
            InstanceProperties {
                name: "web01".into(),
                ..Default::default()
            },
        );
        vm.batch = Some("wave-1".into());
        vm.migration_status = MigrationStatus::AssignedBatch;
        let uuid = vm.uuid;

        store
            .transaction(|tx| {
                tx.create_batch(&Batch::new("wave-1", "true"))?;
                tx.create_instance(&vm)
            })
            .unwrap();
        (store, uuid)
    }

    #[test]
    fn test_entry_and_instance_move_together() {
        let (store, uuid) = seeded();
        store
            .transaction(|tx| tx.create_queue_entry(&QueueEntry::new(uuid, "wave-1")))
            .unwrap();

        let instance = store.transaction(|tx| tx.require_instance(uuid)).unwrap();
        assert_eq!(instance.migration_status, MigrationStatus::Waiting);

        store
            .transaction(|tx| tx.set_migration_status(uuid, MigrationStatus::Creating, "Creating VM"))
            .unwrap();
        let instance = store.transaction(|tx| tx.require_instance(uuid)).unwrap();
        assert_eq!(instance.migration_status, MigrationStatus::Creating);
        assert_eq!(instance.migration_status_message, "Creating VM");

        let creating = store
            .transaction(|tx| tx.get_queue_entries_by_batch_and_status("wave-1", MigrationStatus::Creating))
            .unwrap();
        assert_eq!(creating.len(), 1);
    }

    #[test]
    fn test_token_never_reused() {
        let (store, uuid) = seeded();
        let entry = QueueEntry::new(uuid, "wave-1");
        store.transaction(|tx| tx.create_queue_entry(&entry)).unwrap();
        store
            .transaction(|tx| tx.delete_queue_entries_by_batch("wave-1"))
            .unwrap();

        let err = store
            .transaction(|tx| tx.create_queue_entry(&entry))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { kind: "secret token", .. }));
    }

    #[test]
    fn test_illegal_transition_changes_nothing() {
        let (store, uuid) = seeded();
        store
            .transaction(|tx| tx.create_queue_entry(&QueueEntry::new(uuid, "wave-1")))
            .unwrap();

        let err = store
            .transaction(|tx| tx.set_migration_status(uuid, MigrationStatus::Finished, ""))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let entry = store.transaction(|tx| tx.require_queue_entry(uuid)).unwrap();
        assert_eq!(entry.migration_status, MigrationStatus::Waiting);
    }
}
