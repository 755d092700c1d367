use super::{encode, Tx};
use crate::error::{StoreError, StoreResult};
use migration_types::Instance;
use rusqlite::params;
use uuid::Uuid;

impl Tx<'_> {
    pub fn create_instance(&self, instance: &Instance) -> StoreResult<()> {
        if self.get_instance(instance.uuid)?.is_some() {
            return Err(StoreError::already_exists("instance", instance.uuid));
        }

        self.execute(
            "INSERT INTO instances (uuid, source, batch, migration_status, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                instance.uuid.to_string(),
                instance.source,
                instance.batch,
                instance.migration_status.as_str(),
                encode(instance)?
            ],
        )?;
        Ok(())
    }

    pub fn get_instance(&self, uuid: Uuid) -> StoreResult<Option<Instance>> {
        self.query_one(
            "SELECT data FROM instances WHERE uuid = ?1",
            params![uuid.to_string()],
        )
    }

    pub fn require_instance(&self, uuid: Uuid) -> StoreResult<Instance> {
        self.get_instance(uuid)?
            .ok_or_else(|| StoreError::not_found("instance", uuid))
    }

    pub fn get_instances(&self) -> StoreResult<Vec<Instance>> {
        self.query_all("SELECT data FROM instances ORDER BY uuid", [])
    }

    pub fn get_instances_by_batch(&self, batch: &str) -> StoreResult<Vec<Instance>> {
        self.query_all(
            "SELECT data FROM instances WHERE batch = ?1 ORDER BY uuid",
            params![batch],
        )
    }

    pub fn get_instances_by_source(&self, source: &str) -> StoreResult<Vec<Instance>> {
        self.query_all(
            "SELECT data FROM instances WHERE source = ?1 ORDER BY uuid",
            params![source],
        )
    }

    pub fn count_instances_by_batch(&self, batch: &str) -> StoreResult<usize> {
        self.count(
            "SELECT COUNT(*) FROM instances WHERE batch = ?1",
            params![batch],
        )
    }

    /// Writes `instance` back; refuses status changes the state machine forbids.
    pub fn update_instance(&self, instance: &Instance) -> StoreResult<()> {
        let stored = self.require_instance(instance.uuid)?;
        if !stored
            .migration_status
            .can_transition_to(instance.migration_status)
        {
            return Err(StoreError::InvalidTransition {
                uuid: instance.uuid,
                from: stored.migration_status,
                to: instance.migration_status,
            });
        }

        self.execute(
            "UPDATE instances SET source = ?2, batch = ?3, migration_status = ?4, data = ?5
             WHERE uuid = ?1",
            params![
                instance.uuid.to_string(),
                instance.source,
                instance.batch,
                instance.migration_status.as_str(),
                encode(instance)?
            ],
        )?;
        Ok(())
    }

    pub fn delete_instance(&self, uuid: Uuid) -> StoreResult<()> {
        if self.get_queue_entry(uuid)?.is_some() {
            return Err(StoreError::already_exists("queue entry", uuid));
        }

        let deleted = self.execute(
            "DELETE FROM instances WHERE uuid = ?1",
            params![uuid.to_string()],
        )?;
        if deleted == 0 {
            return Err(StoreError::not_found("instance", uuid));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StoreError;
    use crate::store::Store;
    use migration_types::{Instance, InstanceProperties, MigrationStatus, SourceType};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn instance(name: &str) -> Instance {
        Instance::new(
            Uuid::new_v4(),
            "vcenter",
            SourceType::Vmware,
            InstanceProperties {
                name: name.into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_batch_assignment_lookup() {
        let store = Store::open_in_memory().unwrap();
        let mut web = instance("web01");
        web.batch = Some("wave-1".into());
        web.migration_status = MigrationStatus::AssignedBatch;
        let db = instance("db01");

        store
            .transaction(|tx| {
                tx.create_instance(&web)?;
                tx.create_instance(&db)
            })
            .unwrap();

        let members = store
            .transaction(|tx| tx.get_instances_by_batch("wave-1"))
            .unwrap();
        assert_eq!(members, vec![web]);
        assert_eq!(
            store.transaction(|tx| tx.count_instances_by_batch("wave-1")).unwrap(),
            1
        );
        assert_eq!(
            store.transaction(|tx| tx.get_instances_by_source("vcenter")).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_status_skip_rejected() {
        let store = Store::open_in_memory().unwrap();
        let mut vm = instance("web01");
        store.transaction(|tx| tx.create_instance(&vm)).unwrap();

        vm.migration_status = MigrationStatus::Finished;
        let err = store.transaction(|tx| tx.update_instance(&vm)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }
}
