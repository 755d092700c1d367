use super::{encode, Tx};
use crate::error::{StoreError, StoreResult};
use migration_types::{Artifact, ArtifactType, Instance, SourceType};
use rusqlite::params;
use uuid::Uuid;

impl Tx<'_> {
    pub fn create_artifact(&self, artifact: &Artifact) -> StoreResult<()> {
        if self.get_artifact(artifact.uuid)?.is_some() {
            return Err(StoreError::already_exists("artifact", artifact.uuid));
        }

        self.execute(
            "INSERT INTO artifacts (uuid, artifact_type, data) VALUES (?1, ?2, ?3)",
            params![
                artifact.uuid.to_string(),
                artifact.artifact_type.as_str(),
                encode(artifact)?
            ],
        )?;
        Ok(())
    }

    pub fn get_artifact(&self, uuid: Uuid) -> StoreResult<Option<Artifact>> {
        self.query_one(
            "SELECT data FROM artifacts WHERE uuid = ?1",
            params![uuid.to_string()],
        )
    }

    pub fn get_artifacts_by_type(&self, artifact_type: ArtifactType) -> StoreResult<Vec<Artifact>> {
        self.query_all(
            "SELECT data FROM artifacts WHERE artifact_type = ?1 ORDER BY uuid",
            params![artifact_type.as_str()],
        )
    }

    pub fn delete_artifact(&self, uuid: Uuid) -> StoreResult<()> {
        let deleted = self.execute(
            "DELETE FROM artifacts WHERE uuid = ?1",
            params![uuid.to_string()],
        )?;
        if deleted == 0 {
            return Err(StoreError::not_found("artifact", uuid));
        }
        Ok(())
    }

    pub fn find_worker_artifact(&self) -> StoreResult<Option<Artifact>> {
        Ok(self
            .get_artifacts_by_type(ArtifactType::Worker)?
            .into_iter()
            .next())
    }

    pub fn find_sdk_artifact(&self, source_type: SourceType) -> StoreResult<Option<Artifact>> {
        Ok(self
            .get_artifacts_by_type(ArtifactType::Sdk)?
            .into_iter()
            .find(|a| a.source_type == Some(source_type)))
    }

    /// Driver ISO matching the guest OS and architecture of `instance`.
    pub fn find_driver_iso(&self, instance: &Instance) -> StoreResult<Option<Artifact>> {
        let props = &instance.properties;
        Ok(self
            .get_artifacts_by_type(ArtifactType::DriverIso)?
            .into_iter()
            .find(|a| {
                (a.supports_os(props.os_type.as_str()) || a.supports_os(&props.os))
                    && a.supports_architecture(&props.architecture)
            }))
    }

    /// OS image matching OS, architecture and version of an appliance `instance`.
    pub fn find_os_image(&self, instance: &Instance) -> StoreResult<Option<Artifact>> {
        let props = &instance.properties;
        Ok(self
            .get_artifacts_by_type(ArtifactType::OsImage)?
            .into_iter()
            .find(|a| {
                a.supports_os(&props.os)
                    && a.supports_architecture(&props.architecture)
                    && a.supports_version(&props.os_version)
            }))
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Store;
    use migration_types::{
        Artifact, ArtifactType, Instance, InstanceProperties, OsType, SourceType,
    };
    use uuid::Uuid;

    fn windows(arch: &str) -> Instance {
        Instance::new(
            Uuid::new_v4(),
            "vcenter",
            SourceType::Vmware,
            InstanceProperties {
                name: "win01".into(),
                os: "Microsoft Windows Server 2022".into(),
                os_type: OsType::Windows,
                architecture: arch.into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_driver_iso_matches_architecture() {
        let store = Store::open_in_memory().unwrap();
        let mut iso = Artifact::new(ArtifactType::DriverIso);
        iso.os = Some("windows".into());
        iso.architectures = vec!["x86_64".into()];
        store.transaction(|tx| tx.create_artifact(&iso)).unwrap();

        let found = store
            .transaction(|tx| tx.find_driver_iso(&windows("x86_64")))
            .unwrap();
        assert_eq!(found.map(|a| a.uuid), Some(iso.uuid));

        let missing = store
            .transaction(|tx| tx.find_driver_iso(&windows("aarch64")))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_sdk_keyed_by_source_type() {
        let store = Store::open_in_memory().unwrap();
        let mut sdk = Artifact::new(ArtifactType::Sdk);
        sdk.source_type = Some(SourceType::Vmware);
        store.transaction(|tx| tx.create_artifact(&sdk)).unwrap();

        assert!(store
            .transaction(|tx| tx.find_sdk_artifact(SourceType::Vmware))
            .unwrap()
            .is_some());
        assert!(store
            .transaction(|tx| tx.find_sdk_artifact(SourceType::Nsx))
            .unwrap()
            .is_none());
        assert!(store.transaction(|tx| tx.find_worker_artifact()).unwrap().is_none());
    }
}
