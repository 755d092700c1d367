use super::{encode, Tx};
use crate::error::{StoreError, StoreResult};
use migration_types::{Source, Target};
use rusqlite::params;

impl Tx<'_> {
    pub fn create_source(&self, source: &Source) -> StoreResult<()> {
        if self.get_source(&source.name)?.is_some() {
            return Err(StoreError::already_exists("source", &source.name));
        }

        self.execute(
            "INSERT INTO sources (name, data) VALUES (?1, ?2)",
            params![source.name, encode(source)?],
        )?;
        Ok(())
    }

    pub fn get_source(&self, name: &str) -> StoreResult<Option<Source>> {
        self.query_one("SELECT data FROM sources WHERE name = ?1", params![name])
    }

    pub fn get_sources(&self) -> StoreResult<Vec<Source>> {
        self.query_all("SELECT data FROM sources ORDER BY name", [])
    }

    pub fn create_target(&self, target: &Target) -> StoreResult<()> {
        if self.get_target(&target.name)?.is_some() {
            return Err(StoreError::already_exists("target", &target.name));
        }

        self.execute(
            "INSERT INTO targets (name, data) VALUES (?1, ?2)",
            params![target.name, encode(target)?],
        )?;
        Ok(())
    }

    pub fn get_target(&self, name: &str) -> StoreResult<Option<Target>> {
        self.query_one("SELECT data FROM targets WHERE name = ?1", params![name])
    }

    pub fn require_target(&self, name: &str) -> StoreResult<Target> {
        self.get_target(name)?
            .ok_or_else(|| StoreError::not_found("target", name))
    }

    pub fn get_targets(&self) -> StoreResult<Vec<Target>> {
        self.query_all("SELECT data FROM targets ORDER BY name", [])
    }

    pub fn update_target(&self, target: &Target) -> StoreResult<()> {
        let updated = self.execute(
            "UPDATE targets SET data = ?2 WHERE name = ?1",
            params![target.name, encode(target)?],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("target", &target.name));
        }
        Ok(())
    }
}
