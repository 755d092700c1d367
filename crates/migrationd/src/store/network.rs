use super::{encode, Tx};
use crate::error::StoreResult;
use migration_types::Network;
use rusqlite::params;

impl Tx<'_> {
    /// Inserts or replaces the network keyed by identifier and location.
    pub fn upsert_network(&self, network: &Network) -> StoreResult<()> {
        self.execute(
            "INSERT INTO networks (identifier, location, source, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (identifier, location) DO UPDATE SET source = ?3, data = ?4",
            params![
                network.identifier,
                network.location,
                network.source,
                encode(network)?
            ],
        )?;
        Ok(())
    }

    pub fn get_network(&self, identifier: &str, location: &str) -> StoreResult<Option<Network>> {
        self.query_one(
            "SELECT data FROM networks WHERE identifier = ?1 AND location = ?2",
            params![identifier, location],
        )
    }

    /// Finds the network a NIC of a `source` VM is attached to.
    pub fn find_network(&self, source: &str, identifier: &str) -> StoreResult<Option<Network>> {
        self.query_one(
            "SELECT data FROM networks WHERE source = ?1 AND identifier = ?2
             ORDER BY location LIMIT 1",
            params![source, identifier],
        )
    }

    pub fn get_networks_by_source(&self, source: &str) -> StoreResult<Vec<Network>> {
        self.query_all(
            "SELECT data FROM networks WHERE source = ?1 ORDER BY identifier, location",
            params![source],
        )
    }
}
