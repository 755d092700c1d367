//! Source hypervisor interface.

use crate::EndpointResult;
use async_trait::async_trait;
use migration_types::{Instance, Network};

/// Connection to one source hypervisor environment.
///
/// Implementations wrap a vendor SDK client. They must be cheap to share
/// behind an `Arc` and safe to call concurrently.
#[async_trait]
pub trait SourceEndpoint: Send + Sync {
    /// Name of the source in the catalog.
    fn name(&self) -> &str;

    /// Establishes (or verifies) the connection.
    async fn connect(&self) -> EndpointResult<()>;

    /// Lists every virtual network known to the source.
    async fn get_all_networks(&self) -> EndpointResult<Vec<Network>>;

    /// Lists every VM known to the source.
    ///
    /// Returned instances carry their source identity and properties; the
    /// migration fields are left at their defaults.
    async fn get_all_vms(&self) -> EndpointResult<Vec<Instance>>;

    /// Powers on the VM at the given inventory location.
    async fn power_on_vm(&self, location: &str) -> EndpointResult<()>;
}
