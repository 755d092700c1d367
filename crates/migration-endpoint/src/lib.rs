//! Interfaces to source and target hypervisor environments.
//!
//! The migration engine never talks to a hypervisor SDK directly. Every
//! external call goes through the traits in this crate, which keeps the
//! engine testable and the SDK clients swappable.
//!
//! - [`source`]: inventory reads and power control at the source
//! - [`target`]: capability discovery and VM lifecycle at the target
//! - [`definition`]: target VM definition built from an instance and placement
//! - [`post_migration`]: reconfiguration applied after the final sync
//! - [`registry`]: construction of endpoints from catalog entries
//!
//! # Example
//!
//! ```ignore
//! use migration_endpoint::{EndpointFactory, EndpointResult};
//!
//! async fn projects(factory: &dyn EndpointFactory, target: &Target) -> EndpointResult<Vec<String>> {
//!     let endpoint = factory.target(target)?;
//!     endpoint.connect().await?;
//!     Ok(endpoint.get_details().await?.projects.into_iter().collect())
//! }
//! ```

pub mod definition;
pub mod error;
pub mod post_migration;
pub mod registry;
pub mod source;
pub mod target;

pub use definition::{DefinitionRequest, Device, VmDefinition};
pub use error::{EndpointError, EndpointResult};
pub use post_migration::PostMigrationConfig;
pub use registry::{EndpointFactory, EndpointRegistry};
pub use source::SourceEndpoint;
pub use target::{TargetDetails, TargetEndpoint, TargetOperation};
