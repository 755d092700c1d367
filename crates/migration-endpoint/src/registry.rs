//! Construction of endpoint handles from catalog entries.

use crate::{EndpointError, EndpointResult, SourceEndpoint, TargetEndpoint};
use migration_types::{Source, SourceType, Target, TargetType};
use std::collections::HashMap;
use std::sync::Arc;

/// Creates endpoint handles for catalog entries.
///
/// Every call returns a fresh handle; target handles carry a selected
/// project, so concurrent work must not share one.
pub trait EndpointFactory: Send + Sync {
    fn source(&self, source: &Source) -> EndpointResult<Arc<dyn SourceEndpoint>>;

    fn target(&self, target: &Target) -> EndpointResult<Arc<dyn TargetEndpoint>>;
}

type SourceCtor = Box<dyn Fn(&Source) -> EndpointResult<Arc<dyn SourceEndpoint>> + Send + Sync>;
type TargetCtor = Box<dyn Fn(&Target) -> EndpointResult<Arc<dyn TargetEndpoint>> + Send + Sync>;

/// Factory dispatching on the source/target type.
///
/// SDK client crates register a constructor per type at startup.
#[derive(Default)]
pub struct EndpointRegistry {
    sources: HashMap<SourceType, SourceCtor>,
    targets: HashMap<TargetType, TargetCtor>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<F>(&mut self, source_type: SourceType, ctor: F)
    where
        F: Fn(&Source) -> EndpointResult<Arc<dyn SourceEndpoint>> + Send + Sync + 'static,
    {
        log::info!("Registering source endpoint driver: {}", source_type);
        self.sources.insert(source_type, Box::new(ctor));
    }

    pub fn register_target<F>(&mut self, target_type: TargetType, ctor: F)
    where
        F: Fn(&Target) -> EndpointResult<Arc<dyn TargetEndpoint>> + Send + Sync + 'static,
    {
        log::info!("Registering target endpoint driver: {}", target_type);
        self.targets.insert(target_type, Box::new(ctor));
    }

    pub fn source_types(&self) -> impl Iterator<Item = &SourceType> {
        self.sources.keys()
    }

    pub fn target_types(&self) -> impl Iterator<Item = &TargetType> {
        self.targets.keys()
    }
}

impl EndpointFactory for EndpointRegistry {
    fn source(&self, source: &Source) -> EndpointResult<Arc<dyn SourceEndpoint>> {
        let ctor = self
            .sources
            .get(&source.source_type)
            .ok_or_else(|| EndpointError::Unsupported {
                kind: source.source_type.to_string(),
            })?;
        ctor(source)
    }

    fn target(&self, target: &Target) -> EndpointResult<Arc<dyn TargetEndpoint>> {
        let ctor = self
            .targets
            .get(&target.target_type)
            .ok_or_else(|| EndpointError::Unsupported {
                kind: target.target_type.to_string(),
            })?;
        ctor(target)
    }
}
