//! Application context holding the provider and allocator registries.
//!
//! Registration happens on a [`ServicesBuilder`] during startup. Once built,
//! [`PipelineServices`] only hands out shared references, so the registries
//! cannot change while jobs are running.

use crate::cluster::{self, AllocatorFactory, AllocatorRegistry};
use crate::error::Result;
use crate::pipeline::{PipelineStepProvider, ProviderRegistry};
use crate::steps;

#[derive(Debug, Default)]
pub struct ServicesBuilder {
    providers: ProviderRegistry,
    allocators: AllocatorRegistry,
}

impl ServicesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder with the built-in steps and allocators already registered.
    pub fn with_defaults() -> Result<Self> {
        let mut builder = Self::new();
        steps::register_defaults(&mut builder.providers)?;
        cluster::register_defaults(&mut builder.allocators);
        Ok(builder)
    }

    pub fn register_provider(&mut self, provider: PipelineStepProvider) -> Result<&mut Self> {
        self.providers.register(provider)?;
        Ok(self)
    }

    pub fn register_resource_allocator(
        &mut self,
        factory: impl AllocatorFactory + 'static,
    ) -> &mut Self {
        self.allocators.register(factory);
        self
    }

    pub fn build(self) -> PipelineServices {
        PipelineServices {
            providers: self.providers,
            allocators: self.allocators,
        }
    }
}

#[derive(Debug)]
pub struct PipelineServices {
    providers: ProviderRegistry,
    allocators: AllocatorRegistry,
}

impl PipelineServices {
    pub fn builder() -> ServicesBuilder {
        ServicesBuilder::new()
    }

    pub fn with_defaults() -> Result<Self> {
        Ok(ServicesBuilder::with_defaults()?.build())
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn allocators(&self) -> &AllocatorRegistry {
        &self.allocators
    }
}
