//! Deployment code run inside an executor.
//!
//! A [`ResourceHandler`] knows how to converge one entity type. Handlers are
//! looked up by [`ResourceId::entity_type`] in a [`HandlerRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::id::ResourceId;
use crate::report::{AttributeChange, LogLevel, LogLine};
use crate::resource::ResourceDetails;

/// Non-successful handler outcomes.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandlerError {
    /// Nothing to do right now; the resource is reported as skipped.
    #[error("skipped: {0}")]
    Skip(String),

    /// A dependency is not in the state this handler needs.
    #[error("skipped for dependency: {0}")]
    SkipForDependency(String),

    #[error("failed: {0}")]
    Failed(String),
}

/// Collects changes and log lines while a handler runs.
#[derive(Debug, Default)]
pub struct HandlerContext {
    changes: BTreeMap<String, AttributeChange>,
    logs: Vec<LogLine>,
}

impl HandlerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_change(&mut self, attribute: impl Into<String>, current: Value, desired: Value) {
        self.changes
            .insert(attribute.into(), AttributeChange { current, desired });
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogLine::new(level, message));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn changes(&self) -> &BTreeMap<String, AttributeChange> {
        &self.changes
    }

    pub fn into_parts(self) -> (BTreeMap<String, AttributeChange>, Vec<LogLine>) {
        (self.changes, self.logs)
    }
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Bring the resource in line with its attributes.
    async fn deploy(
        &self,
        ctx: &mut HandlerContext,
        resource: &ResourceDetails,
    ) -> Result<(), HandlerError>;

    /// Record the changes a deploy would make, without making them.
    async fn dry_run(
        &self,
        _ctx: &mut HandlerContext,
        _resource: &ResourceDetails,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn facts(&self, _resource: &ResourceDetails) -> Result<Map<String, Value>, HandlerError> {
        Ok(Map::new())
    }
}

#[async_trait]
impl<T: ResourceHandler + ?Sized> ResourceHandler for Arc<T> {
    async fn deploy(
        &self,
        ctx: &mut HandlerContext,
        resource: &ResourceDetails,
    ) -> Result<(), HandlerError> {
        (**self).deploy(ctx, resource).await
    }

    async fn dry_run(
        &self,
        ctx: &mut HandlerContext,
        resource: &ResourceDetails,
    ) -> Result<(), HandlerError> {
        (**self).dry_run(ctx, resource).await
    }

    async fn facts(&self, resource: &ResourceDetails) -> Result<Map<String, Value>, HandlerError> {
        (**self).facts(resource).await
    }
}

/// Handlers keyed by entity type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: impl Into<String>, handler: Arc<dyn ResourceHandler>) {
        self.handlers.insert(entity_type.into(), handler);
    }

    pub fn with(mut self, entity_type: impl Into<String>, handler: Arc<dyn ResourceHandler>) -> Self {
        self.register(entity_type, handler);
        self
    }

    pub fn handler_for(&self, id: &ResourceId) -> Option<Arc<dyn ResourceHandler>> {
        self.handlers.get(id.entity_type()).cloned()
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entity_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
