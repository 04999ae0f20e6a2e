//! Handlers shipped with the agent.
//!
//! Both the agent (for in-process executors) and the executor binary load the
//! same [`builtin_registry`], so a desired state behaves the same in either
//! executor mode.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use converge_core::{HandlerContext, HandlerError, HandlerRegistry, ResourceDetails, ResourceHandler};
use serde_json::{json, Map, Value};
use tracing::debug;

pub const FILE_TYPE: &str = "std::File";
pub const NULL_TYPE: &str = "std::Null";

pub fn builtin_registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(FILE_TYPE, Arc::new(FileHandler))
        .with(NULL_TYPE, Arc::new(NullHandler))
}

// ── std::File ───────────────────────────────────────────────────────

/// Keeps a file at `path` with exactly `content`.
pub struct FileHandler;

struct FileTarget {
    path: PathBuf,
    content: String,
}

impl FileTarget {
    fn from_resource(resource: &ResourceDetails) -> Result<Self, HandlerError> {
        let path = resource
            .attribute("path")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::Failed(format!("{} has no path attribute", resource.id)))?;
        let content = resource
            .attribute("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(Self {
            path: PathBuf::from(path),
            content: content.to_string(),
        })
    }

    async fn current(&self) -> Result<Option<String>, HandlerError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(current) => Ok(Some(current)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HandlerError::Failed(format!("cannot read {}: {e}", self.path.display()))),
        }
    }

    /// Record the difference; `true` when the file needs writing.
    async fn diff(&self, ctx: &mut HandlerContext) -> Result<bool, HandlerError> {
        let current = self.current().await?;
        if current.as_deref() == Some(self.content.as_str()) {
            return Ok(false);
        }
        ctx.record_change(
            "content",
            current.map(Value::String).unwrap_or(Value::Null),
            Value::String(self.content.clone()),
        );
        Ok(true)
    }
}

#[async_trait]
impl ResourceHandler for FileHandler {
    async fn deploy(&self, ctx: &mut HandlerContext, resource: &ResourceDetails) -> Result<(), HandlerError> {
        let target = FileTarget::from_resource(resource)?;
        if !target.diff(ctx).await? {
            debug!(path = %target.path.display(), "file already up to date");
            return Ok(());
        }
        if let Some(parent) = target.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HandlerError::Failed(format!("cannot create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&target.path, &target.content)
            .await
            .map_err(|e| HandlerError::Failed(format!("cannot write {}: {e}", target.path.display())))?;
        ctx.info(format!("wrote {}", target.path.display()));
        Ok(())
    }

    async fn dry_run(&self, ctx: &mut HandlerContext, resource: &ResourceDetails) -> Result<(), HandlerError> {
        FileTarget::from_resource(resource)?.diff(ctx).await.map(|_| ())
    }

    async fn facts(&self, resource: &ResourceDetails) -> Result<Map<String, Value>, HandlerError> {
        let target = FileTarget::from_resource(resource)?;
        let mut facts = Map::new();
        match tokio::fs::metadata(&target.path).await {
            Ok(meta) => {
                facts.insert("exists".into(), json!(true));
                facts.insert("size".into(), json!(meta.len()));
            }
            Err(_) => {
                facts.insert("exists".into(), json!(false));
            }
        }
        Ok(facts)
    }
}

// ── std::Null ───────────────────────────────────────────────────────

/// Always converged. Fails on request through a `fail` attribute.
pub struct NullHandler;

#[async_trait]
impl ResourceHandler for NullHandler {
    async fn deploy(&self, ctx: &mut HandlerContext, resource: &ResourceDetails) -> Result<(), HandlerError> {
        if resource.attribute("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(HandlerError::Failed(format!("{} is configured to fail", resource.id)));
        }
        ctx.info(format!("nothing to do for {}", resource.id));
        Ok(())
    }
}
