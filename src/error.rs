//! Unified error handling for the cloudup engine.
//!
//! One top-level [`Error`] wraps the per-module error types. The variants
//! follow the propagation taxonomy of the engine:
//!
//! - validation errors (bad model, bad transition) are fatal and carry the
//!   offending task key or field,
//! - not-found during discovery is *not* an error (tasks return `Ok(None)`),
//! - transient cloud errors are retried by the cloud layer and only surface
//!   here once the retry budget is exhausted.

use thiserror::Error;

use crate::cloud::CloudError;

/// Top-level error type for the engine and CLI.
#[derive(Error, Debug)]
pub enum Error {
    /// A field that must be set when creating a resource was missing.
    #[error("{kind}: field {field} is required")]
    RequiredField { kind: &'static str, field: &'static str },

    /// A field the cloud forbids mutating differed from the actual state.
    #[error("{kind}: field {field} cannot be changed")]
    CannotChangeField { kind: &'static str, field: &'static str },

    /// A rendered model document used a task kind that is not registered.
    #[error("unknown task kind {kind:?} in {file}")]
    UnknownTaskKind { kind: String, file: String },

    /// Two model documents produced the same task key.
    #[error("duplicate task key {key:?}")]
    DuplicateTask { key: String },

    /// A reference field names a task that is not in the task map.
    #[error("task {referrer:?} references unknown task {key:?}")]
    UnknownReference { key: String, referrer: String },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle between tasks: {}", keys.join(", "))]
    DependencyCycle { keys: Vec<String> },

    /// A task kind has no renderer for the selected target/cloud pair.
    #[error("task kind {kind:?} is not supported with target {target:?} on cloud {cloud:?}")]
    RendererUnsupported {
        kind: &'static str,
        target: &'static str,
        cloud: String,
    },

    /// The configuration document is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A task failed while talking to the cloud.
    #[error("task {key:?}: {source}")]
    Task {
        key: String,
        #[source]
        source: Box<Error>,
    },

    /// A named resource could not be materialized.
    #[error("resource error: {0}")]
    Resource(String),

    /// Certificate or secret store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Model template rendering error.
    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    /// YAML parse error from a model document or configuration file.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Cloud API error, after any applicable retries.
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// IO error (state directory, model directory, resource files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a generic error with a message.
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Missing required field on the create path.
    pub fn required_field(kind: &'static str, field: &'static str) -> Self {
        Error::RequiredField { kind, field }
    }

    /// Attempted mutation of an immutable field.
    pub fn cannot_change_field(kind: &'static str, field: &'static str) -> Self {
        Error::CannotChangeField { kind, field }
    }

    /// Attach the owning task key to an error bubbling out of a task.
    pub fn for_task(self, key: &str) -> Self {
        Error::Task {
            key: key.to_string(),
            source: Box::new(self),
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;
