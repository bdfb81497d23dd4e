//! # cloudup
//!
//! Declarative provisioning of a Kubernetes cluster's cloud-side
//! infrastructure. A model directory of templates plus a cluster
//! configuration compiles into a typed task map; a dependency-ordered
//! executor compares each task's desired state against the live cloud
//! and applies minimal changes through a pluggable target.
//!
//! ## Pipeline
//!
//! ```text
//! model dir + config --loader--> task map --scheduler--> delta runner --> target
//! ```
//!
//! The three targets share one lifecycle and differ only in where renders
//! go: the API target mutates the cloud, the Terraform target emits an
//! infrastructure-as-code document, and the dry-run target records a
//! human-readable plan. Terraform runs force `check_existing` off so the
//! emitted document never depends on live state.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use cloudup::{ClusterConfig, Context, Loader, Target};
//!
//! let mut config = ClusterConfig::from_yaml(&yaml)?;
//! config.apply_defaults()?;
//! config.validate()?;
//!
//! let mut loader = Loader::new(config);
//! loader.add_kinds(&cloudup::tasks::standard_kinds(provider));
//! let mut tasks = loader.build(&model_dir, &ca, &secrets)?;
//!
//! let mut ctx = Context::new(target, cloud, ca, secrets, true);
//! ctx.run_tasks(&mut tasks)?;
//! ctx.finish(&tasks)?;
//! # Ok::<(), cloudup::Error>(())
//! ```
//!
//! ## Modules
//!
//! - [`task`] — the task contract, the task enum, the task map
//! - [`loader`] — model templates to task map
//! - [`scheduler`] — dependency order and cycle detection
//! - [`delta`] — the per-task convergence algorithm
//! - [`target`] — API, Terraform and dry-run sinks
//! - [`cloud`] — provider seam, tag helpers, retries
//! - [`store`] — filesystem CA and secret stores
//! - [`tasks`] — the shipped resource kinds

pub mod cloud;
pub mod config;
pub mod context;
pub mod delta;
pub mod diff;
pub mod error;
pub mod flags;
pub mod loader;
pub mod resource;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod target;
pub mod task;
pub mod tasks;
pub mod walk;

pub use cloud::{Cloud, CloudProvider};
pub use config::ClusterConfig;
pub use context::Context;
pub use error::{Error, Result};
pub use loader::Loader;
pub use resource::{Resource, ResourceHolder};
pub use store::ca::CaStore;
pub use store::secrets::SecretStore;
pub use target::{ApiTarget, DryRunTarget, Target, TerraformTarget};
pub use task::{Task, TaskMap, TaskRef};
