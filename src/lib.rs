//! # Wave
//!
//! Multi-agent pipeline orchestration for LLM-backed CLI agents.
//!
//! ## Overview
//!
//! Wave composes command-line agents ("adapters") into directed acyclic
//! workflows. Every step runs a distinct persona in a freshly prepared
//! workspace with no inherited agent history; handovers between steps are
//! gated by machine-verifiable contracts; retries are bounded and carry
//! repair prompts; context pressure triggers relay compaction through a
//! dedicated summarizer persona; and everything durable lives in an
//! embedded SQLite store so a crashed run can resume.
//!
//! ## Modules
//!
//! - [`manifest`] - `wave.yaml`: adapters, personas, runtime defaults
//! - [`pipeline`] - pipeline documents: steps, contracts, matrix config
//! - [`dag`] - deterministic execution order with cycle detection
//! - [`executor`] - the run lifecycle: step loop, retries, cancellation
//! - [`matrix`] - bounded fan-out over a JSON items file
//! - [`adapter`] - the subprocess interface (claude, dummy, mock)
//! - [`workspace`] - ephemeral per-step filesystem contexts
//! - [`contract`] - JSON-schema / compile / test-suite handover gates
//! - [`relay`] - token monitoring and checkpoint compaction
//! - [`state`] - durable runs, steps, events, artifacts, cancellation
//! - [`events`] - the NDJSON progress stream
//! - [`audit`] - tool-call traces and credential scrubbing
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wave::{Executor, Manifest, Pipeline};
//!
//! let manifest = Arc::new(Manifest::load("wave.yaml".as_ref())?);
//! let pipeline = Pipeline::load(".wave/pipelines/review.yaml".as_ref())?;
//!
//! let store = Arc::new(wave::StateStore::open(&manifest.runtime.state_db).await?);
//! let registry = wave::AdapterRegistry::from_manifest(&manifest);
//! let executor = Executor::new(/* ... */);
//! let summary = executor.execute(&pipeline, "review PR #42", &Default::default()).await?;
//! println!("{} -> {}", summary.run_id, summary.status);
//! # Ok::<(), wave::WaveError>(())
//! ```

pub mod adapter;
pub mod audit;
pub mod contract;
pub mod dag;
pub mod error;
pub mod events;
pub mod executor;
pub mod init;
pub mod manifest;
pub mod matrix;
pub mod pipeline;
pub mod relay;
pub mod state;
pub mod template;
pub mod types;
pub mod workspace;

pub use adapter::{Adapter, AdapterRegistry, MockAdapter, MockBehavior, PermissionSet};
pub use error::WaveError;
pub use events::{Event, EventSink};
pub use executor::{ExecuteOptions, Executor, RunSummary};
pub use manifest::Manifest;
pub use pipeline::Pipeline;
pub use state::StateStore;
pub use types::{CancelFlag, RunId, RunStatus, StepStatus};
pub use workspace::WorkspaceManager;
