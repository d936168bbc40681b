//! rootsmith - builds Alpine + k3s root filesystem templates.
//!
//! ```text
//! ConfigResolver → BuildPipeline ─┬─ ImageCache (base image, k3s binary)
//!                                 └─ Executor   (every in-root operation)
//!               → package() → validate()
//! ```
//!
//! Integration tests drive the pipeline with fake transports, probes and
//! command runners; see `tests/helpers.rs`.

pub mod cache;
pub mod common;
pub mod config;
pub mod error;
pub mod exec;
pub mod package;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod retry;
pub mod timing;
pub mod validate;

pub use config::{BuildConfig, ConfigResolver, ConfigSource, Overrides};
pub use error::{BuildError, ConfigError, EnvironmentError, FetchError, PackagingError, StageError, ValidationError};
pub use pipeline::{BuildOutcome, BuildPipeline, CancelToken, PipelineFailure, Stage};
