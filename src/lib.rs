//! Strata - incremental container image stages
//!
//! Produces content-addressed patches, archives and checksums of git
//! repositories and runs the container builds that turn them into
//! reusable image layers.

pub mod cli;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod git;
pub mod lock;
pub mod stage;

pub use context::EngineContext;
pub use error::{StrataError, StrataResult};
