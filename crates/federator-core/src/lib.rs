//! Federator Core Library
//!
//! This crate provides the core functionality for Federator, including:
//! - Query classification (lookup, creative, pathfinder)
//! - Rule-based expansion of inferred edges into concrete lookups
//! - Fan-out/fan-in dispatch over the retrieval callback protocol
//! - Merging of rule results into synthesized, provenance-carrying edges
//! - Structural result filters
//! - Declarative workflows over annotation services
//! - Result cache and job status log (SQLite)

pub mod cache;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod filters;
pub mod jobs;
pub mod merge;
pub mod message;
pub mod normalize;
pub mod query;
pub mod services;
pub mod workflow;

pub use engine::{Federator, FederatorBuilder, new_job_id};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{Federator, FederatorBuilder, new_job_id};
    pub use crate::error::{Error, Result};
    pub use crate::jobs::{JobReport, JobStatus};
    pub use crate::message::{Envelope, Message, QueryGraph, WorkflowStep};
    pub use crate::query::QueryShape;
}
