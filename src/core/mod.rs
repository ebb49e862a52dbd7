//! Core engine logic — types, plan drafts, resolution, execution, refinement, aggregation.

pub mod aggregate;
pub mod chart;
pub mod config;
pub mod draft;
pub mod engine;
pub mod executor;
pub mod fingerprint;
pub mod guard;
pub mod refine;
pub mod resolver;
pub mod retry;
pub mod state;
pub mod types;
