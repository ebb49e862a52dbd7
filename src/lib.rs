//! stepql — adaptive multi-step query planning.
//!
//! Turns a question into a dependency graph of read-only SQL steps, runs
//! them in order, repairs failing steps, revises the remaining plan as
//! results arrive and aggregates everything into one answer.

pub mod cli;
pub mod core;
pub mod events;
pub mod planner;
pub mod source;
