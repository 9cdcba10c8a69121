//! Deterministic, pure logic shared by the deployment engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod action;
pub mod budget;
pub mod classifier;
pub mod compaction;
pub mod intervention;
pub mod loop_detector;
pub mod plan;
pub mod similarity;
pub mod state;
pub mod summary;
pub mod types;
