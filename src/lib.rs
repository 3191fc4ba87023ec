//! Traffic analysis service library.
//!
//! Stateful network-flow analysis: window-based statistics accumulation,
//! adaptive baseline tracking, multi-vector threat classification and the
//! correlation of security findings with measured performance into a
//! single health assessment.

pub mod api;
pub mod config;
pub mod core;
pub mod ingest;
pub mod models;
pub mod utils;
