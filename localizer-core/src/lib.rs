//! Real-time UWB indoor localization pipeline: measurement ingest, sliding-window
//! binning with statistical quality filtering, pose-graph edge construction, and
//! Levenberg-Marquardt pose graph optimization with gauge fixing.
//!
//! `main.rs` is a thin binary wiring this library to a UDP message bus and a small
//! HTTP exposure surface; the pipeline itself has no axum or tokio dependency below
//! the bus listener.

pub mod anchor_geometry;
pub mod binner;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod edge_builder;
pub mod error;
pub mod ingest;
pub mod pgo_solver;
