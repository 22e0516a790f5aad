//! `mirage` — a task-queueing video protection service.
//!
//! This crate provides:
//! - A durable task queue with a status lifecycle, JSON persistence and
//!   cooperative cancellation
//! - An adversarial frame-perturbation engine (EOT + sign-of-gradient step
//!   against a fixed surrogate classifier)
//! - Psychoacoustically shaped audio masking
//! - A pipeline runner orchestrating the external ffmpeg toolchain
//! - A worker pool and the axum HTTP surface that feeds it
//!
//! The library is designed to be used by the bundled `mirage-server` binary
//! and by tests, with an emphasis on clear seams: the toolchain is a trait,
//! the store owns all task mutation, and the engine is pure compute.

// HTTP surface and shared application state.
pub mod api;

// Psychoacoustic audio masking.
pub mod audio_mask;

// Fixed surrogate classifier (forward + input gradient).
pub mod classifier;

// Configuration and the on-disk directory layout.
pub mod config;

// Crate-wide error type.
pub mod error;

// Logging configuration and control.
pub mod logging;

// Prometheus metrics for the HTTP surface.
pub mod metrics;

// Adversarial frame perturbation.
pub mod perturb;

// Per-task pipeline runner.
pub mod pipeline;

// Spatial resampling for frame tensors.
pub mod resize;

// Durable task store.
pub mod store;

// Task records, statuses and per-kind parameters.
pub mod task;

// External media toolchain adapter.
pub mod toolchain;

// Worker pool and timeout supervisor.
pub mod worker;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use store::TaskStore;
pub use task::{TaskRecord, TaskStatus};
