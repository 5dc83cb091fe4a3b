//! # Pullarr Core
//!
//! Core library for Pullarr, a one-way seedbox-to-local media synchronization
//! service. This crate holds the scheduling and supervision machinery: who may
//! sync what, when, and how failures surface.
//!
//! ## Overview
//!
//! - **Admission control**: the [`queue::QueueManager`] decides whether a job
//!   runs immediately, waits for a concurrency slot, waits for its destination
//!   path, or is rejected as a duplicate.
//! - **Process supervision**: the [`runner::JobRunner`] spawns the external
//!   sync tool, streams its output into the job log, and signals completion
//!   over a per-job channel.
//! - **Safety validation**: the [`validator::DryRunValidator`] simulates a
//!   sync and refuses automated triggers that would mass-delete local media.
//! - **Auto-sync batching**: the [`autosync::AutoSyncScheduler`] coalesces
//!   per-episode events into one consolidated job per series season.
//! - **Coordination**: the [`coordinator::SyncCoordinator`] binds job state to
//!   notification records and owns startup recovery.
//!
//! The HTTP surface, remote directory listing, and outbound chat notifications
//! live in sibling crates; they consume this core through the coordinator and
//! the [`events::EventBus`].

/// Auto-sync event batching and dispatch.
pub mod autosync;

/// Configuration structures for every subsystem.
pub mod config;

/// Coordinator glue binding jobs, notifications, queue, and runner together.
pub mod coordinator;

/// Error types and error handling utilities.
pub mod error;

/// Progress/completion broadcast events.
pub mod events;

/// Media file filtering and TV filename parsing.
pub mod media;

/// Record store abstraction and implementations.
pub mod persistence;

/// Admission-control queue and destination ledger.
pub mod queue;

/// External sync process supervision.
pub mod runner;

/// Shared identifiers and durable record types.
pub mod types;

/// Pre-flight dry-run safety validation.
pub mod validator;

pub use config::SyncConfig;
pub use coordinator::SyncCoordinator;
pub use error::{Result, SyncError};
pub use events::{EventBus, SyncEvent};
pub use types::{
    BatchKey, DryRunOutcome, JobId, JobStatus, NotificationId, NotificationStatus, SyncJob,
    SyncKind, SyncNotification,
};
