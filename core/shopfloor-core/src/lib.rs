//! # shopfloor-core
//!
//! Pure domain logic for CNC machine-state tracking, shared by the daemon
//! and any other client.
//!
//! ## Design principles
//!
//! - **Synchronous and I/O free**: every function here maps values to values.
//!   Persistence and scheduling live in the daemon.
//! - **Deciding is separate from mutating**: the cycle state machine returns
//!   a list of actions for one telemetry tick; applying them is the caller's
//!   job. This keeps clock-boundary and counter edge cases unit-testable
//!   without a store.
//! - **Not thread-safe**: callers provide their own synchronization.

pub mod calendar;
pub mod cycle;
pub mod error;
pub mod toolseq;
pub mod types;

pub use calendar::WorkCalendar;
pub use cycle::{evaluate_tick, CycleState, FinishReason, TickAction};
pub use error::CoreError;
pub use types::{MachineMode, MachineStatus, TelemetrySnapshot};
