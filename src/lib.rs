// src/lib.rs

//! Action Relay - correlation and reconciliation for bus-dispatched UI actions
//!
//! A [`coordinator::CoordinationManager`] tags every outbound action with a
//! correlation ID, shows an optimistic placeholder, and reconciles the direct
//! response with the persisted-entity notification in whichever order they
//! arrive.

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::result_large_err)]
#![allow(clippy::type_complexity)]

// Correlation engine
pub mod correlation;
pub mod dispatcher;
pub mod lifecycle;
pub mod multiplexer;
pub mod placeholder;
pub mod reconcile;
pub mod registry;
pub mod result_cache;
pub mod state;
pub mod sweep;
pub mod view;

// Session surface
pub mod ambient;
pub mod coordinator;

// Infrastructure
pub mod app;
pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod simulation;
pub mod types;

// Re-export commonly used types
pub use coordinator::CoordinationManager;
pub use correlation::CorrelationId;
pub use dispatcher::DispatchRequest;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use lifecycle::{FailureReason, OperationPhase, Outcome, Resolution};
pub use manager::{Manager, ManagerState, ManagerStatus};
pub use types::{EntityChange, EntityKind, RequestKind};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
