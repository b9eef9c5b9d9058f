//! HTTP API for the Rollcall job subsystem.
//!
//! Collaborators submit and control jobs here; operators read worker and
//! queue state, manage scheduled jobs and configure geocoding providers.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
