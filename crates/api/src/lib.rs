//! HTTP surface over the notification orchestrator.

pub mod routes;
pub mod state;
