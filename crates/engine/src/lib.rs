//! Delivery orchestration engine: quota, dedup, notification state machine,
//! record store, transport and the submission path.

pub mod dedup;
pub mod orchestrator;
pub mod quota;
pub mod recipient;
pub mod state;
pub mod store;
pub mod template;
pub mod transport;
