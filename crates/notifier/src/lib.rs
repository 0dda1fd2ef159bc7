//! Delivery side of the pipeline: channel capabilities, the dispatcher that
//! routes to them, the transport workers and the retry coordinator.

pub mod channels;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod worker;
