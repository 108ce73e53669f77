//! ModelPool reference worker
//!
//! A stand-in inference process that speaks the coordinator's line
//! protocol: one JSON request per stdin line, one JSON event per stdout
//! line. Replies are composed from the request rather than sampled from
//! a model, which makes the worker useful for wiring up and load-testing
//! a pool without accelerator hardware.

pub mod responder;
pub mod serve;

pub use responder::{Reply, Responder};
pub use serve::{serve, ServeOptions};
