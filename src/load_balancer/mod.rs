//! Backend selection for the built-in TCP and UDP proxies.
//!
//! # Design Decisions
//! - Plain rotation, no health state: picking backends well is the job of
//!   the handlers a real router factory installs

pub mod round_robin;

pub use round_robin::RoundRobin;
