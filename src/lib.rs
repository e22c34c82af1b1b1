//! `evorates` library crate.
//!
//! The binary is a thin wrapper around this library so that:
//!
//! - the numerical core is testable without spawning processes
//! - datasets can be built programmatically (e.g. in the integration
//!   tests or from conversion scripts)

pub mod config;
pub mod divdiv;
pub mod manager;
pub mod masked;
pub mod patient;
pub mod plot;
pub mod rates;
pub mod stats;
pub mod tree;
