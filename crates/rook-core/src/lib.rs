//! Core of the rook Discord bot: extension lifecycle and command dispatch.
//!
//! This crate is framework-agnostic. The Discord gateway and REST API live
//! behind ports (traits) implemented in the adapter crate.

pub mod bot;
pub mod checks;
pub mod command;
pub mod config;
pub mod convert;
pub mod cooldown;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod events;
pub mod funnel;
pub mod logging;
pub mod messaging;
pub mod paginator;
pub mod parser;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use errors::{Error, Result};
