//! Outbound response model and the port that emits it.

pub mod port;
pub mod recording;
pub mod types;
