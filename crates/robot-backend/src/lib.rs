//! Robot backend entry point.
//!
//! Without a subcommand the binary runs the one-shot startup check in
//! [`startup`]. `serve` keeps the camera open and publishes a live preview.

pub mod cli;
pub mod serve;
pub mod startup;
pub mod telemetry;
