//! Camera preview service started by the `serve` subcommand.
//!
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Supervises capture, encoding and restarts.
//! - `encoding`: BGR to JPEG conversion on a dedicated thread.
//! - `server`: Actix Web preview endpoints.
//! - `watchdog`: Stall detection for capture and encoding.
//! - `data`: Shared structs passed between stages and handlers.

pub use config::{ServeCliArgs, ServeConfig};
pub use pipeline::run;
pub use watchdog::WatchdogTimings;

mod config;
mod data;
mod encoding;
mod pipeline;
mod server;
mod watchdog;
