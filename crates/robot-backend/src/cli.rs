use std::io::Write;

use anyhow::Result;
use clap::{Parser, Subcommand};
use video_ingest::{CameraBackend, CaptureSource};

use crate::{
    serve::{self, ServeCliArgs, ServeConfig},
    startup::StartupSequencer,
};

/// Robot backend: startup diagnostics and camera preview service.
#[derive(Debug, Parser)]
#[command(name = "robot-backend", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
    /// Camera index probed by the startup check.
    #[arg(
        long = "camera",
        value_name = "INDEX",
        default_value_t = 0,
        value_parser = clap::value_parser!(i32).range(0..)
    )]
    pub camera_index: i32,
    /// Enable debug logging on stderr.
    #[arg(long = "verbose", global = true, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Keep the camera open and serve a live preview over HTTP.
    Serve(ServeCliArgs),
}

impl Cli {
    /// The startup check stays quiet unless asked; the service logs progress.
    pub fn default_log_level(&self) -> &'static str {
        match self.command {
            None => "warn",
            Some(Command::Serve(_)) => "info",
        }
    }
}

/// Execute the parsed command against `backend`.
///
/// Startup banners go to `out`, startup diagnostics to `err`.
pub fn dispatch<B, O, E>(cli: Cli, backend: B, out: &mut O, err: &mut E) -> Result<()>
where
    B: CameraBackend,
    O: Write,
    E: Write,
{
    match cli.command {
        None => {
            let source = CaptureSource::Device {
                index: cli.camera_index,
            };
            StartupSequencer::with_source(backend, source).run(out, err)?;
            Ok(())
        }
        Some(Command::Serve(args)) => {
            let config = ServeConfig::try_from(args)?;
            serve::run(backend, config)
        }
    }
}

#[cfg(feature = "opencv")]
pub fn handle_command(cli: Cli) -> Result<()> {
    dispatch(
        cli,
        video_ingest::OpenCvBackend,
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )
}

#[cfg(not(feature = "opencv"))]
pub fn handle_command(_cli: Cli) -> Result<()> {
    anyhow::bail!("robot-backend was built without OpenCV support; rebuild with `--features opencv`")
}
