use std::{io, process};

use clap::Parser;
use robot_backend::{
    cli::{self, Cli},
    startup, telemetry,
};

fn main() {
    let cli = Cli::parse();
    telemetry::init_logging(cli.default_log_level(), cli.verbose);

    let result = cli::handle_command(cli);
    process::exit(startup::report_outcome(&result, &mut io::stderr()));
}
