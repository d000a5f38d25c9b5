mod cmd;
mod exit;
mod output;

use std::path::PathBuf;

use clap::Parser;
use modlink::logging::{init_logging, LogFormat, LogLevel};

use crate::cmd::Command;
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "modlink", version, about = "Drive modlink modules from the command line")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: LogLevel,

    /// Directory of `<name>.type.json` payload type files.
    #[arg(long, value_name = "DIR", global = true, env = "MODLINK_TYPES")]
    types: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format, cli.types.as_deref());

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
