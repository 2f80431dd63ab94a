//! Configuration for the relay server.
//!
//! Everything comes from command-line arguments; there is no config
//! file. Only the port is required.

use clap::Parser;
use std::time::Duration;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "rshd")]
#[command(version = "0.1.0")]
#[command(about = "Relay operator commands to a remote shell over TCP", long_about = None)]
pub struct CliArgs {
    /// Port to bind the server on (listens on all interfaces)
    #[arg(short = 'p', long)]
    pub port: u16,

    /// Seconds to wait for the remote shell's startup prompt
    #[arg(long, default_value_t = 1)]
    pub prompt_timeout: u64,

    /// Seconds to wait for a command's full output
    #[arg(long, default_value_t = 120)]
    pub reply_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub prompt_timeout: Duration,
    pub reply_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Parse the process arguments. Exits with a usage error on a
    /// missing or invalid port (clap's behavior).
    pub fn load() -> Self {
        CliArgs::parse().into()
    }
}

impl From<CliArgs> for Config {
    fn from(cli: CliArgs) -> Self {
        Config {
            port: cli.port,
            prompt_timeout: Duration::from_secs(cli.prompt_timeout),
            reply_timeout: Duration::from_secs(cli.reply_timeout),
            log_level: cli.log_level,
        }
    }
}
