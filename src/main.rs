//! rshd: a single-session remote command relay.
//!
//! Listens on a TCP port for one inbound connection from a remote
//! shell, relays operator-typed commands to it, and echoes the shell's
//! output back to the terminal. Sessions are served one at a time.

mod config;
mod protocol;
mod server;
mod session;
mod shutdown;

use config::Config;
use server::Server;
use shutdown::ShutdownFlag;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();

    // Logs go to stderr; stdout is reserved for relayed shell output.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        port = config.port,
        prompt_timeout = config.prompt_timeout.as_secs(),
        reply_timeout = config.reply_timeout.as_secs(),
        "Starting rshd"
    );

    let shutdown = ShutdownFlag::install()?;

    Server::new(config, shutdown).run()?;
    Ok(())
}
