//! Dedicated server binary.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p tessera-server -- --port 7777`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use clap::Parser;
use tessera_config::{CliArgs, Config, default_config_dir};
use tessera_server::ServerHost;
use tracing::{error, info};

const FRAME_SLEEP: Duration = Duration::from_millis(1);

fn main() {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone() {
        Some(dir) => Some(dir),
        None => default_config_dir()
            .inspect_err(|e| eprintln!("{e}, using defaults"))
            .ok(),
    };

    let mut config = match &config_dir {
        Some(dir) => Config::load_or_create(dir).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}, using defaults");
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.as_ref().map(|dir| dir.join("logs"));
    tessera_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    let Some(addr) = resolve(&config.network.server_endpoint()) else {
        error!(endpoint = %config.network.server_endpoint(), "cannot resolve server endpoint");
        std::process::exit(1);
    };

    let mut host = ServerHost::new(&config);
    match host.listen(addr) {
        Ok(local) => info!(%local, update_check = ?config.network.update_check, "server listening"),
        Err(e) => {
            error!(%addr, "failed to listen: {e}");
            std::process::exit(1);
        }
    }

    loop {
        host.frame();
        std::thread::sleep(FRAME_SLEEP);
    }
}

fn resolve(endpoint: &str) -> Option<SocketAddr> {
    endpoint.to_socket_addrs().ok()?.next()
}
