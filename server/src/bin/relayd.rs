//! Relay daemon binary.

use clap::Parser;
use relay_server::logic::EchoFactory;
use relay_server::{logging, signal, Args, Config, Relay};
use std::sync::Arc;

fn main() {
    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    logging::init(&config.logging);

    let shutdown = signal::install_signal_handler();
    let factory = Arc::new(EchoFactory::new());

    let relay = match Relay::start(&config, factory.clone(), shutdown) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };

    relay.run(factory.as_ref(), config.stats_interval);
    tracing::info!("relay stopped");
}
