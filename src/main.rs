//! Lumen - server-rendered live views over a websocket.

#![allow(dead_code)]

mod auth;
mod cli;
mod component;
mod config;
mod core;
mod demo;
mod instrument;
mod logger;
mod pubsub;
mod render;
mod server;
mod session;
mod view;

use std::sync::Arc;

use anyhow::Result;
use clap::{ColorChoice, Parser};
use cli::{Cli, Commands};
use config::{LumenConfig, init_config};
use session::Endpoint;

fn main() -> Result<()> {
    // Setup global Ctrl+C handler (before any blocking operations)
    core::setup_shutdown_handler()?;

    let cli = Cli::parse();

    // Set global color override based on CLI option
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }

    let config = init_config(LumenConfig::load(&cli)?);

    match &cli.command {
        Commands::Serve { .. } => {
            let endpoint = Endpoint::new(demo::routes(), Arc::clone(&config));
            server::serve(Arc::new(endpoint))
        }
        Commands::Token { topic, session } => {
            let secret = auth::resolve_secret(config.security.secret.as_deref());
            let signer = auth::Signer::new(&secret, config.security.token_max_age());
            cli::token::issue(&signer, topic, session.as_deref())?.print();
            Ok(())
        }
        Commands::Routes => {
            cli::list_routes(&demo::routes());
            Ok(())
        }
    }
}
