#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Entry point for the geopull server binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use geopull_config::Settings;

/// Command-line arguments for the geopull server.
#[derive(Parser)]
#[command(
    name = "geopull_server",
    about = "Geodata pull server: synchronizes OGR vector layers into PostGIS tables",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[actix_web::main]
async fn main() -> ExitCode {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let cli = Cli::parse();

    let settings = match Settings::from_file(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    log::info!(
        "Loaded {} layer(s) from {}",
        settings.layers.len(),
        cli.config.display()
    );

    match geopull_server::run_server(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
