mod config;
mod error;
mod operations;
mod sandbox;
mod server;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::operations::dispatcher::Dispatcher;
use crate::sandbox::Sandbox;
use crate::server::AppState;

fn print_help() {
    println!(
        "\
taskbox v{}

Sandboxed task execution service. Runs structured task requests
(fetch, scrape, commit, query, image, transcribe, markdown, csv)
strictly inside one confinement directory.

USAGE:
    taskbox [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/taskbox.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENDPOINTS:
    POST /run          Execute a task request (JSON body)
    GET  /read?path=   Read a file under the confinement root

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG        Log level filter for tracing
                    (e.g. debug, taskbox=debug,warn)
    TASKBOX_ROOT    Conventional variable for [sandbox] root

EXAMPLES:
    taskbox                             # uses config/taskbox.toml
    taskbox /etc/taskbox/taskbox.toml   # custom config path
    RUST_LOG=debug taskbox              # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("taskbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskbox=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/taskbox.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)
        .with_context(|| format!("cannot load configuration from {config_path}"))?;

    let root = &config.sandbox.root;
    std::fs::create_dir_all(root)
        .with_context(|| format!("cannot create confinement root {}", root.display()))?;
    let sandbox = Sandbox::new(root)
        .with_context(|| format!("invalid confinement root {}", root.display()))?
        .with_source_confinement(config.sandbox.confine_sources);
    let sandbox = Arc::new(sandbox);

    info!("Confinement root: {}", sandbox.root().display());
    info!(
        "Source confinement: {}",
        if sandbox.confines_sources() { "on" } else { "off" }
    );
    info!("Version control: {}", config.vcs.program);

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&sandbox), &config));
    let app = server::router(AppState::new(dispatcher, sandbox));

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    server::serve(listener, app, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, exiting");
    })
    .await
}
