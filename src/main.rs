// Module declarations
mod cli;
mod config;
mod errors;
mod logging;
mod manager;
mod metadata;
mod orchestrator;
mod query;
mod quota;
mod segment;
mod server;
mod topic;
mod util;

// Re-export all module items at crate root so cross-module references work.
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use errors::*;
#[allow(unused_imports)]
pub(crate) use logging::*;
#[allow(unused_imports)]
pub(crate) use manager::*;
#[allow(unused_imports)]
pub(crate) use metadata::*;
#[allow(unused_imports)]
pub(crate) use orchestrator::*;
#[allow(unused_imports)]
pub(crate) use query::*;
#[allow(unused_imports)]
pub(crate) use quota::*;
#[allow(unused_imports)]
pub(crate) use segment::*;
#[allow(unused_imports)]
pub(crate) use server::*;
#[allow(unused_imports)]
pub(crate) use topic::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use log::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init();

    match cli.command {
        Command::Serve {
            bind,
            port,
            working_dir,
            max_dat_size,
            max_disk_usage,
            max_operations,
            max_metadata_key_length,
            max_metadata_value_bytes,
            log_file_max_read_bytes,
        } => {
            let mut config = ServerConfig::default();
            config.bind = bind;
            config.port = port;
            config.working_directory = working_dir;
            if let Some(v) = max_dat_size {
                config.max_dat_size = v;
            }
            if let Some(v) = max_disk_usage {
                config.max_disk_usage = v;
            }
            if let Some(v) = max_operations {
                config.max_operations = v;
            }
            if let Some(v) = max_metadata_key_length {
                config.max_metadata_key_length = v;
            }
            if let Some(v) = max_metadata_value_bytes {
                config.max_metadata_value_bytes = v;
            }
            if let Some(v) = log_file_max_read_bytes {
                config.log_file_max_read_bytes = v;
            }
            config.apply_env()?;

            let state = Arc::new(AppState::new(config.clone()));
            if let Some(dir) = &config.working_directory {
                let runtime = state
                    .configure_working_dir(dir)
                    .map_err(|e| format!("configure {}: {e}", dir.display()))?;
                logging::set_log_root(runtime.working_dir())?;
                info!("working directory preconfigured: {}", dir.display());
            }
            server::run_server(state)
        }

        Command::Check { working_dir, json } => run_check(&working_dir, json),
    }
}

/// Offline health report: discover topics, verify every chain, repair torn
/// tails, and print the outcome without starting the server.
fn run_check(working_dir: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !working_dir.exists() {
        eprintln!("Working directory does not exist: {}", working_dir.display());
        std::process::exit(2);
    }
    let runtime = StorageRuntime::configure(working_dir, &ServerConfig::default())
        .map_err(|e| format!("check {}: {e}", working_dir.display()))?;
    let topics = runtime.list_topics();

    if json {
        println!("{}", serde_json::to_string_pretty(&topics)?);
        return Ok(());
    }

    if topics.is_empty() {
        println!("No topics under {}", working_dir.display());
        return Ok(());
    }
    let mut unhealthy = 0usize;
    for topic in &topics {
        let status = if topic.healthy { "healthy" } else { "UNHEALTHY" };
        let detail = topic.error.clone().unwrap_or_default();
        println!(
            "{:<32} {:<10} {:>8} assets {:>12} bytes  {detail}",
            topic.name, status, topic.stats.file_count, topic.stats.total_size
        );
        if !topic.healthy {
            unhealthy += 1;
        }
    }
    if unhealthy > 0 {
        eprintln!("{unhealthy} topic(s) failed verification");
        std::process::exit(1);
    }
    Ok(())
}
