use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "datvault")]
#[command(about = "Content-addressed asset repository with verifiable append-only storage", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the HTTP server.
    Serve {
        /// Bind address.
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Listen port.
        #[arg(short, long, default_value_t = crate::config::DEFAULT_PORT)]
        port: u16,
        /// Working directory holding topics. May also be set once at runtime
        /// via POST /api/config.
        #[arg(short = 'd', long)]
        working_dir: Option<PathBuf>,
        /// Segment size cap in bytes.
        #[arg(long)]
        max_dat_size: Option<u64>,
        /// Total disk usage limit in bytes (0 = unlimited).
        #[arg(long)]
        max_disk_usage: Option<u64>,
        /// Maximum operations per metadata batch.
        #[arg(long)]
        max_operations: Option<usize>,
        /// Maximum metadata key length in bytes.
        #[arg(long)]
        max_metadata_key_length: Option<usize>,
        /// Maximum metadata value size in bytes.
        #[arg(long)]
        max_metadata_value_bytes: Option<usize>,
        /// Read cap for served log files, in bytes.
        #[arg(long)]
        log_file_max_read_bytes: Option<u64>,
    },

    /// Verify every topic under a working directory and print a health
    /// report without starting the server.
    Check {
        working_dir: PathBuf,
        /// Output JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}
