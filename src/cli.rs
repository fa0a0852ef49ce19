use clap::Parser;
use std::path::PathBuf;

/// Back up the media stack of this device into the remote store.
#[derive(Parser, Debug)]
#[command(name = "supabazarr")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "SUPABAZARR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run a single backup pass and exit
    #[arg(long)]
    pub once: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub debug: bool,
}
