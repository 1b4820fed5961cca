//! CLI argument parsing using clap.
//!
//! Contains the Cli struct and the Commands enum.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// File watching service
#[derive(Parser)]
#[command(
    name = "lookout",
    version = env!("CARGO_PKG_VERSION"),
    about = "Debounced file watching service",
    long_about = "Watch files and directories, folding raw filesystem notifications into debounced change batches.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize project
    #[command(about = "Set up .lookout directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings from .lookout/settings.toml")]
    Config,

    /// Watch paths and stream change events
    #[command(
        about = "Watch paths and stream change batches as JSON lines",
        long_about = "Watch the given paths and stream debounced change batches on stdout, one JSON object per line. Logs go to stderr.",
        after_help = "Examples:\n  lookout serve\n  lookout serve src tests\n  lookout serve --ignore '**/target/**' --foreground\n  lookout serve --verbose 2>watch.log"
    )]
    Serve {
        /// Paths to watch (defaults to the current directory)
        #[arg(value_name = "PATH")]
        paths: Vec<PathBuf>,

        /// Extra glob patterns to exclude, merged with the configured set
        #[arg(long, value_name = "GLOB")]
        ignore: Vec<String>,

        /// Run the service in this process instead of a spawned helper
        #[arg(long)]
        foreground: bool,

        /// Shut down when the given process exits (set by the supervisor)
        #[arg(long, value_name = "PID", hide = true)]
        parent_pid: Option<u32>,

        /// Log watcher lifecycle at info level
        #[arg(long)]
        verbose: bool,
    },
}
