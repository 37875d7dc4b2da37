use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "engine-runner", about = "Manage product tickets and run software updates")]
pub struct Cli {
    /// Path to config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Ticket store file (overrides config)
    #[arg(short, long, global = true)]
    pub store: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print final results
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Auto)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Progress bars on a terminal, plain text otherwise
    Auto,
    /// Progress bars
    Interactive,
    /// Plain text lines
    Plain,
    /// Machine-readable JSON (list and dry-run)
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List registered products
    List,

    /// Register a product, or replace its ticket
    Add {
        /// Product identifier
        product_id: String,

        /// Installed version
        version: String,

        /// URL of the update server
        server_url: String,

        /// The product counts as installed only while this path exists
        #[arg(long)]
        path: Option<PathBuf>,

        /// Static update-check tag
        #[arg(long)]
        tag: Option<String>,

        /// Read the installed version from KEY in this JSON file
        #[arg(long, value_names = ["FILE", "KEY"], num_args = 2)]
        version_from: Option<Vec<String>>,
    },

    /// Remove a product's ticket
    Delete {
        /// Product identifier
        product_id: String,
    },

    /// Check for updates and report them without installing anything
    DryRun {
        /// Only check this product
        #[arg(long)]
        product: Option<String>,
    },

    /// Check for updates and install them
    Run {
        /// Only update this product
        #[arg(long)]
        product: Option<String>,

        /// Treat the run as requested by a user (prompting updates are offered)
        #[arg(long)]
        user_initiated: bool,
    },
}
