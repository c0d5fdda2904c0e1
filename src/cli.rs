use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "strata")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative resource reconciliation", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Project directory containing the manifests (default: current dir)
    #[arg(short = 'C', long = "dir", global = true, value_name = "DIR")]
    pub dir: Option<String>,

    /// State file path (default: <dir>/strata.state.json)
    #[arg(long, global = true, value_name = "FILE")]
    pub state: Option<PathBuf>,

    /// Set a variable (name=value; repeatable, highest precedence)
    #[arg(long = "var", global = true, value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Load variables from a TOML file (repeatable, in order)
    #[arg(long = "var-file", global = true, value_name = "FILE")]
    pub var_files: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check manifests, schemas, and variables without touching anything
    Validate,

    /// Show what apply would change (dry run)
    Plan(PlanArgs),

    /// Apply the planned changes
    Apply(ApplyArgs),

    /// Destroy everything tracked in state
    Destroy(DestroyArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct PlanArgs {
    /// Read remote objects and adopt drift before planning
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Read remote objects and adopt drift before planning
    #[arg(long)]
    pub refresh: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub auto_approve: bool,

    /// Parallel provider calls
    #[arg(short, long, default_value_t = 4)]
    pub jobs: usize,

    /// Stop scheduling new actions after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Skip the confirmation prompt
    #[arg(long)]
    pub auto_approve: bool,

    /// Parallel provider calls
    #[arg(short, long, default_value_t = 4)]
    pub jobs: usize,

    /// Stop scheduling new actions after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}
