use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// archdisk - declarative disk provisioning for Arch Linux installs
#[derive(Parser, Debug)]
#[command(name = "archdisk")]
#[command(about = "Partition, encrypt, format and mount disks from a declarative plan")]
#[command(version)]
pub struct Cli {
    /// Settings file (JSON); defaults to $ARCHDISK_CONFIG, then built-in defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate, preview or apply a provisioning plan
    Plan {
        #[command(subcommand)]
        action: PlanCommands,
    },
    /// Check the live system against a plan or a generic layout checklist
    Verify {
        /// Plan to verify against (generic checklist when omitted)
        #[arg(short, long)]
        plan: Option<PathBuf>,
        /// Root of the installed system (default: plan or settings target root)
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Recovery helpers
    Repair {
        #[command(subcommand)]
        target: RepairCommands,
    },
    /// Development-tool cache helpers
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
    /// Check required binaries and root privileges
    Preflight {
        /// Do not require EUID 0
        #[arg(long)]
        skip_root: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum PlanCommands {
    /// Parse and validate a plan against the attached disks
    Validate {
        /// Plan file (TOML, or JSON when it ends in .json)
        plan: PathBuf,
    },
    /// Print the ordered storage operations a plan compiles to
    Show {
        plan: PathBuf,
        /// Emit the operations as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply a plan. Erases the target disks.
    Apply {
        plan: PathBuf,
        /// Confirm destructive operation
        #[arg(long)]
        confirm: bool,
        /// Overwrite disks that already carry LUKS volumes
        #[arg(long)]
        force: bool,
        /// Keyfile for LUKS volumes instead of the passphrase variable
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum RepairCommands {
    /// Give /home a btrfs subvolume and a persisted mount entry
    Home {
        #[arg(short, long)]
        plan: Option<PathBuf>,
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Apply the proposed actions instead of printing them
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Print `export NAME="path"` lines for tool caches
    Env {
        #[arg(short, long)]
        plan: Option<PathBuf>,
        /// Root the cache mount is resolved under (default: /)
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Create missing cache directories
        #[arg(long)]
        create: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
