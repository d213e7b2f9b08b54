use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start enforcing a target identity
    Start {
        /// Run as a detached service that survives this process (default)
        #[arg(long, conflicts_with = "in_process")]
        standalone: bool,

        /// Run inside this process until Ctrl+C
        #[arg(long)]
        in_process: bool,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Stop the standalone service
    Stop,

    /// Stop the standalone service and start it again from its persisted session
    Restart,

    /// Show the merged status of both session kinds
    Status {
        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Detect conflicts between sessions and apply the safe corrections
    Sync {
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a freshly generated target identity as JSON
    Generate {
        /// Fields to generate (all if not specified)
        #[arg(long = "field", value_name = "NAME")]
        fields: Vec<String>,
    },
}

/// Where the target identity comes from. Standalone starts without any of
/// these resume the persisted session.
#[derive(Args, Debug, Default)]
#[group(multiple = false)]
pub struct TargetArgs {
    /// Generate a fresh value for every identity field
    #[arg(long)]
    pub generate: bool,

    /// JSON file mapping field names to values
    #[arg(long, value_name = "FILE")]
    pub identity: Option<PathBuf>,

    /// Target field, repeatable
    #[arg(long = "field", value_name = "NAME=VALUE")]
    pub fields: Vec<String>,
}

impl TargetArgs {
    pub fn is_empty(&self) -> bool {
        !self.generate && self.identity.is_none() && self.fields.is_empty()
    }
}
