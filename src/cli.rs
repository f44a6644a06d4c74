use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tasker", version, about = "Tool-calling agent and task orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand. They override config files.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Model name sent to the provider
    #[arg(short, long)]
    pub model: Option<String>,

    /// Workspace directory path
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Shell command timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Path to config file (replaces the workspace tasker.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an interactive session
    Chat {
        #[command(flatten)]
        common: CommonArgs,

        /// Resume a saved session by id
        #[arg(long)]
        session: Option<String>,

        /// Grant every confirm-level tool for the session without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// Run a single prompt through a sub-agent and print the answer
    Exec {
        #[command(flatten)]
        common: CommonArgs,

        /// The prompt to run
        prompt: String,

        /// Use the read-only exploration prompt
        #[arg(long)]
        explore: bool,
    },
    /// Run a workflow file (JSON or TOML) and print the results as JSON
    Workflow {
        #[command(flatten)]
        common: CommonArgs,

        /// Workflow file path
        file: PathBuf,
    },
}

impl Commands {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Commands::Chat { common, .. } => common,
            Commands::Exec { common, .. } => common,
            Commands::Workflow { common, .. } => common,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exec_with_common_args() {
        let cli = Cli::parse_from(["tasker", "exec", "--model", "m", "-w", "/tmp", "list files"]);
        match cli.command {
            Commands::Exec {
                common,
                prompt,
                explore,
            } => {
                assert_eq!(common.model.as_deref(), Some("m"));
                assert_eq!(common.workspace, Some(PathBuf::from("/tmp")));
                assert_eq!(prompt, "list files");
                assert!(!explore);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_chat_yes_flag() {
        let cli = Cli::parse_from(["tasker", "chat", "--yes"]);
        assert!(matches!(cli.command, Commands::Chat { yes: true, .. }));
    }
}
