pub mod config;
pub mod paths;
pub mod sandbox;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "shellfence")]
#[command(
    author,
    version,
    about = "Kernel-enforced filesystem and network restrictions for agent shell commands"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show platform capabilities and sandbox configuration
    Status,

    /// Print the sandboxed form of a command without running it
    Wrap(sandbox::WrapArgs),

    /// Run a command inside the sandbox
    Run(sandbox::RunArgs),

    /// Run smoke tests to verify sandbox enforcement
    Test,

    /// Show recorded violations
    Violations(sandbox::ViolationsArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
