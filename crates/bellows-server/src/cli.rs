use clap::{Parser, Subcommand};

/// Bellows master - build orchestration daemon
#[derive(Parser, Debug)]
#[command(name = "bellowsd")]
#[command(version = bellows_core::VERSION)]
#[command(about = "Bellows CI master daemon", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Default)]
pub enum Commands {
    /// Run the master in the foreground (default if no command given)
    #[default]
    Run,

    /// Check the configuration and database connection, then exit
    Check,
}
