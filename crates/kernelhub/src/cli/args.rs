use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Run stateful code-execution kernels behind HTTP and WebSocket endpoints.
#[derive(Parser)]
#[command(version, about, long_about = None, author)]
pub struct Cli {
    /// Config file (defaults to the user config directory's kernelhub/config.toml)
    #[arg(long, global = true, env = "KERNELHUB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Serve the gateway until interrupted
    Serve {
        /// Address to bind (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Execute a file, or stdin, in a throwaway kernel and print its output
    Run {
        /// File to execute; reads stdin when omitted
        file: Option<PathBuf>,
        /// Give up after this many seconds regardless of output
        #[arg(long)]
        timeout: Option<u64>,
        /// Print each event as a JSON line
        #[arg(long)]
        json: bool,
    },
}
