// HoloStore control-plane node entry point.
//
// Parses the CLI, installs logging, and hands off to the node runtime in the
// library crate.

use std::io::IsTerminal;

use clap::{Parser, Subcommand};
use holo_admin::NodeArgs;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-admin")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Node(NodeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => holo_admin::run_node(args).await,
    }
}
