use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use annosync::cli::{CheckpointCommand, Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    annosync::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Sync(args) => {
            annosync::sync::run(args).await.context("sync")?;
        }
        Command::Convert(args) => {
            annosync::assemble::submit(args).await.context("convert")?;
        }
        Command::Checkpoint {
            command: CheckpointCommand::Show(args),
        } => {
            annosync::checkpoint::show(args)
                .await
                .context("checkpoint show")?;
        }
    }

    Ok(())
}
