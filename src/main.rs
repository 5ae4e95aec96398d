use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use consensus_reports::cli::{Cli, Commands};
use consensus_reports::commands::{self, ReplicateOptions, ReportOptions, ReportSource};
use consensus_reports::config::Config;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,consensus_reports=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Replicate(args) => {
            let config = Config::load(&args.config)?;
            tracing::info!(config = ?config.redacted(), "loaded config");

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling queries");
                    on_signal.cancel();
                }
            });

            let options = ReplicateOptions {
                keep_tmp: args.keep_tmp,
                skip_upload: args.skip_upload,
            };
            commands::replicate(&config, options, cancel)
                .await
                .map(|summary| {
                    tracing::info!(
                        files = summary.files.len(),
                        remote_dir = summary.remote_dir.as_deref().unwrap_or("-"),
                        "replicate finished"
                    );
                })
        }
        Commands::Report(args) => {
            let source = match args.input_dir {
                Some(dir) => ReportSource::Dir(dir),
                None => ReportSource::Remote,
            };
            let config =
                Config::load_for_report(&args.config, args.upload || source.needs_webdav())?;
            let options = ReportOptions {
                source,
                output: args.output,
                upload: args.upload,
            };
            commands::report(&config, &options).await.map(|path| {
                tracing::info!(path = %path.display(), "report finished");
            })
        }
    };

    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "run failed");
    }
    result
}
