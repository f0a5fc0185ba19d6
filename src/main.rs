use std::process::ExitCode;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn, Level};

mod archive;
mod error;
mod model;
mod progress;
mod settings;
mod web;

use archive::elements::build_registry;
use archive::{CleanupMode, DownloadMode, UpdateMode};
use settings::{Args, OperationMode, Settings};
use web::WebClient;

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // help and version requests are not failures
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    let settings = match Settings::from_args(args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid command line arguments: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(settings.verbosity());
    info!("Starting application...");
    settings.log_banner();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Could not start the runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    // gallery processing is strictly sequential; the only concurrency is the
    // race between the pipeline and the interrupt signal
    let status = runtime.block_on(async {
        tokio::select! {
            result = run(settings) => match result {
                Ok(()) => {
                    info!("Processing finished successfully.");
                    0u8
                }
                Err(e) => {
                    error!("An error occurred: {e:#}");
                    1
                }
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Processing was interrupted.");
                130
            }
        }
    });

    ExitCode::from(status)
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let settings = Rc::new(settings);
    let client = Rc::new(WebClient::new(&settings).context("failed setting up the web client")?);

    match settings.mode() {
        OperationMode::Download => {
            let archivers = build_registry(settings.clone(), client.clone());
            DownloadMode::new(settings, client, archivers)
                .run()
                .await
                .context("download mode failed")?;
        }
        OperationMode::Update => {
            let archivers = build_registry(settings.clone(), client.clone());
            UpdateMode::new(settings, client, archivers)
                .run()
                .await
                .context("update mode failed")?;
        }
        OperationMode::Cleanup => {
            CleanupMode::new(settings, client)
                .run()
                .await
                .context("cleanup mode failed")?;
        }
    }

    Ok(())
}

/// Maps the counted `-v` flag onto a tracing level. Not passing it keeps the
/// default of info; passing it fewer than four times reduces verbosity.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 | 4 => Level::INFO,
        1 | 2 => Level::ERROR,
        3 => Level::WARN,
        5 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}
