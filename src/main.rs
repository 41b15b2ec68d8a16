//! patchline CLI
//!
//! Thin front-end over the updater service: list versions, update or
//! install an instance, and manage installed instances.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use patchline::core::cancel::CancellationSource;
use patchline::core::error::UpdaterResult;
use patchline::core::events::{EventSink, UpdateEvent};
use patchline::core::state::UpdaterService;
use patchline::core::update::UpdateRequest;
use patchline::core::version::{Branch, VersionNumber};

#[derive(Parser)]
#[command(name = "patchline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Differential game client updater")]
struct Cli {
    /// Data directory (defaults to the platform data dir or the bootstrap file)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List versions available for a branch
    Versions {
        #[arg(default_value = "release")]
        branch: Branch,

        /// Ignore cached version and mirror data
        #[arg(long)]
        refresh: bool,
    },

    /// Install or update an instance, then optionally launch it
    Update {
        #[arg(default_value = "release")]
        branch: Branch,

        /// Pinned version; 0 keeps the rolling latest instance current
        #[arg(short, long, default_value_t = 0)]
        version: VersionNumber,

        /// Do not start the client afterwards
        #[arg(long)]
        no_launch: bool,
    },

    /// List installed instances
    List,

    /// Delete one installed instance
    Delete {
        branch: Branch,
        /// 0 for the latest instance
        version: VersionNumber,
    },

    /// Fold legacy instance folders into the current layout
    Migrate,

    /// Set or clear an instance's display name
    Rename {
        branch: Branch,
        version: VersionNumber,
        /// Omit to clear the custom name
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    patchline::init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) if e.is_cancelled() => {
            warn!("Cancelled");
            ExitCode::from(130)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> UpdaterResult<ExitCode> {
    let service = UpdaterService::open(cli.data_dir)?;
    info!("Data directory: {:?}", service.data_dir);

    match cli.command {
        Commands::Versions { branch, refresh } => {
            if refresh {
                service.refresh_caches().await?;
            }
            let versions = service.list_versions(branch).await?;
            let source = if service.catalog().is_mirror_sourced(branch) {
                " (mirror)"
            } else {
                ""
            };
            println!("{branch}{source}: {versions:?}");
        }

        Commands::Update {
            branch,
            version,
            no_launch,
        } => {
            let mut request = UpdateRequest::pinned(branch, version);
            if no_launch {
                request = request.without_launch();
            }
            return update(&service, request).await;
        }

        Commands::List => {
            for instance in service.list_instances().await? {
                println!("{:<28} {}", instance.display_name(), instance.path.display());
            }
        }

        Commands::Delete { branch, version } => {
            service.delete_instance(branch, version).await?;
            println!("Deleted {branch} {version}");
        }

        Commands::Migrate => {
            let report = service.migrate_legacy().await?;
            println!(
                "moved {}, merged {}, conflicted {}",
                report.moved.len(),
                report.merged.len(),
                report.conflicted.len()
            );
            for path in &report.conflicted {
                println!("  left in place: {}", path.display());
            }
        }

        Commands::Rename {
            branch,
            version,
            name,
        } => {
            service.rename_instance(branch, version, name).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn update(service: &UpdaterService, request: UpdateRequest) -> UpdaterResult<ExitCode> {
    let source = Arc::new(CancellationSource::new());
    let ctrl_c = {
        let source = source.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, cancelling");
                source.cancel();
            }
        })
    };

    let (sink, mut rx) = EventSink::channel();
    let printer = tokio::spawn(async move {
        let mut last_percent = None;
        while let Some(event) = rx.recv().await {
            match event {
                UpdateEvent::Progress {
                    stage,
                    percent,
                    message_key,
                    ..
                } => {
                    if last_percent != Some(percent) {
                        info!("[{:>3}%] {:?} {}", percent, stage, message_key);
                        last_percent = Some(percent);
                    }
                }
                UpdateEvent::Error {
                    kind,
                    message,
                    technical_detail,
                } => warn!("{:?}: {} ({})", kind, message, technical_detail),
                UpdateEvent::StateChanged { state, exit_code } => {
                    info!("state: {:?} exit_code: {:?}", state, exit_code)
                }
            }
        }
    });

    let result = service.update(request, &source.signal(), &sink).await;
    drop(sink);
    let _ = printer.await;
    ctrl_c.abort();

    let summary = result?;
    println!(
        "{} {:?} at {}",
        summary.branch,
        summary.outcome,
        summary.instance_path.display()
    );
    Ok(match summary.exit_code {
        Some(code) if code != 0 => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        _ => ExitCode::SUCCESS,
    })
}
