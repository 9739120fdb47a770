//! Desktop updater command line
//!
//! Runs one update cycle from a manifest file, the way the desktop shell
//! drives the pipeline after its manifest check.
//!
//! Usage:
//!   desktop-updater --manifest <file> [--channel native|bundle] [--root <dir>]
//!                   [--install] [--verbose]
//!   desktop-updater --list-fallbacks [--root <dir>]
//!   desktop-updater --rollback <bundleVersion> [--root <dir>]
//!   desktop-updater --clear-cache [--channel native|bundle] [--root <dir>]

use std::path::PathBuf;
use std::sync::Arc;

use desktop_updater::logging::{LogLevel, LogOutput, LoggingConfig, LoggingSystem};
use desktop_updater::update::SystemLifecycle;
use desktop_updater::{UpdateChannel, UpdateCoordinator, UpdateEvent, UpdateManifest, UpdaterConfig};

/// What the invocation asks for
enum Action {
    Run { manifest: PathBuf, install: bool },
    ListFallbacks,
    Rollback { bundle_version: String },
    ClearCache,
}

/// Command line arguments
struct Args {
    action: Action,
    channel: UpdateChannel,
    root: Option<PathBuf>,
    verbose: bool,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut args = std::env::args().skip(1);
        let mut manifest = None;
        let mut install = false;
        let mut action = None;
        let mut channel = UpdateChannel::Native;
        let mut root = None;
        let mut verbose = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--manifest" | "-m" => {
                    manifest = args.next().map(PathBuf::from);
                }
                "--channel" | "-c" => {
                    channel = match args.next().as_deref() {
                        Some("native") => UpdateChannel::Native,
                        Some("bundle") => UpdateChannel::Bundle,
                        other => return Err(format!("Invalid channel: {:?}", other)),
                    };
                }
                "--root" | "-r" => {
                    root = args.next().map(PathBuf::from);
                }
                "--install" | "-i" => install = true,
                "--list-fallbacks" => action = Some(Action::ListFallbacks),
                "--rollback" => {
                    let bundle_version = args.next().ok_or("--rollback needs a bundle version")?;
                    action = Some(Action::Rollback { bundle_version });
                }
                "--clear-cache" => action = Some(Action::ClearCache),
                "--verbose" | "-v" => verbose = true,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => return Err(format!("Unknown argument: {}", other)),
            }
        }

        let action = match (action, manifest) {
            (Some(action), _) => action,
            (None, Some(manifest)) => Action::Run { manifest, install },
            (None, None) => return Err("Missing --manifest".to_string()),
        };

        Ok(Self {
            action,
            channel,
            root,
            verbose,
        })
    }
}

fn print_usage() {
    eprintln!(
        "Usage:\n  \
         desktop-updater --manifest <file> [--channel native|bundle] [--root <dir>] [--install] [--verbose]\n  \
         desktop-updater --list-fallbacks [--root <dir>]\n  \
         desktop-updater --rollback <bundleVersion> [--root <dir>]\n  \
         desktop-updater --clear-cache [--channel native|bundle] [--root <dir>]"
    );
}

#[tokio::main]
async fn main() {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            std::process::exit(2);
        }
    };

    let logging_config = if cfg!(debug_assertions) {
        LoggingConfig::development()
    } else {
        LoggingConfig::production()
    };
    let logging_config = match args.verbose {
        true => logging_config.with_level(LogLevel::Debug),
        false => logging_config.with_output(LogOutput::Both),
    };
    let _logging_system = match LoggingSystem::init(logging_config) {
        Ok(system) => Some(system),
        Err(e) => {
            eprintln!("Failed to initialize logging system: {}. Using basic logging.", e);
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                )
                .init();
            None
        }
    };

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "Update failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> desktop_updater::Result<()> {
    let config = match &args.root {
        Some(root) => UpdaterConfig::with_root(root, env!("CARGO_PKG_VERSION")),
        None => UpdaterConfig::default(),
    };
    let (coordinator, mut events) =
        UpdateCoordinator::new(config, Arc::new(SystemLifecycle)).await?;

    match args.action {
        Action::ListFallbacks => {
            if let Some(current) = coordinator.current_bundle().await {
                println!("current  {}", current);
            }
            for record in coordinator.list_fallbacks().await {
                println!("fallback {}", record);
            }
        }
        Action::Rollback { bundle_version } => {
            let record = coordinator
                .list_fallbacks()
                .await
                .into_iter()
                .find(|r| r.bundle_version == bundle_version)
                .ok_or_else(|| {
                    desktop_updater::core::error::InstallError::UnknownFallback {
                        name: bundle_version.clone(),
                    }
                })?;
            let activation = coordinator.rollback(&record).await?;
            println!("Rolled back to {}", activation.record);
        }
        Action::ClearCache => {
            coordinator.clear_cache(args.channel).await?;
            println!("Cleared {} cache", args.channel);
        }
        Action::Run { manifest, install } => {
            let raw = tokio::fs::read_to_string(&manifest).await?;
            let manifest: UpdateManifest = serde_json::from_str(&raw)
                .map_err(|e| desktop_updater::UpdaterError::InvalidManifest(e.to_string()))?;

            let reporter = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        UpdateEvent::StateChanged { channel, to, .. } => {
                            println!("[{}] {}", channel, to);
                        }
                        UpdateEvent::Progress { channel, progress } => {
                            println!(
                                "[{}] {}% ({} / {} bytes)",
                                channel,
                                progress.percent,
                                progress.downloaded_bytes,
                                progress.total_bytes
                            );
                        }
                        UpdateEvent::Failed {
                            channel, kind, message, ..
                        } => {
                            println!("[{}] failed ({}): {}", channel, kind, message);
                        }
                    }
                }
            });

            coordinator.begin(args.channel, manifest)?;
            coordinator.run_to_ready(args.channel).await?;
            if install {
                coordinator.install(args.channel).await?;
            }

            drop(coordinator);
            reporter.await.ok();
        }
    }

    Ok(())
}
