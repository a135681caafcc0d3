//! Operator CLI for Oneiric.
//!
//! Exit codes: 0 success, 2 invalid usage (clap), 3 not-found, 4 health
//! failure, 5 swap failure, 6 remote sync failure, 1 anything else.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use oneiric::bridge::UseOptions;
use oneiric::config::{OneiricConfig, Profile};
use oneiric::domain::{Domain, Slot};
use oneiric::events::TracingSink;
use oneiric::factory::FactoryIndex;
use oneiric::lifecycle::LifecycleError;
use oneiric::orchestrator::Orchestrator;
use oneiric::resolver::{ResolveError, ResolveOptions};
use oneiric_remote::{RefreshLoop, RemotePipeline};

const EXIT_OTHER: i32 = 1;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_HEALTH: i32 = 4;
const EXIT_SWAP: i32 = 5;
const EXIT_REMOTE: i32 = 6;

#[derive(Parser)]
#[command(name = "oneiric", version, about = "Resolution + lifecycle layer for pluggable components")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum SyncMode {
    Once,
    Watch,
}

#[derive(Subcommand)]
enum Command {
    /// List registered candidates in a domain.
    List { domain: Domain },
    /// Explain which candidate wins for a slot and why.
    Explain {
        domain: Domain,
        key: String,
        /// Explicit provider override to explain against.
        #[arg(long)]
        provider: Option<String>,
        /// Required capabilities (repeatable).
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Show the persisted status snapshot for a slot.
    Status { domain: Domain, key: String },
    /// Swap a slot to an explicit provider.
    Swap {
        domain: Domain,
        key: String,
        provider: String,
        /// Discard the previous instance instead of rolling back.
        #[arg(long)]
        force: bool,
    },
    /// Pause a slot: watchers skip pending swaps.
    Pause {
        domain: Domain,
        key: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Drain a slot: watchers defer pending swaps.
    Drain {
        domain: Domain,
        key: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Clear pause and drain flags.
    Resume { domain: Domain, key: String },
    /// Report slot health; `--probe` activates and probes live.
    Health {
        domain: Domain,
        key: String,
        #[arg(long)]
        probe: bool,
    },
    /// Run the remote manifest pipeline.
    RemoteSync {
        #[arg(value_enum)]
        mode: SyncMode,
        /// Manifest location, overriding `remote.manifest_url`.
        #[arg(long)]
        url: Option<String>,
    },
    /// Run the supervised orchestrator process.
    Orchestrate {
        #[arg(long, value_enum)]
        profile: Option<CliProfile>,
    },
    /// Print the effective configuration as YAML.
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliProfile {
    Default,
    Serverless,
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("oneiric={default},oneiric_remote={default}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A failure with its operator-facing exit code.
struct CliFailure {
    code: i32,
    source: anyhow::Error,
}

impl CliFailure {
    fn other(source: anyhow::Error) -> Self {
        Self {
            code: EXIT_OTHER,
            source,
        }
    }
}

impl From<anyhow::Error> for CliFailure {
    fn from(source: anyhow::Error) -> Self {
        Self::other(source)
    }
}

fn lifecycle_exit_code(err: &LifecycleError) -> i32 {
    match err {
        LifecycleError::Resolve(
            ResolveError::NoCandidate { .. } | ResolveError::UnknownProviderOverride { .. },
        )
        | LifecycleError::NotActive { .. } => EXIT_NOT_FOUND,
        LifecycleError::SwapFailed { .. } => EXIT_SWAP,
        LifecycleError::HealthCheckFailed { .. } => EXIT_HEALTH,
        _ => EXIT_OTHER,
    }
}

struct Runtime {
    config: OneiricConfig,
    orchestrator: Orchestrator,
}

fn build_runtime(config_path: Option<&PathBuf>) -> Result<Runtime, CliFailure> {
    let config = OneiricConfig::load_or_default(config_path)?;
    let status_dir = config
        .activity
        .store_path
        .parent()
        .map_or_else(|| PathBuf::from(".oneiric/status"), |p| p.join("status"));
    let orchestrator = Orchestrator::build(
        &config,
        Arc::new(FactoryIndex::new()),
        status_dir,
        Arc::new(TracingSink),
    )?;
    Ok(Runtime {
        config,
        orchestrator,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliFailure> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| CliFailure::other(anyhow::Error::new(e)))?;
    println!("{rendered}");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliFailure> {
    match cli.command {
        Command::List { domain } => {
            let runtime = build_runtime(cli.config.as_ref())?;
            let candidates = runtime.orchestrator.registry().list(domain, None);
            if candidates.is_empty() {
                println!("no candidates registered for domain '{domain}'");
                return Ok(());
            }
            for candidate in candidates {
                println!(
                    "{}/{}  provider={}  source={}  stack_level={}  priority={}  seq={}",
                    candidate.domain,
                    candidate.key,
                    candidate.provider,
                    candidate.source,
                    candidate.stack_level,
                    candidate
                        .priority
                        .map_or_else(|| "unset".to_owned(), |p| p.to_string()),
                    candidate.sequence,
                );
            }
            Ok(())
        }

        Command::Explain {
            domain,
            key,
            provider,
            capabilities,
        } => {
            let runtime = build_runtime(cli.config.as_ref())?;
            let opts = ResolveOptions {
                provider,
                capabilities: capabilities.into_iter().collect::<BTreeSet<_>>(),
                ..ResolveOptions::default()
            };
            let trace = runtime.orchestrator.resolver().explain(domain, &key, &opts);
            if trace.considered.is_empty() {
                print_json(&trace)?;
                return Err(CliFailure {
                    code: EXIT_NOT_FOUND,
                    source: anyhow::anyhow!("no candidate registered for {domain}/{key}"),
                });
            }
            print_json(&trace)
        }

        Command::Status { domain, key } => {
            let runtime = build_runtime(cli.config.as_ref())?;
            match runtime.orchestrator.status().load(&Slot::new(domain, key.clone())) {
                Some(snapshot) => print_json(&snapshot),
                None => {
                    let snapshot = runtime.orchestrator.lifecycle().status_of(domain, &key).await;
                    if runtime
                        .orchestrator
                        .registry()
                        .candidates_for(domain, &key)
                        .is_empty()
                    {
                        return Err(CliFailure {
                            code: EXIT_NOT_FOUND,
                            source: anyhow::anyhow!("nothing known about {domain}/{key}"),
                        });
                    }
                    print_json(&snapshot)
                }
            }
        }

        Command::Swap {
            domain,
            key,
            provider,
            force,
        } => {
            let runtime = build_runtime(cli.config.as_ref())?;
            let bridge = runtime.orchestrator.bridge(domain);
            match bridge.swap(&key, &provider, force).await {
                Ok(handle) => {
                    println!("swapped {domain}/{key} to provider '{}'", handle.provider);
                    runtime.orchestrator.lifecycle().shutdown_all().await;
                    Ok(())
                }
                Err(err) => Err(CliFailure {
                    code: lifecycle_exit_code(&err),
                    source: anyhow::Error::new(err),
                }),
            }
        }

        Command::Pause { domain, key, note } => {
            let runtime = build_runtime(cli.config.as_ref())?;
            let flags = runtime
                .orchestrator
                .lifecycle()
                .pause(domain, &key, note)
                .await
                .map_err(|e| CliFailure::other(anyhow::Error::new(e)))?;
            print_json(&flags)
        }

        Command::Drain { domain, key, note } => {
            let runtime = build_runtime(cli.config.as_ref())?;
            let flags = runtime
                .orchestrator
                .lifecycle()
                .drain(domain, &key, note)
                .await
                .map_err(|e| CliFailure::other(anyhow::Error::new(e)))?;
            print_json(&flags)
        }

        Command::Resume { domain, key } => {
            let runtime = build_runtime(cli.config.as_ref())?;
            let flags = runtime
                .orchestrator
                .lifecycle()
                .resume(domain, &key)
                .await
                .map_err(|e| CliFailure::other(anyhow::Error::new(e)))?;
            print_json(&flags)
        }

        Command::Health { domain, key, probe } => {
            let runtime = build_runtime(cli.config.as_ref())?;
            if probe {
                let bridge = runtime.orchestrator.bridge(domain);
                bridge
                    .use_slot(&key, &UseOptions::default())
                    .await
                    .map_err(|err| CliFailure {
                        code: lifecycle_exit_code(&err),
                        source: anyhow::Error::new(err),
                    })?;
                let result = runtime
                    .orchestrator
                    .lifecycle()
                    .probe(domain, &key)
                    .await
                    .map_err(|err| CliFailure {
                        code: lifecycle_exit_code(&err),
                        source: anyhow::Error::new(err),
                    })?;
                let healthy = result.healthy;
                print_json(&result)?;
                runtime.orchestrator.lifecycle().shutdown_all().await;
                if !healthy {
                    return Err(CliFailure {
                        code: EXIT_HEALTH,
                        source: anyhow::anyhow!("{domain}/{key} is unhealthy"),
                    });
                }
                Ok(())
            } else {
                let snapshot = runtime
                    .orchestrator
                    .status()
                    .load(&Slot::new(domain, key.clone()))
                    .ok_or_else(|| CliFailure {
                        code: EXIT_NOT_FOUND,
                        source: anyhow::anyhow!("no status snapshot for {domain}/{key}"),
                    })?;
                let healthy = snapshot.last_health_ok;
                print_json(&snapshot)?;
                if healthy == Some(false) {
                    return Err(CliFailure {
                        code: EXIT_HEALTH,
                        source: anyhow::anyhow!("{domain}/{key} last probe failed"),
                    });
                }
                Ok(())
            }
        }

        Command::RemoteSync { mode, url } => {
            let runtime = build_runtime(cli.config.as_ref())?;
            let mut remote = runtime.config.remote.clone();
            if let Some(url) = url {
                remote.manifest_url = Some(url);
            }
            let pipeline = RemotePipeline::from_config(
                &remote,
                runtime.orchestrator.registry().clone(),
                runtime.orchestrator.factory_guard().clone(),
                Arc::new(TracingSink),
            )
            .map_err(|e| CliFailure {
                code: EXIT_REMOTE,
                source: anyhow::Error::new(e),
            })?;

            match mode {
                SyncMode::Once => {
                    let report = pipeline.sync_once().await.map_err(|e| CliFailure {
                        code: EXIT_REMOTE,
                        source: anyhow::Error::new(e),
                    })?;
                    print_json(&report)
                }
                SyncMode::Watch => {
                    let interval =
                        std::time::Duration::from_secs(remote.refresh_interval_secs.max(1));
                    let refresh = RefreshLoop::new(Arc::new(pipeline), interval);
                    let cancel = tokio_cancel_on_ctrl_c();
                    oneiric::orchestrator::RunnableTask::run(&refresh, cancel)
                        .await
                        .map_err(CliFailure::other)
                }
            }
        }

        Command::Orchestrate { profile } => {
            let mut config = OneiricConfig::load_or_default(cli.config.as_ref())?;
            if let Some(profile) = profile {
                config.profile = match profile {
                    CliProfile::Default => Profile::Default,
                    CliProfile::Serverless => Profile::Serverless,
                };
                config.apply_profile();
            }

            let status_dir = config
                .activity
                .store_path
                .parent()
                .map_or_else(|| PathBuf::from(".oneiric/status"), |p| p.join("status"));
            let mut orchestrator = Orchestrator::build(
                &config,
                Arc::new(FactoryIndex::new()),
                status_dir,
                Arc::new(TracingSink),
            )?;

            if let Some(path) = cli.config.clone() {
                orchestrator.add_config_watcher(&config, path);
            }
            if config.remote.enabled {
                let pipeline = RemotePipeline::from_config(
                    &config.remote,
                    orchestrator.registry().clone(),
                    orchestrator.factory_guard().clone(),
                    Arc::new(TracingSink),
                )
                .map_err(|e| CliFailure {
                    code: EXIT_REMOTE,
                    source: anyhow::Error::new(e),
                })?;
                let interval =
                    std::time::Duration::from_secs(config.remote.refresh_interval_secs);
                orchestrator.add_task(Arc::new(RefreshLoop::new(Arc::new(pipeline), interval)));
            }

            orchestrator.start();
            tracing::info!("Orchestrator running; Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| CliFailure::other(anyhow::Error::new(e)))?;
            orchestrator.stop().await;
            Ok(())
        }

        Command::Config => {
            let config = OneiricConfig::load_or_default(cli.config.as_ref())?;
            let yaml = config.to_yaml()?;
            println!("{yaml}");
            Ok(())
        }
    }
}

/// A token that fires on Ctrl-C, for foreground watch loops.
fn tokio_cancel_on_ctrl_c() -> tokio_util::sync::CancellationToken {
    let cancel = tokio_util::sync::CancellationToken::new();
    let child = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(failure) = run(cli).await {
        eprintln!("error: {:#}", failure.source);
        std::process::exit(failure.code);
    }
}
