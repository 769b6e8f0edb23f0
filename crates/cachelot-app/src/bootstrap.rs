//! Application boot sequence.
//!
//! Construction is split from execution: `BootstrapDependencies` gathers the
//! collaborators, `run_app_with` takes them through probes, recovery, task
//! spawning, and the shutdown wait. Tests wire fakes into the same path.

use std::path::Path;
use std::sync::Arc;

use cachelot_config::SettingsSnapshot;
use cachelot_core::model::ImportList;
use cachelot_core::service::MediaServer;
use cachelot_data::TrackerStore;
use cachelot_events::{Event, EventBus, ServiceState};
use cachelot_fsops::{Relocator, RelocatorConfig, probe_symlink_support};
use cachelot_telemetry::{LogFormat, LoggingConfig, Metrics};
use cachelot_upstream::{UpstreamClient, UpstreamClientConfig};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::lock::InstanceLock;
use crate::orchestrator::{CacheOrchestrator, OrchestratorDeps};

/// Dependencies required to bootstrap the daemon.
pub(crate) struct BootstrapDependencies {
    snapshot: SettingsSnapshot,
    logging: LoggingConfig,
    events: EventBus,
    metrics: Metrics,
    server: Arc<dyn MediaServer>,
}

impl BootstrapDependencies {
    /// Construct production dependencies from the settings file.
    pub(crate) fn from_settings_file(path: &Path) -> AppResult<Self> {
        let snapshot = cachelot_config::load(path)
            .map_err(|source| AppError::config("settings.load", source))?;

        let logging = LoggingConfig {
            level: snapshot.settings.log_level.clone(),
            format: match snapshot.settings.log_format {
                cachelot_config::LogFormat::Pretty => LogFormat::Pretty,
                cachelot_config::LogFormat::Json => LogFormat::Json,
            },
            log_dir: Some(snapshot.log_dir()),
        };

        let events = EventBus::with_queue_depth(snapshot.settings.subscriber_queue_depth);
        let metrics =
            Metrics::new().map_err(|source| AppError::telemetry("metrics.new", source))?;
        let server: Arc<dyn MediaServer> = Arc::new(
            UpstreamClient::new(
                UpstreamClientConfig::from(&snapshot.settings.upstream),
                metrics.clone(),
            )
            .map_err(|source| AppError::upstream("client.new", source))?,
        );

        Ok(Self {
            snapshot,
            logging,
            events,
            metrics,
            server,
        })
    }
}

/// Entry point for the daemon boot sequence.
///
/// # Errors
///
/// Returns an error if dependency construction or startup fails; the caller
/// maps it onto the process exit code.
pub async fn run_app(settings_path: &Path) -> AppResult<()> {
    let dependencies = BootstrapDependencies::from_settings_file(settings_path)?;
    Box::pin(run_app_with(dependencies)).await
}

/// Boot sequence that relies entirely on injected dependencies.
pub(crate) async fn run_app_with(dependencies: BootstrapDependencies) -> AppResult<()> {
    let BootstrapDependencies {
        snapshot,
        logging,
        events,
        metrics,
        server,
    } = dependencies;

    std::fs::create_dir_all(snapshot.log_dir()).map_err(|source| AppError::Io {
        operation: "bootstrap.log_dir",
        path: Some(snapshot.log_dir()),
        source,
    })?;
    let _log_guard = cachelot_telemetry::init_logging(&logging)
        .map_err(|source| AppError::telemetry("logging.init", source))?;

    info!("cachelot bootstrap starting");
    events.publish(Event::Status {
        state: ServiceState::Starting,
    });

    let _lock = InstanceLock::acquire(&snapshot.lock_path())?;

    probe_symlink_support(&snapshot.settings.fast_root)
        .map_err(|source| AppError::fsops("bootstrap.symlink_probe", source))?;
    info!(fast_root = %snapshot.settings.fast_root.display(), "symlink probe passed");

    let store = TrackerStore::open(&snapshot.tracker_path())
        .await
        .map_err(|source| AppError::tracker("bootstrap.tracker_open", source))?;

    let relocator = Arc::new(Relocator::new(
        events.clone(),
        metrics.clone(),
        store.clone(),
        RelocatorConfig {
            fast_root: snapshot.settings.fast_root.clone(),
            limit_bytes: snapshot.settings.fast_limit_bytes,
            max_concurrent: snapshot.settings.max_concurrent_relocations,
        },
    ));
    let recovery = relocator
        .recover()
        .await
        .map_err(|source| AppError::fsops("bootstrap.recover", source))?;
    if recovery != cachelot_fsops::RecoveryReport::default() {
        info!(?recovery, "crash recovery repaired tracker state");
    }

    seed_lists(&store, &snapshot).await;

    let orchestrator = CacheOrchestrator::new(OrchestratorDeps {
        snapshot,
        events: events.clone(),
        metrics,
        store,
        relocator,
        server,
    });

    let scheduler = tokio::spawn(Arc::clone(&orchestrator).run_scheduler());
    let reconciler = tokio::spawn(Arc::clone(&orchestrator).run_reconciler());
    events.publish(Event::Status {
        state: ServiceState::Idle,
    });
    info!("cachelot ready");

    wait_for_shutdown_signal().await?;
    info!("shutdown requested");
    orchestrator.begin_shutdown();

    if let Err(err) = scheduler.await {
        warn!(error = %err, "scheduler join failed");
    }
    if let Err(err) = reconciler.await {
        warn!(error = %err, "reconciler join failed");
    }
    info!("cachelot shutdown complete");
    Ok(())
}

async fn seed_lists(store: &TrackerStore, snapshot: &SettingsSnapshot) {
    let known: Vec<String> = match store.lists().await {
        Ok(lists) => lists
            .into_iter()
            .map(|list| list.definition.name)
            .collect(),
        Err(err) => {
            warn!(error = %err, "failed to load import lists for seeding");
            return;
        }
    };
    for definition in &snapshot.settings.lists {
        if known.iter().any(|name| name == &definition.name) {
            continue;
        }
        let list = ImportList {
            id: Uuid::new_v4(),
            definition: definition.clone(),
            last_refreshed: None,
            stale: false,
        };
        match store.insert_list(&list).await {
            Ok(()) => info!(list = %definition.name, "import list seeded from settings"),
            Err(err) => warn!(error = %err, list = %definition.name, "failed to seed list"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> AppResult<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).map_err(|source| AppError::Io {
        operation: "bootstrap.sigterm",
        path: None,
        source,
    })?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(|source| AppError::Io {
            operation: "bootstrap.ctrl_c",
            path: None,
            source,
        }),
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> AppResult<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|source| AppError::Io {
            operation: "bootstrap.ctrl_c",
            path: None,
            source,
        })
}

