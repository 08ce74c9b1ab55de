use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use warden_core::{FaceMatcher, OnnxAnalyzer, SignatureCatalog};
use warden_hw::V4lOpener;

mod config;
mod dbus_interface;
mod engine;
mod events;
mod evidence;
mod lockdown;
mod notify;
mod orchestrator;
mod process;
mod settings;
mod speech;
mod store;

use dbus_interface::{WardenService, BUS_NAME, OBJECT_PATH};
use engine::{DetectionLoop, EngineParts, LoopTiming};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("wardend starting");
    let config = config::Config::from_env();

    let store = Arc::new(
        store::Store::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let settings = Arc::new(settings::SettingsHandle::new(store.clone()));
    let catalog = Arc::new(SignatureCatalog::new(store.clone()));
    if let Err(e) = catalog.reload() {
        tracing::warn!(error = %e, "initial catalog load failed");
    }

    let evidence = evidence::EvidenceStore::new(&config.captures_dir);
    evidence.cleanup_older_than(config.capture_retention_days);

    // Models are required; fail fast.
    let analyzer = OnnxAnalyzer::load(&config.model_dir)
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;
    tracing::info!(dir = %config.model_dir.display(), "face models loaded");

    let speech = speech::SpeechQueue::spawn(
        Box::new(speech::CommandSpeaker::new(
            config.tts_command.clone(),
            config.command_timeout,
        )),
        config.speech_queue_depth,
    )
    .context("spawning speech worker")?;
    let notifier = notify::SendmailNotifier::new(
        config.mail_command.clone(),
        config.mail_from.clone(),
        config.command_timeout,
    );
    let lockdown = lockdown::SessionLock::new(
        config.lock_command.clone(),
        config.screenshot_command.clone(),
        config.command_timeout,
    );

    let orchestrator = orchestrator::AlertOrchestrator::new(
        evidence,
        Arc::new(speech),
        Arc::new(notifier),
        store.clone(),
        Arc::new(lockdown),
        config.grace_period,
    );

    let events = events::EventBus::new(config.event_capacity);
    let parts = EngineParts {
        catalog: catalog.clone(),
        settings: settings.clone(),
        opener: Arc::new(V4lOpener),
        orchestrator: Arc::new(orchestrator),
        events: events.clone(),
        timing: LoopTiming {
            throttle: config.throttle,
            idle_sleep: config.idle_sleep,
            stop_timeout: config.stop_timeout,
        },
    };
    let matcher = FaceMatcher::new(Box::new(analyzer), settings.current().frame_scale);
    let engine = DetectionLoop::new(parts, matcher);
    let status = engine.status_handle();
    let engine = Arc::new(Mutex::new(engine));

    let latest_frame = Arc::new(Mutex::new(None));
    let service = WardenService {
        engine: engine.clone(),
        status,
        catalog,
        settings,
        store,
        latest_frame: latest_frame.clone(),
    };

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;
    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    // Keep the most recent frame for LastFrame().
    let mut frames = events.subscribe_frames();
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => *latest_frame.lock().unwrap_or_else(|p| p.into_inner()) = Some(frame),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Forward alerts as D-Bus signals.
    let mut alerts = events.subscribe_alerts();
    let signal_conn = conn.clone();
    tokio::spawn(async move {
        loop {
            let alert = match alerts.recv().await {
                Ok(alert) => alert,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "alert forwarder lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let payload = match serde_json::to_string(&alert) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "alert serialization failed");
                    continue;
                }
            };
            let iface = match signal_conn
                .object_server()
                .interface::<_, WardenService>(OBJECT_PATH)
                .await
            {
                Ok(iface) => iface,
                Err(e) => {
                    tracing::warn!(error = %e, "D-Bus interface lookup failed");
                    continue;
                }
            };
            if let Err(e) = WardenService::alert_raised(iface.signal_emitter(), &payload).await {
                tracing::warn!(error = %e, "failed to emit AlertRaised");
            }
        }
    });

    if config.autostart {
        let engine = engine.clone();
        let started = tokio::task::spawn_blocking(move || {
            engine.lock().unwrap_or_else(|p| p.into_inner()).start()
        })
        .await?;
        match started {
            Ok(report) => tracing::info!(camera = ?report.camera_device, "autostart complete"),
            Err(e) => tracing::warn!(error = %e, "autostart failed; waiting for Start()"),
        }
    }

    tracing::info!("wardend ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("wardend shutting down");

    tokio::task::spawn_blocking(move || {
        engine.lock().unwrap_or_else(|p| p.into_inner()).stop();
    })
    .await?;

    Ok(())
}
