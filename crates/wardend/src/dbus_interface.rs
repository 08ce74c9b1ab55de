use crate::engine::{DetectionLoop, StatusHandle};
use crate::events::FrameEvent;
use crate::settings::{self, SettingsHandle};
use crate::store::Store;
use std::sync::{Arc, Mutex};
use warden_core::alert::ALERT_INTRUSION;
use warden_core::SignatureCatalog;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.freedesktop.Warden1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Warden1";

const MAX_ALERTS: u32 = 500;

/// D-Bus control surface for the Warden daemon.
///
/// Bus name: org.freedesktop.Warden1
/// Object path: /org/freedesktop/Warden1
pub struct WardenService {
    pub engine: Arc<Mutex<DetectionLoop>>,
    pub status: StatusHandle,
    pub catalog: Arc<SignatureCatalog>,
    pub settings: Arc<SettingsHandle>,
    pub store: Arc<Store>,
    pub latest_frame: Arc<Mutex<Option<FrameEvent>>>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// Run blocking engine work off the async executor.
async fn blocking<T, F>(f: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(failed)
}

#[interface(name = "org.freedesktop.Warden1")]
impl WardenService {
    /// Start the detection loop. Returns the start report as JSON.
    async fn start(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start requested");
        let engine = self.engine.clone();
        let report = blocking(move || {
            let mut engine = engine.lock().unwrap_or_else(|p| p.into_inner());
            engine.start()
        })
        .await?
        .map_err(failed)?;
        to_json(&report)
    }

    /// Stop the detection loop. False if it was not running.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        let engine = self.engine.clone();
        blocking(move || engine.lock().unwrap_or_else(|p| p.into_inner()).stop()).await
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.status.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
            "settings": self.settings.current().as_ref(),
        })
        .to_string())
    }

    /// Rebuild the signature catalog. Returns the number of signatures.
    async fn reload_catalog(&self) -> zbus::fdo::Result<u32> {
        let catalog = self.catalog.clone();
        let count = blocking(move || catalog.reload()).await?.map_err(failed)?;
        Ok(count as u32)
    }

    /// Re-read runtime settings. Returns the new settings as JSON.
    async fn reload_settings(&self) -> zbus::fdo::Result<String> {
        let settings = self.settings.clone();
        let current = blocking(move || settings.reload()).await?;
        to_json(&*current)
    }

    /// Persist one runtime setting and reload. Returns the new settings as JSON.
    async fn set_setting(&self, key: &str, value: &str) -> zbus::fdo::Result<String> {
        if !settings::is_known_key(key) {
            return Err(zbus::fdo::Error::InvalidArgs(format!("unknown setting {key}")));
        }
        tracing::info!(key, value, "setting changed");
        let store = self.store.clone();
        let handle = self.settings.clone();
        let (key, value) = (key.to_string(), value.to_string());
        let current = blocking(move || store.set_setting(&key, &value).map(|()| handle.reload()))
            .await?
            .map_err(failed)?;
        to_json(&*current)
    }

    /// Most recent intrusion records, newest first, as a JSON array.
    async fn recent_alerts(&self, limit: u32) -> zbus::fdo::Result<String> {
        let store = self.store.clone();
        let limit = limit.clamp(1, MAX_ALERTS);
        let logs = blocking(move || store.recent_logs(limit, Some(ALERT_INTRUSION)))
            .await?
            .map_err(failed)?;
        to_json(&logs)
    }

    /// Latest annotated frame as JPEG bytes plus its detections as JSON.
    /// Empty bytes if no frame has been processed yet.
    async fn last_frame(&self) -> zbus::fdo::Result<(Vec<u8>, String)> {
        let latest = self.latest_frame.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match latest {
            Some(frame) => Ok((frame.jpeg.to_vec(), to_json(&frame)?)),
            None => Ok((Vec::new(), "null".to_string())),
        }
    }

    /// Emitted once per completed alert episode with the alert as JSON.
    #[zbus(signal)]
    pub async fn alert_raised(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;
}
