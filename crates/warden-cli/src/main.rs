use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use warden_hw::{Camera, CaptureSource};

#[derive(Parser)]
#[command(name = "warden", about = "Warden presence-detection CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the detection loop
    Start,
    /// Stop the detection loop
    Stop,
    /// Show daemon and loop status
    Status,
    /// Reload signatures and settings from the database
    Reload,
    /// Change a runtime setting (e.g. `unknownThreshold 5`)
    Set {
        key: String,
        value: String,
    },
    /// List recent intrusion alerts
    Alerts {
        /// Maximum number of alerts to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Save the daemon's latest annotated frame
    Snapshot {
        #[arg(short, long, default_value = "warden-snapshot.jpg")]
        output: PathBuf,
    },
    /// List V4L2 capture devices (bypasses the daemon)
    Devices,
    /// Capture one frame directly from a camera (bypasses the daemon)
    Test {
        /// Device index (/dev/videoN)
        #[arg(short, long, default_value_t = 0)]
        device: u32,
        #[arg(short, long, default_value = "warden-test.jpg")]
        output: PathBuf,
    },
}

#[zbus::proxy(
    interface = "org.freedesktop.Warden1",
    default_service = "org.freedesktop.Warden1",
    default_path = "/org/freedesktop/Warden1"
)]
trait Warden {
    async fn start(&self) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn reload_catalog(&self) -> zbus::Result<u32>;
    async fn reload_settings(&self) -> zbus::Result<String>;
    async fn set_setting(&self, key: &str, value: &str) -> zbus::Result<String>;
    async fn recent_alerts(&self, limit: u32) -> zbus::Result<String>;
    async fn last_frame(&self) -> zbus::Result<(Vec<u8>, String)>;
}

const WARMUP_FRAMES: usize = 4;
const READ_ATTEMPTS: usize = 20;

async fn connect() -> Result<WardenProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    tracing::debug!(unique_name = ?conn.unique_name(), "connected to session bus");
    WardenProxy::new(&conn)
        .await
        .context("wardend is not reachable; is it running?")
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_else(|_| raw.to_string())),
        Err(_) => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let report = connect().await?.start().await?;
            print_json(&report);
        }
        Commands::Stop => {
            if connect().await?.stop().await? {
                println!("detection loop stopped");
            } else {
                println!("detection loop was not running");
            }
        }
        Commands::Status => {
            print_json(&connect().await?.status().await?);
        }
        Commands::Reload => {
            let proxy = connect().await?;
            let count = proxy.reload_catalog().await?;
            println!("{count} signature(s) loaded");
            print_json(&proxy.reload_settings().await?);
        }
        Commands::Set { key, value } => {
            print_json(&connect().await?.set_setting(&key, &value).await?);
        }
        Commands::Alerts { limit } => {
            let raw = connect().await?.recent_alerts(limit).await?;
            let alerts: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
            if alerts.is_empty() {
                println!("no alerts recorded");
            }
            for a in &alerts {
                let d = &a["details"];
                println!(
                    "{}  {:<20} blacklisted={:<5} email={:<5} {}",
                    a["created_at"].as_str().unwrap_or("-"),
                    d["intruder_name"].as_str().unwrap_or("Unknown"),
                    d["is_blacklisted"].as_bool().unwrap_or(false),
                    d["email_sent"].as_bool().unwrap_or(false),
                    a["image_path"].as_str().unwrap_or(""),
                );
            }
        }
        Commands::Snapshot { output } => {
            let (jpeg, detections) = connect().await?.last_frame().await?;
            if jpeg.is_empty() {
                bail!("no frame available; is the detection loop running?");
            }
            std::fs::write(&output, &jpeg)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("saved {} ({} bytes)", output.display(), jpeg.len());
            print_json(&detections);
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("no V4L2 capture devices found");
            }
            for d in devices {
                println!("{:>2}  {:<14} {} ({})", d.index, d.path, d.name, d.driver);
            }
        }
        Commands::Test { device, output } => {
            println!("Opening {} ...", Camera::device_path(device));
            let mut camera = Camera::open(device)?;
            println!(
                "  {}x{} {:?}",
                camera.width, camera.height, camera.pixel_format
            );

            // Discard warmup frames so exposure settles; keep the last good one.
            let mut frame = None;
            let mut good = 0;
            for _ in 0..READ_ATTEMPTS {
                match camera.read_frame() {
                    Some(f) => {
                        frame = Some(f);
                        good += 1;
                        if good > WARMUP_FRAMES {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!(device, "frame read failed; retrying");
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
            }
            camera.close();
            println!("  {good} frame(s) read");

            let Some(frame) = frame else {
                bail!("camera opened but delivered no frames");
            };
            frame
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("saved {}", output.display());
        }
    }

    Ok(())
}
