//! rig-capture - Seabed Imaging Rig Capture Service

use anyhow::Context;
use camera_capture::{create_backend, CameraSource};
use exif_tagger::ExifTagger;
use gps_telemetry::{GpsSource, TimeSync};
use orchestrator::{
    init_logging, CaptureOrchestrator, LogSink, OrchestratorContext, RigConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::StorageSink;
use timebase::{PpsClock, RealtimeClock};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "rig.toml".to_string()),
    );
    let config = RigConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    info!("=== rig-capture v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        fps = config.capture_fps,
        backend = ?config.camera.backend,
        base = %config.storage.base_path.display(),
        "starting capture service"
    );

    let ctx = OrchestratorContext::new(config);

    let backend = create_backend(ctx.config.camera.backend)?;
    let camera = CameraSource::new(
        backend,
        ctx.config.camera.clone(),
        Arc::clone(&ctx.timebase),
    );
    let camera = if ctx.config.pps_enabled {
        let pps = PpsClock::new(0);
        if pps.is_available() {
            info!("pps source attached");
            camera.with_pps(pps)
        } else {
            warn!("pps enabled but no kernel pps source found");
            camera
        }
    } else {
        camera
    };

    let gps = match ctx.config.gps.clone() {
        Some(gps_config) => match GpsSource::connect(gps_config.clone()) {
            Ok(gps) => {
                let mut gps = gps.with_time_sync(TimeSync::new(
                    Arc::new(RealtimeClock),
                    Arc::clone(&ctx.timebase),
                ));
                if gps_config.require_fix {
                    let budget = Duration::from_secs(gps_config.fix_timeout_secs);
                    let fix = gps
                        .wait_for_fix(budget)
                        .await
                        .context("no valid gps fix within the startup budget")?;
                    info!(
                        lat = fix.latitude,
                        lon = fix.longitude,
                        satellites = fix.satellites_used,
                        "startup fix acquired"
                    );
                }
                Some(gps)
            }
            Err(e) if gps_config.require_fix => {
                return Err(e).context("gps fix is required but the port is unavailable");
            }
            Err(e) => {
                warn!("gps unavailable, continuing with fallback tags: {}", e);
                None
            }
        },
        None => None,
    };

    let sink = StorageSink::new(ctx.config.storage.clone())?;

    let mut orch = CaptureOrchestrator::new(ctx, camera, gps, Arc::new(ExifTagger::new()), sink);
    orch.add_status_sink(Arc::new(LogSink));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let summary = orch.run(shutdown_rx).await?;
    info!(
        images = summary.images_captured,
        errors = summary.errors,
        "rig-capture exiting"
    );
    Ok(())
}
