//! CamSwitch Core entry point. Explicit construction order (spec §9 redesign
//! flag: "actor-per-component with explicit construction order" replacing
//! the teacher's ambient globals + implicit init order): config, logging,
//! event bus, VPU budget, scene store, device probe, one ingest worker per
//! camera, supervisor, mixer, recording coordinator, webhook dispatcher,
//! credential cache, control API.

mod api;
mod config;
mod credentials;
mod device_probe;
mod error;
mod events;
mod ingest;
mod mixer;
mod pipeline;
mod raii_guards;
mod recording;
mod scenes;
mod supervisor;
mod vpu;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use gstreamer as gst;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use device_probe::{DeviceProbe, TestDeviceProbe, V4lDeviceProbe};
use events::EventBus;
use ingest::IngestHandle;
use recording::RecordingCoordinator;
use scenes::SceneStore;
use vpu::VpuBudget;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera capture/mix/record/stream core", long_about = None)]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml", env = "CAMSWITCH_CONFIG")]
    config: PathBuf,

    /// Replaces V4L2 capture and the real device probe with synthetic
    /// `videotestsrc` sources and an in-memory signal table, for the
    /// integration test harness (spec §A.4 in SPEC_FULL.md).
    #[arg(long)]
    test_mode: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> std::process::ExitCode {
    init_tracing();
    let args = CliArgs::parse();

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration invalid, refusing to start");
            return std::process::ExitCode::from(64);
        }
    };

    if let Err(e) = gst::init() {
        error!(error = %e, "failed to initialize GStreamer");
        return std::process::ExitCode::from(70);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return std::process::ExitCode::from(70);
        }
    };

    match runtime.block_on(run(config, args.test_mode)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error, process exiting");
            std::process::ExitCode::from(70)
        }
    }
}

async fn run(config: Config, test_mode: bool) -> anyhow::Result<()> {
    let config = Arc::new(config);
    info!(cameras = config.cameras.len(), test_mode, "starting camswitch-core");

    let events = EventBus::new(256);
    let vpu = VpuBudget::new(config.vpu.max_encode, config.vpu.max_decode);

    let camera_ids: Vec<String> = config.cameras.iter().map(|c| c.id.clone()).collect();
    let scenes_path = if test_mode {
        None
    } else {
        Some(PathBuf::from(&config.recording.root).join("scenes.json"))
    };
    let scenes = Arc::new(SceneStore::load_or_seed_defaults(
        scenes_path,
        config.mixer.canvas_width,
        config.mixer.canvas_height,
        config.mixer.frame_rate,
        &camera_ids,
    ));

    let probe: Arc<dyn DeviceProbe> = if test_mode {
        let test_probe = Arc::new(TestDeviceProbe::new());
        for camera in &config.cameras {
            // Synthetic cameras report signal immediately so cold-start tests
            // do not have to wait out the supervisor's first tick.
            test_probe.set_signal(
                &camera.device,
                Some(device_probe::Resolution {
                    width: camera.max_width,
                    height: camera.max_height,
                    fps: camera.max_fps,
                }),
            );
        }
        test_probe
    } else {
        Arc::new(V4lDeviceProbe::new())
    };

    let mut workers: HashMap<String, IngestHandle> = HashMap::new();
    let mut probe_targets: Vec<(String, IngestHandle)> = Vec::new();
    for camera in &config.cameras {
        let handle = ingest::spawn(
            camera.clone(),
            config.media_server.clone(),
            Arc::clone(&vpu),
            Arc::clone(&events),
            test_mode,
        );
        if camera.enabled {
            handle.enable().await;
        }
        probe_targets.push((camera.device.clone(), handle.clone()));
        workers.insert(camera.id.clone(), handle);
    }
    let workers = Arc::new(workers);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let supervisor = supervisor::Supervisor::new(probe, probe_targets, config.supervisor.tick_seconds);
    let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx.clone()));

    let mixer_handle = mixer::spawn(
        config.mixer.clone(),
        config.media_server.clone(),
        Arc::clone(&scenes),
        Arc::clone(&vpu),
        Arc::clone(&events),
    );
    if let Err(e) = mixer_handle.start().await {
        warn!(error = %e, "mixer failed to start at cold start, leaving it stopped");
    }

    let recording = RecordingCoordinator::new(config.recording.clone(), Arc::clone(&events));
    recording.recover_on_startup(Duration::from_secs(config.supervisor.tick_seconds)).await;

    let webhook_dispatcher = Arc::new(events::WebhookDispatcher::new(
        config.webhooks.clone(),
        std::path::Path::new(&config.recording.root),
    ));
    let webhook_task = tokio::spawn(Arc::clone(&webhook_dispatcher).run(events.subscribe()));

    let credentials = credentials::CredentialCache::new(config.credentials.clone());
    let credential_shutdown_rx = shutdown_rx.clone();
    let credential_task = tokio::spawn(Arc::clone(&credentials).run(credential_shutdown_rx));

    let recording_disk_poll = Arc::clone(&recording);
    let mut disk_shutdown_rx = shutdown_rx.clone();
    let disk_poll_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => recording_disk_poll.poll_disk().await,
                _ = disk_shutdown_rx.changed() => {
                    if *disk_shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    });

    let recording_rotate = Arc::clone(&recording);
    let rotate_workers = Arc::clone(&workers);
    let mut rotate_shutdown_rx = shutdown_rx.clone();
    let rotate_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => recording_rotate.rotate_if_needed(&rotate_workers).await,
                _ = rotate_shutdown_rx.changed() => {
                    if *rotate_shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    });

    let state = api::AppState {
        config: Arc::clone(&config),
        media_server: config.media_server.clone(),
        vpu: Arc::clone(&vpu),
        workers: Arc::clone(&workers),
        events: Arc::clone(&events),
        scenes: Arc::clone(&scenes),
        mixer: mixer_handle.clone(),
        recording: Arc::clone(&recording),
        credentials: Arc::clone(&credentials),
        started_at: Instant::now(),
    };

    let bind_addr: std::net::SocketAddr = format!("{}:{}", config.server.bind_ip, config.server.api_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind-ip/api-port: {e}"))?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "control API listening");
    let router = api::router(state);
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router).await
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    let drain = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        let _ = supervisor_task.await;
        if let Err(e) = mixer_handle.stop().await {
            warn!(error = %e, "mixer stop during shutdown reported an error");
        }
        for handle in workers.values() {
            handle.disable().await;
            handle.shutdown();
        }
        if let Some(active) = recording.status().await {
            if let Err(e) = recording.stop_with_workers(&active.id, &workers).await {
                warn!(error = %e, "failed to finalize active session during shutdown");
            }
        }
        disk_poll_task.abort();
        rotate_task.abort();
        webhook_task.abort();
        credential_task.abort();
    })
    .await;

    server_task.abort();

    match drain {
        Ok(()) => {
            info!("drained cleanly, exiting");
            Ok(())
        }
        Err(_) => {
            error!("drain exceeded {:?} deadline, forcing exit", SHUTDOWN_DEADLINE);
            std::process::exit(70);
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
