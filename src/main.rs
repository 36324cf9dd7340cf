//! BerryCam Control Plane
//!
//! Main entry point for the device service.

use berrycam::{
    command_router::{CommandRouter, StatusLed},
    control_loop::{ControlLoop, COMMAND_QUEUE_DEPTH},
    device_state::{locations, AiState, DeviceState, DeviceStateStore},
    harvest_client::HarvestClient,
    inference_gate::{HttpEngine, InferenceGate, V4l2Camera},
    network_supervisor::{NetworkSupervisor, NmcliWifi},
    realtime_hub::RealtimeHub,
    session_authority::SessionAuthority,
    settings_vault::{SettingsRepository, SettingsVault},
    state::{AppConfig, AppState},
    web_api,
    wireless_port::{spawn_bridge, UnixSocketLink, WirelessPort},
};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "berrycam=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting BerryCam v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        data_dir = %config.data_dir.display(),
        video_device = %config.video_device,
        engine_url = %config.engine_url,
        wifi_interface = %config.wifi_interface,
        "Configuration loaded"
    );

    // Initialize components
    let repository = SettingsRepository::new(config.data_dir.clone());
    let vault = Arc::new(SettingsVault::new(repository).await?);

    let sessions = Arc::new(SessionAuthority::new(vault.clone()).await?);
    tracing::info!("SessionAuthority initialized");

    // Seed runtime state from the persisted settings
    let settings = vault.snapshot().await;
    let display_ok = config.display_device.exists();
    let initial = DeviceState {
        ai: AiState {
            model_ref: settings.ai_model_ref.clone(),
            ..Default::default()
        },
        location: settings.location_id.as_deref().and_then(locations::find),
        display_ready: display_ok,
        ..Default::default()
    };
    let store = Arc::new(DeviceStateStore::new(initial));

    let camera = Arc::new(V4l2Camera::new(config.video_device.clone()));
    let engine = Arc::new(HttpEngine::new(config.engine_url.clone()));
    let gate = Arc::new(InferenceGate::new(
        camera,
        engine,
        store.clone(),
        vault.clone(),
    ));
    tracing::info!("InferenceGate initialized");

    let harvest = Arc::new(HarvestClient::new(vault.clone()));
    let hub = Arc::new(RealtimeHub::new());

    let wifi = Arc::new(NmcliWifi::new(config.wifi_interface.clone()));
    let supervisor = Arc::new(NetworkSupervisor::new(
        wifi,
        vault.clone(),
        store.clone(),
        config.ap_ssid.clone(),
        config.ap_channel,
    ));
    tracing::info!("NetworkSupervisor initialized");

    let free_memory = Arc::new(AtomicU64::new(0));
    let led = StatusLed::new(config.led_path.clone());
    let router = Arc::new(CommandRouter::new(
        store.clone(),
        vault.clone(),
        sessions.clone(),
        gate.clone(),
        harvest.clone(),
        led,
        Instant::now(),
        free_memory.clone(),
    ));

    // Command queue shared by every transport
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

    let link = Arc::new(UnixSocketLink::new());
    let wireless = Arc::new(WirelessPort::new(link.clone(), command_tx.clone()));
    spawn_bridge(config.wireless_socket.clone(), link, wireless.clone());
    tracing::info!(socket = %config.wireless_socket.display(), "Wireless bridge started");

    // Probe hardware before accepting work
    let camera_ok = gate.probe_camera().await;
    let engine_ok = gate.engine_online().await;
    tracing::info!(
        camera_ready = camera_ok,
        engine_online = engine_ok,
        display_ready = display_ok,
        "Hardware probe complete"
    );

    // Bring the uplink up; AP fallback keeps the device reachable
    match supervisor.ensure_connectivity().await {
        Ok(true) => tracing::info!("Uplink connected"),
        Ok(false) => tracing::warn!("No uplink, provisioning access point active"),
        Err(e) => tracing::error!(error = %e, "Connectivity setup failed"),
    }

    // Initial cloud registration; the loop retries on schedule
    if settings.cloud.enabled {
        let network = store.read().await.network;
        let ip = (!network.ip.is_empty()).then_some(network.ip);
        let stream_url = ip
            .as_deref()
            .map(|ip| format!("ws://{}:{}/api/ws", ip, config.port));
        if let Err(e) = harvest
            .ensure_registered(ip.as_deref(), stream_url.as_deref())
            .await
        {
            tracing::warn!(error = %e, "Initial cloud registration failed");
        }
    }

    // Create application state
    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        vault: vault.clone(),
        sessions,
        gate: gate.clone(),
        harvest: harvest.clone(),
        hub: hub.clone(),
        supervisor: supervisor.clone(),
        router: router.clone(),
        wireless: wireless.clone(),
        command_tx,
    };

    // Start the control loop
    ControlLoop::new(
        store,
        vault,
        gate,
        harvest,
        hub,
        supervisor,
        router,
        wireless,
        free_memory,
        config.port,
        command_rx,
    )
    .spawn();

    // Create router with static file serving
    let serve_dir = ServeDir::new(&config.static_dir)
        .not_found_service(ServeFile::new(config.static_dir.join("index.html")));

    let app = web_api::create_router(state)
        .fallback_service(serve_dir)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    tracing::info!(static_dir = %config.static_dir.display(), "Static file serving enabled");

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
