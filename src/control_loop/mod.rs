//! ControlLoop - single periodic driver task
//!
//! ## Responsibilities
//!
//! - Consume the bounded command queue and route results by origin
//! - Status broadcast to sockets and the wireless port (5s)
//! - Connectivity maintenance (10s) with cloud re-registration
//! - Cloud status push (300s, throttled x2 while streaming to clients)
//! - Remote command poll (30s) and per-command acks
//! - Periodic frame upload and the streaming frame tick
//! - Deferred actions: wifi reconnect (500ms) and reboot (1s)
//!
//! Every mutation of DeviceStateStore happens on this task via the
//! command router; ticks only read snapshots and drive IO.

use crate::command_router::{Command, CommandKind, CommandOrigin, CommandRouter, DeferredAction, InboundCommand};
use crate::device_state::DeviceStateStore;
use crate::harvest_client::HarvestClient;
use crate::inference_gate::{FrameOutcome, InferenceGate};
use crate::network_supervisor::{MaintainOutcome, NetworkSupervisor};
use crate::realtime_hub::{CommandReplyMessage, HubMessage, RealtimeHub};
use crate::settings_vault::SettingsVault;
use crate::wireless_port::WirelessPort;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};

/// Depth of the inbound command queue shared by all transports
pub const COMMAND_QUEUE_DEPTH: usize = 32;

/// Status broadcast to connected transports (seconds)
const STATUS_BROADCAST_SECS: u64 = 5;

/// Connectivity maintenance cadence (seconds)
const CONNECTIVITY_CHECK_SECS: u64 = 10;

/// Cloud status push cadence (seconds)
const CLOUD_STATUS_SECS: u64 = 300;

/// Remote command poll cadence (seconds)
const COMMAND_POLL_SECS: u64 = 30;

/// Streaming frame tick (milliseconds)
const FRAME_TICK_MS: u64 = 100;

/// Due-check granularity for timestamp-paced work (milliseconds)
const HOUSEKEEPING_MS: u64 = 250;

/// Delay before a settings-triggered wifi reconnect (milliseconds)
const RECONNECT_DELAY_MS: u64 = 500;

/// Delay between the reboot ack leaving and the restart (milliseconds)
const REBOOT_DELAY_MS: u64 = 1000;

/// ControlLoop instance. Owns the queue receiver; everything else is
/// shared with the HTTP layer through Arcs.
pub struct ControlLoop {
    store: Arc<DeviceStateStore>,
    vault: Arc<SettingsVault>,
    gate: Arc<InferenceGate>,
    harvest: Arc<HarvestClient>,
    hub: Arc<RealtimeHub>,
    supervisor: Arc<NetworkSupervisor>,
    router: Arc<CommandRouter>,
    port: Arc<WirelessPort>,
    free_memory: Arc<AtomicU64>,
    http_port: u16,
    rx: mpsc::Receiver<InboundCommand>,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<DeviceStateStore>,
        vault: Arc<SettingsVault>,
        gate: Arc<InferenceGate>,
        harvest: Arc<HarvestClient>,
        hub: Arc<RealtimeHub>,
        supervisor: Arc<NetworkSupervisor>,
        router: Arc<CommandRouter>,
        port: Arc<WirelessPort>,
        free_memory: Arc<AtomicU64>,
        http_port: u16,
        rx: mpsc::Receiver<InboundCommand>,
    ) -> Self {
        Self {
            store,
            vault,
            gate,
            harvest,
            hub,
            supervisor,
            router,
            port,
            free_memory,
            http_port,
            rx,
        }
    }

    /// Spawn the loop onto the runtime
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive the loop until the command queue closes
    pub async fn run(mut self) {
        tracing::info!("Control loop started");

        let mut sys = System::new_all();
        sys.refresh_memory();
        self.free_memory
            .store(sys.available_memory(), Ordering::Relaxed);

        let mut status_tick = interval(Duration::from_secs(STATUS_BROADCAST_SECS));
        let mut connectivity_tick = interval(Duration::from_secs(CONNECTIVITY_CHECK_SECS));
        let mut frame_tick = interval(Duration::from_millis(FRAME_TICK_MS));
        let mut housekeeping_tick = interval(Duration::from_millis(HOUSEKEEPING_MS));

        let mut last_cloud_push: Option<Instant> = None;
        let mut last_poll: Option<Instant> = None;
        let mut last_frame_upload: Option<Instant> = None;
        let mut last_frame_at: Option<Instant> = None;
        let mut reconnect_at: Option<Instant> = None;
        let mut reboot_at: Option<Instant> = None;

        loop {
            tokio::select! {
                inbound = self.rx.recv() => match inbound {
                    Some(inbound) => {
                        if let Some(action) = self.dispatch(inbound).await {
                            schedule(action, &mut reconnect_at, &mut reboot_at);
                        }
                    }
                    None => {
                        tracing::info!("Command queue closed, control loop exiting");
                        break;
                    }
                },
                _ = status_tick.tick() => {
                    sys.refresh_memory();
                    self.free_memory
                        .store(sys.available_memory(), Ordering::Relaxed);
                    self.broadcast_status().await;
                }
                _ = connectivity_tick.tick() => {
                    self.check_connectivity().await;
                }
                _ = frame_tick.tick() => {
                    self.stream_frame(&mut last_frame_at).await;
                }
                _ = housekeeping_tick.tick() => {
                    self.fire_deadlines(&mut reconnect_at, &mut reboot_at).await;
                    if self.cloud_push_due(&mut last_cloud_push).await {
                        self.push_cloud_status().await;
                    }
                    if due(&mut last_poll, Duration::from_secs(COMMAND_POLL_SECS)) {
                        if let Some(action) = self.poll_cloud_commands().await {
                            schedule(action, &mut reconnect_at, &mut reboot_at);
                        }
                    }
                    self.upload_frame_if_due(&mut last_frame_upload).await;
                }
            }
        }
    }

    /// Execute one queued command and deliver the result back through
    /// the transport it arrived on, then broadcast fresh status so every
    /// connected transport observes the effect immediately.
    async fn dispatch(&self, inbound: InboundCommand) -> Option<DeferredAction> {
        let InboundCommand {
            command,
            origin,
            reply,
        } = inbound;

        tracing::debug!(command = %command.kind.name(), origin = ?origin, "Dispatching command");
        let (result, deferred) = self.router.execute(&command).await;

        let reply_msg = HubMessage::CommandResult(CommandReplyMessage {
            id: command.id.clone(),
            command: command.kind.name().to_string(),
            result: result.clone(),
        });

        match origin {
            CommandOrigin::Socket(client) => {
                self.hub.send_to(&client, reply_msg).await;
            }
            CommandOrigin::Wireless => match serde_json::to_string(&reply_msg) {
                Ok(payload) => {
                    if let Err(e) = self.port.notify_payload(&payload).await {
                        tracing::debug!(error = %e, "Wireless reply not delivered");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode wireless reply"),
            },
            CommandOrigin::Local => {
                if let Some(tx) = reply {
                    let _ = tx.send(result);
                }
            }
        }

        self.broadcast_status().await;
        deferred
    }

    /// Assemble a snapshot and fan it out to sockets and the wireless port
    async fn broadcast_status(&self) {
        let snapshot = self.router.status_snapshot().await;
        let message = HubMessage::Status(snapshot);
        self.hub.broadcast(message.clone()).await;

        match serde_json::to_string(&message) {
            Ok(payload) => {
                if let Err(e) = self.port.notify_payload(&payload).await {
                    tracing::debug!(error = %e, "Wireless status not delivered");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode status broadcast"),
        }
    }

    async fn check_connectivity(&self) {
        match self.supervisor.maintain().await {
            Ok(MaintainOutcome::Reconnected) => {
                tracing::info!("Uplink recovered, refreshing cloud registration");
                self.refresh_registration().await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Connectivity check failed"),
        }
    }

    async fn refresh_registration(&self) {
        let settings = self.vault.snapshot().await;
        if !settings.cloud.enabled {
            return;
        }

        let network = self.store.read().await.network;
        let ip = (!network.ip.is_empty()).then_some(network.ip.as_str());
        let stream_url = ip.map(|ip| format!("ws://{}:{}/api/ws", ip, self.http_port));

        match self
            .harvest
            .ensure_registered(ip, stream_url.as_deref())
            .await
        {
            Ok(uuid) => tracing::debug!(camera_uuid = %uuid, "Cloud registration current"),
            Err(e) => {
                tracing::warn!(error = %e, "Cloud registration failed");
                self.harvest.set_ready(false).await;
            }
        }
    }

    /// Streaming pushes half as often: clients already see live frames,
    /// the cloud record only needs a heartbeat.
    async fn cloud_push_due(&self, last: &mut Option<Instant>) -> bool {
        let streaming = self.store.read().await.streaming_enabled;
        let throttled = streaming && self.hub.has_clients();
        let effective = if throttled {
            Duration::from_secs(CLOUD_STATUS_SECS * 2)
        } else {
            Duration::from_secs(CLOUD_STATUS_SECS)
        };
        due(last, effective)
    }

    async fn push_cloud_status(&self) {
        let settings = self.vault.snapshot().await;
        if !settings.cloud.enabled {
            return;
        }

        if !self.harvest.ready().await {
            self.refresh_registration().await;
            if !self.harvest.ready().await {
                return;
            }
        }

        let snapshot = self.router.status_snapshot().await;
        let mut body = match serde_json::to_value(&snapshot) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode status for cloud push");
                return;
            }
        };
        if let Some(map) = body.as_object_mut() {
            map.insert(
                "status".to_string(),
                json!(if snapshot.streaming { "busy" } else { "online" }),
            );
        }

        match self.harvest.push_status(&body).await {
            Ok(()) => tracing::debug!("Cloud status pushed"),
            Err(e) => {
                tracing::warn!(error = %e, "Cloud status push failed");
                self.harvest.set_ready(false).await;
            }
        }
    }

    /// Pull and execute pending remote commands, acking each one.
    /// Re-delivered ids re-execute; the queue is drained in order.
    async fn poll_cloud_commands(&self) -> Option<DeferredAction> {
        let settings = self.vault.snapshot().await;
        if !settings.cloud.enabled || !self.harvest.ready().await {
            return None;
        }

        let commands = match self.harvest.poll_commands().await {
            Ok(commands) => commands,
            Err(e) => {
                tracing::warn!(error = %e, "Command poll failed");
                return None;
            }
        };

        let mut deferred = None;
        let mut executed = false;
        for remote in commands {
            let Some(id) = remote.id else {
                tracing::warn!(kind = %remote.kind, "Remote command without id skipped");
                continue;
            };

            let command = Command {
                id: Some(id.clone()),
                kind: CommandKind::parse(&remote.kind),
                params: remote.params,
            };

            tracing::info!(command_id = %id, command = %command.kind.name(), "Remote command");
            let (result, action) = self.router.execute(&command).await;
            if result.is_failed() {
                tracing::warn!(command_id = %id, command = %command.kind.name(), "Remote command failed");
            }

            if let Err(e) = self.harvest.acknowledge(&id, &result).await {
                tracing::warn!(command_id = %id, error = %e, "Command ack failed");
            }

            if action.is_some() {
                deferred = action;
            }
            executed = true;
        }

        if executed {
            self.broadcast_status().await;
        }
        deferred
    }

    /// One streaming frame, paced by the tick. A busy rig or an empty
    /// client list drops the frame.
    async fn stream_frame(&self, last_frame_at: &mut Option<Instant>) {
        let state = self.store.read().await;
        if !state.streaming_enabled || !state.camera_ready || !self.hub.has_clients() {
            return;
        }

        match self.gate.capture_frame().await {
            Ok(FrameOutcome::Frame(bytes)) => {
                let delivered = self.hub.broadcast_frame(bytes).await;
                if delivered == 0 {
                    return;
                }

                let now = Instant::now();
                let fps = last_frame_at
                    .map(|prev| {
                        let dt = now.duration_since(prev).as_secs_f32();
                        if dt > 0.0 {
                            1.0 / dt
                        } else {
                            0.0
                        }
                    })
                    .unwrap_or(0.0);
                *last_frame_at = Some(now);

                self.store
                    .mutate(move |s| {
                        s.frames_sent += 1;
                        if fps > 0.0 {
                            s.frame_rate = fps;
                        }
                    })
                    .await;
            }
            Ok(FrameOutcome::Busy) => {}
            Err(e) => tracing::warn!(error = %e, "Frame capture failed"),
        }
    }

    /// Periodic frame upload to the cloud while streaming. The slot is
    /// consumed per attempt, success or not.
    async fn upload_frame_if_due(&self, last: &mut Option<Instant>) {
        let settings = self.vault.snapshot().await;
        if !settings.cloud.enabled || !settings.frame_upload.enabled {
            return;
        }

        let state = self.store.read().await;
        if !state.streaming_enabled || !state.camera_ready || !self.harvest.ready().await {
            return;
        }

        let interval = Duration::from_secs_f64(settings.frame_upload.interval_s.max(1.0));
        if !due(last, interval) {
            return;
        }

        match self.gate.capture_frame().await {
            Ok(FrameOutcome::Frame(bytes)) => {
                if let Err(e) = self.harvest.upload_frame(bytes).await {
                    tracing::warn!(error = %e, "Frame upload failed");
                }
            }
            Ok(FrameOutcome::Busy) => tracing::debug!("Frame upload skipped, camera busy"),
            Err(e) => tracing::warn!(error = %e, "Frame upload capture failed"),
        }
    }

    async fn fire_deadlines(
        &self,
        reconnect_at: &mut Option<Instant>,
        reboot_at: &mut Option<Instant>,
    ) {
        if reconnect_at.is_some_and(|at| Instant::now() >= at) {
            *reconnect_at = None;
            tracing::info!("Applying pending wifi reconnect");
            match self.supervisor.reconnect().await {
                Ok(true) => self.refresh_registration().await,
                Ok(false) => tracing::warn!("Reconnect fell back to the access point"),
                Err(e) => tracing::warn!(error = %e, "Reconnect failed"),
            }
        }

        if reboot_at.is_some_and(|at| Instant::now() >= at) {
            tracing::warn!("Restarting process");
            std::process::exit(0);
        }
    }
}

/// Record a deferred action's deadline
fn schedule(
    action: DeferredAction,
    reconnect_at: &mut Option<Instant>,
    reboot_at: &mut Option<Instant>,
) {
    match action {
        DeferredAction::ReconnectWifi => {
            *reconnect_at = Some(Instant::now() + Duration::from_millis(RECONNECT_DELAY_MS));
        }
        DeferredAction::Reboot => {
            *reboot_at = Some(Instant::now() + Duration::from_millis(REBOOT_DELAY_MS));
        }
    }
}

/// Timestamp-paced due check. `None` means never run, hence due now.
/// Consumes the slot when due.
fn due(last: &mut Option<Instant>, interval: Duration) -> bool {
    let is_due = last.map_or(true, |t| t.elapsed() >= interval);
    if is_due {
        *last = Some(Instant::now());
    }
    is_due
}
