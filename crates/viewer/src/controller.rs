use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relaydesk_protocol::{
    ClientEvent, DisconnectRequest, HostInfo, KeyDirection, PasswordSet, RecordingComplete,
    RelayEvent, ScreenRequest, SessionConfig, ViewerConfig,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capture::DisplayCapture;
use crate::hosts::{AvailableHosts, PendingRemoval, SavedHost, SavedHostStore};
use crate::input::{ClickInput, Disposition, InputForwarder, KeyInput, PointerInput, WheelInput};
use crate::negotiator::{Negotiator, Session, SessionState, Transition};
use crate::recording::{
    HostRecording, HostRecordingUpdate, RecordingArtifact, RecordingError, RecordingManager,
};
use crate::renderer::{DecodedFrame, FrameRenderer, PaintOutcome};
use crate::transport::{Transport, TransportEvent, TransportStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UiMode {
    Landing,
    Fullscreen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NoticeLevel {
    Info,
    Error,
}

/// Everything the front-end needs to render.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UiEvent {
    Status(String),
    Notice { level: NoticeLevel, text: String },
    ModeChanged(UiMode),
    WaitingForApproval { host_name: String },
    PasswordPrompt { machine_id: String },
    ConfirmRemoval { machine_id: String, name: String },
    AvailableHosts(Vec<HostInfo>),
    SavedHosts(Vec<SavedHost>),
    RecordingSaved(RecordingArtifact),
    Recordings(Vec<RecordingArtifact>),
    HostRecording(HostRecordingUpdate),
    HostRecordingComplete(RecordingComplete),
}

/// Actions requested by the user.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UserCommand {
    ListHosts,
    ListSaved,
    Pick(String),
    Code(String),
    /// Open the password prompt for a saved host.
    Reconnect(String),
    /// Submit a password, for the prompted machine unless one is given.
    Password {
        machine_id: Option<String>,
        password: String,
    },
    Cancel,
    Forget(String),
    ConfirmRemoval,
    KeepHost,
    /// `direction: None` sends a full press (down then up).
    Key {
        key: String,
        code: String,
        key_code: u32,
        direction: Option<KeyDirection>,
    },
    Move(PointerInput),
    Click(u8),
    ContextMenu,
    Scroll(WheelInput),
    RecordStart,
    RecordStop,
    ListRecordings,
    HostRecordStart,
    HostRecordStop,
    Snapshot(PathBuf),
    Exit,
}

/// Owns the session state and wires the relay, the user and the
/// components together. All mutation happens on the session loop.
pub(crate) struct SessionController {
    config: SessionConfig,
    client_id: String,
    transport: Arc<dyn Transport>,
    negotiator: Negotiator,
    input: InputForwarder,
    renderer: FrameRenderer,
    recorder: RecordingManager,
    host_recording: HostRecording,
    available: AvailableHosts,
    saved: SavedHostStore,
    ui: mpsc::UnboundedSender<UiEvent>,
    mode: UiMode,
    password_prompt: Option<String>,
    pending_removal: Option<PendingRemoval>,
    disconnect_deadline: Option<Instant>,
}

impl SessionController {
    pub(crate) fn new(
        config: &ViewerConfig,
        client_id: String,
        transport: Arc<dyn Transport>,
        capture: Box<dyn DisplayCapture>,
        saved: SavedHostStore,
        ui: mpsc::UnboundedSender<UiEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<DecodedFrame>) {
        let native = (config.canvas.width, config.canvas.height);
        let (renderer, decoded_rx) = FrameRenderer::new(native.0, native.1);
        let controller = Self {
            config: config.session.clone(),
            client_id,
            negotiator: Negotiator::new(transport.clone()),
            input: InputForwarder::new(transport.clone(), native),
            renderer,
            recorder: RecordingManager::new(capture, &config.recording.output_dir),
            host_recording: HostRecording::new(transport.clone()),
            available: AvailableHosts::default(),
            saved,
            ui,
            mode: UiMode::Landing,
            password_prompt: None,
            pending_removal: None,
            disconnect_deadline: None,
            transport,
        };
        (controller, decoded_rx)
    }

    pub(crate) fn state(&self) -> &SessionState {
        self.negotiator.state()
    }

    pub(crate) fn mode(&self) -> UiMode {
        self.mode
    }

    fn emit(&self, event: UiEvent) {
        // The front-end may already be gone during shutdown
        let _ = self.ui.send(event);
    }

    fn notice(&self, level: NoticeLevel, text: impl Into<String>) {
        self.emit(UiEvent::Notice {
            level,
            text: text.into(),
        });
    }

    fn set_mode(&mut self, mode: UiMode) {
        if self.mode != mode {
            self.mode = mode;
            self.emit(UiEvent::ModeChanged(mode));
        }
    }

    pub(crate) async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(status) => self.handle_status(status).await,
            TransportEvent::Relay(event) => self.handle_relay_event(event).await,
        }
    }

    async fn handle_status(&mut self, status: TransportStatus) {
        self.emit(UiEvent::Status(status.to_string()));
        match status {
            TransportStatus::Disconnected { .. } => {
                if self.negotiator.on_transport_lost() {
                    self.password_prompt = None;
                    self.notice(NoticeLevel::Error, "Connection to relay lost, please retry");
                }
                if self.config.teardown_on_transport_loss && self.negotiator.connected_host().is_some() {
                    self.stop_local_recording().await;
                    self.negotiator.begin_disconnect();
                    self.finalize_disconnect();
                    self.notice(NoticeLevel::Error, "Session ended: connection to relay lost");
                }
            }
            TransportStatus::Reconnected => {
                // The relay keeps no per-client routing across connections
                if let Some(host_id) = self.negotiator.connected_host().map(str::to_string) {
                    info!(%host_id, "Re-asserting session after reconnect");
                    self.transport.send(ClientEvent::ConnectToHost(host_id.clone()));
                    self.request_screen(&host_id);
                }
            }
            TransportStatus::Connected | TransportStatus::Reconnecting { .. } => {}
        }
    }

    pub(crate) async fn handle_relay_event(&mut self, event: RelayEvent) {
        let now = std::time::Instant::now();
        match event {
            RelayEvent::HostAvailable(info) => {
                self.available.announce(info, now);
                self.publish_available();
            }
            RelayEvent::HostUnavailable(gone) => {
                if self.available.remove(&gone.id).is_some() {
                    self.publish_available();
                }
            }
            RelayEvent::ScreenData(frame) => {
                if self.negotiator.connected_host().is_some() {
                    self.renderer.submit(frame.image_data);
                } else {
                    debug!("Dropping screen-data outside a session");
                }
            }
            RelayEvent::CodeAccepted(host) => {
                let t = self.negotiator.on_code_accepted(host, now);
                self.apply(t, None);
            }
            RelayEvent::CodeRejected(rejection) => {
                let t = self.negotiator.on_code_rejected(rejection);
                self.apply(t, None);
            }
            RelayEvent::ConnectionAccepted(host) => {
                let machine_id = self.negotiator.pending_machine_id().map(str::to_string);
                let t = self.negotiator.on_connection_accepted(host, now);
                self.apply(t, machine_id);
            }
            RelayEvent::ConnectionRejected => {
                let t = self.negotiator.on_connection_rejected();
                self.apply(t, None);
            }
            RelayEvent::PasswordAuthResponse(response) => {
                let machine_id = self.negotiator.pending_machine_id().map(str::to_string);
                let saved = machine_id.as_deref().and_then(|m| self.saved.get(m)).cloned();
                let t = self
                    .negotiator
                    .on_password_auth_response(response, saved.as_ref(), now);
                self.apply(t, machine_id);
            }
            RelayEvent::HostDisconnectAck => self.on_host_disconnect_ack().await,
            RelayEvent::RecordingStatus(status) => {
                let update = self.host_recording.on_status(status);
                if let HostRecordingUpdate::Failed(message) = &update {
                    self.notice(NoticeLevel::Error, format!("Host recording failed: {message}"));
                }
                self.emit(UiEvent::HostRecording(update));
            }
            RelayEvent::RecordingComplete(complete) => {
                self.host_recording.on_complete(&complete);
                self.emit(UiEvent::HostRecordingComplete(complete));
            }
            RelayEvent::PasswordSetNotification(set) => self.on_password_set(set),
        }
    }

    fn apply(&mut self, transition: Transition, machine_id: Option<String>) {
        match transition {
            Transition::Ignored => {}
            Transition::AwaitingApproval { host_name } => {
                self.emit(UiEvent::WaitingForApproval { host_name });
            }
            Transition::Established(session) => {
                if let Some(machine_id) = machine_id
                    && let Err(e) = self.saved.touch(&machine_id, Utc::now())
                {
                    warn!("Failed to update saved host: {e}");
                }
                self.on_established(session);
            }
            Transition::Rejected { message } => {
                self.notice(NoticeLevel::Error, message);
            }
        }
    }

    fn on_established(&mut self, session: Session) {
        self.password_prompt = None;
        self.input.attach(&session.host_id);
        self.request_screen(&session.host_id);
        self.set_mode(UiMode::Fullscreen);
        self.notice(NoticeLevel::Info, format!("Connected to {}", session.host_name));
    }

    fn request_screen(&self, host_id: &str) {
        self.transport.send(ClientEvent::RequestScreen(ScreenRequest {
            to: host_id.to_string(),
            from: self.client_id.clone(),
        }));
    }

    fn on_password_set(&mut self, set: PasswordSet) {
        let name = self
            .available
            .get(&set.host_id)
            .map(|h| h.name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| self.saved.get(&set.machine_id).map(|h| h.name.clone()))
            .or_else(|| {
                self.negotiator
                    .state()
                    .session()
                    .filter(|s| s.host_id == set.host_id)
                    .map(|s| s.host_name.clone())
            })
            .unwrap_or_else(|| set.machine_id.clone());
        let host = SavedHost {
            host_id: set.host_id,
            machine_id: set.machine_id,
            name,
            last_connected: Utc::now(),
        };
        info!(machine_id = %host.machine_id, "Host enabled password access");
        let text = format!("Saved {} ({}) for password access", host.name, host.machine_id);
        match self.saved.upsert(host) {
            Ok(()) => {
                self.notice(NoticeLevel::Info, text);
                self.emit(UiEvent::SavedHosts(self.saved.list().to_vec()));
            }
            Err(e) => self.notice(NoticeLevel::Error, format!("Failed to save host: {e}")),
        }
    }

    async fn on_host_disconnect_ack(&mut self) {
        match self.negotiator.state() {
            SessionState::Disconnecting(_) => self.finalize_disconnect(),
            SessionState::Connected(session) => {
                let name = session.host_name.clone();
                self.stop_local_recording().await;
                self.negotiator.begin_disconnect();
                self.finalize_disconnect();
                self.notice(NoticeLevel::Info, format!("{name} ended the session"));
            }
            _ => debug!("Ignoring host-disconnect-ack outside a session"),
        }
    }

    pub(crate) fn on_decoded(&mut self, frame: DecodedFrame) {
        if let PaintOutcome::Failed(reason) = self.renderer.paint(frame) {
            debug!(%reason, "Frame not painted");
        }
    }

    pub(crate) async fn handle_command(&mut self, command: UserCommand) {
        let now = std::time::Instant::now();
        match command {
            UserCommand::ListHosts => self.publish_available(),
            UserCommand::ListSaved => self.emit(UiEvent::SavedHosts(self.saved.list().to_vec())),
            UserCommand::Pick(host_id) => match self.negotiator.pick_host(&host_id, &self.available, now) {
                Ok(session) => self.on_established(session),
                Err(e) => self.notice(NoticeLevel::Error, e.to_string()),
            },
            UserCommand::Code(code) => {
                if let Err(e) = self.negotiator.submit_code(&code, now) {
                    self.notice(NoticeLevel::Error, e.to_string());
                }
            }
            UserCommand::Reconnect(machine_id) => match self.saved.get(&machine_id) {
                Some(host) => {
                    let machine_id = host.machine_id.clone();
                    self.password_prompt = Some(machine_id.clone());
                    self.emit(UiEvent::PasswordPrompt { machine_id });
                }
                None => self.notice(NoticeLevel::Error, format!("No saved host {machine_id}")),
            },
            UserCommand::Password {
                machine_id,
                password,
            } => {
                let machine_id = machine_id
                    .or_else(|| self.password_prompt.clone())
                    .unwrap_or_default();
                match self.negotiator.submit_password(&machine_id, &password, now) {
                    Ok(()) => self.password_prompt = None,
                    Err(e) => self.notice(NoticeLevel::Error, e.to_string()),
                }
            }
            UserCommand::Cancel => {
                self.password_prompt = None;
                self.pending_removal = None;
                if self.negotiator.abandon() {
                    self.notice(NoticeLevel::Info, "Connection attempt cancelled");
                }
            }
            UserCommand::Forget(machine_id) => match self.saved.request_removal(&machine_id) {
                Some(pending) => {
                    self.emit(UiEvent::ConfirmRemoval {
                        machine_id: pending.machine_id.clone(),
                        name: pending.name.clone(),
                    });
                    self.pending_removal = Some(pending);
                }
                None => self.notice(NoticeLevel::Error, format!("No saved host {machine_id}")),
            },
            UserCommand::ConfirmRemoval => match self.pending_removal.take() {
                Some(pending) => match self.saved.confirm_removal(pending) {
                    Ok(_) => self.emit(UiEvent::SavedHosts(self.saved.list().to_vec())),
                    Err(e) => self.notice(NoticeLevel::Error, format!("Failed to remove host: {e}")),
                },
                None => self.notice(NoticeLevel::Error, "Nothing to confirm"),
            },
            UserCommand::KeepHost => {
                self.pending_removal = None;
            }
            UserCommand::Key {
                key,
                code,
                key_code,
                direction,
            } => {
                let directions = match direction {
                    Some(d) => vec![d],
                    None => vec![KeyDirection::Down, KeyDirection::Up],
                };
                for direction in directions {
                    let input = KeyInput {
                        key: key.clone(),
                        code: code.clone(),
                        key_code,
                        direction,
                        repeat: false,
                        live: None,
                    };
                    let d = self.input.handle_key(input);
                    self.check_forwarded(d);
                }
            }
            UserCommand::Move(pointer) => {
                let d = self.input.handle_pointer_move(pointer);
                self.check_forwarded(d);
            }
            UserCommand::Click(button) => {
                let d = self.input.handle_click(ClickInput { button, live: None });
                self.check_forwarded(d);
            }
            UserCommand::ContextMenu => {
                let d = self.input.handle_context_menu();
                self.check_forwarded(d);
            }
            UserCommand::Scroll(wheel) => {
                let d = self.input.handle_wheel(wheel);
                self.check_forwarded(d);
            }
            UserCommand::RecordStart => match self.recorder.start_local().await {
                Ok(()) => self.notice(NoticeLevel::Info, "Recording started"),
                Err(e) => self.notice(NoticeLevel::Error, e.to_string()),
            },
            UserCommand::RecordStop => match self.recorder.stop_local().await {
                Ok(Some(artifact)) => self.emit(UiEvent::RecordingSaved(artifact)),
                Ok(None) => self.notice(NoticeLevel::Info, "Recording stopped, nothing was captured"),
                Err(e) => self.notice(NoticeLevel::Error, e.to_string()),
            },
            UserCommand::ListRecordings => {
                self.emit(UiEvent::Recordings(self.recorder.artifacts().to_vec()));
            }
            UserCommand::HostRecordStart => self.host_record(true),
            UserCommand::HostRecordStop => self.host_record(false),
            UserCommand::Snapshot(path) => {
                if !self.renderer.canvas().has_frame() {
                    self.notice(NoticeLevel::Error, "No frame to save yet");
                    return;
                }
                match self.renderer.snapshot(&path) {
                    Ok(()) => self.notice(NoticeLevel::Info, format!("Saved {}", path.display())),
                    Err(e) => self.notice(NoticeLevel::Error, format!("{e:#}")),
                }
            }
            UserCommand::Exit => self.disconnect().await,
        }
    }

    fn host_record(&mut self, start: bool) {
        let Some(host_id) = self.negotiator.connected_host().map(str::to_string) else {
            self.notice(NoticeLevel::Error, "Not connected to a host");
            return;
        };
        let result = if start {
            self.host_recording.start(&host_id)
        } else {
            self.host_recording.stop(&host_id)
        };
        if let Err(e) = result {
            self.notice(NoticeLevel::Error, e.to_string());
        }
    }

    fn check_forwarded(&self, disposition: Disposition) {
        if disposition == Disposition::PassThrough && !self.input.is_attached() {
            self.notice(NoticeLevel::Error, "Not connected to a host");
        }
    }

    /// User-initiated end of session.
    pub(crate) async fn disconnect(&mut self) {
        if self.negotiator.connected_host().is_none() {
            if self.negotiator.abandon() {
                self.notice(NoticeLevel::Info, "Connection attempt cancelled");
            }
            return;
        }
        self.stop_local_recording().await;
        let Some(session) = self.negotiator.begin_disconnect() else {
            return;
        };
        self.transport
            .send(ClientEvent::ClientDisconnectRequest(DisconnectRequest {
                from: self.client_id.clone(),
                to: session.host_id.clone(),
            }));
        info!(host_id = %session.host_id, "Disconnect requested");
        let grace = Duration::from_millis(self.config.disconnect_grace_ms);
        if grace.is_zero() {
            self.finalize_disconnect();
        } else {
            self.disconnect_deadline = Some(Instant::now() + grace);
        }
    }

    async fn stop_local_recording(&mut self) {
        if !self.recorder.is_active() {
            return;
        }
        match self.recorder.stop_local().await {
            Ok(Some(artifact)) => self.emit(UiEvent::RecordingSaved(artifact)),
            Ok(None) => {}
            Err(RecordingError::NotActive) => {}
            Err(e) => self.notice(NoticeLevel::Error, e.to_string()),
        }
    }

    /// Local capture ended without a stop request: keep what was captured.
    pub(crate) async fn on_capture_interrupted(&mut self) {
        warn!("Local display capture ended unexpectedly");
        self.notice(
            NoticeLevel::Error,
            "Local recording stopped: display capture ended",
        );
        self.stop_local_recording().await;
    }

    fn finalize_disconnect(&mut self) {
        self.disconnect_deadline = None;
        self.negotiator.finish_disconnect();
        self.input.detach();
        self.renderer.reset();
        self.host_recording.reset();
        self.set_mode(UiMode::Landing);
    }

    /// Earliest pending timer: disconnect grace or negotiation timeout.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let negotiation = (self.config.negotiation_timeout_secs > 0)
            .then(|| {
                self.negotiator
                    .pending_deadline(Duration::from_secs(self.config.negotiation_timeout_secs))
            })
            .flatten()
            .map(Instant::from_std);
        match (self.disconnect_deadline, negotiation) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn on_deadline(&mut self, now: Instant) {
        if self.disconnect_deadline.is_some_and(|d| d <= now) {
            debug!("Disconnect grace period elapsed");
            self.finalize_disconnect();
        }
        if self.config.negotiation_timeout_secs > 0
            && self.negotiator.expire(
                now.into_std(),
                Duration::from_secs(self.config.negotiation_timeout_secs),
            )
        {
            self.password_prompt = None;
            self.notice(NoticeLevel::Error, "Timed out waiting for the host");
        }
    }

    /// Drop discovered hosts that stopped announcing themselves.
    pub(crate) fn sweep_hosts(&mut self) {
        if self.config.host_stale_after_secs == 0 {
            return;
        }
        let removed = self.available.sweep_stale(
            std::time::Instant::now(),
            Duration::from_secs(self.config.host_stale_after_secs),
        );
        if !removed.is_empty() {
            self.publish_available();
        }
    }

    fn publish_available(&self) {
        let hosts = self.available.list().into_iter().cloned().collect();
        self.emit(UiEvent::AvailableHosts(hosts));
    }

    /// Process exit: run the disconnect sequence without waiting out the
    /// grace period.
    pub(crate) async fn shutdown(&mut self) {
        self.disconnect().await;
        if self.negotiator.state().session().is_some() {
            self.finalize_disconnect();
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Drive the controller until the command channel closes.
pub(crate) async fn run_session_loop(
    controller: &mut SessionController,
    mut events: broadcast::Receiver<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<UserCommand>,
    mut decoded_rx: mpsc::UnboundedReceiver<DecodedFrame>,
) {
    let mut sweep = tokio::time::interval(Duration::from_secs(
        controller.config.host_stale_after_secs.clamp(1, 30),
    ));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let deadline = controller.next_deadline();
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => controller.handle_transport_event(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Session loop lagged behind relay events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Relay event channel closed");
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(command) => controller.handle_command(command).await,
                None => return,
            },
            Some(frame) = decoded_rx.recv() => controller.on_decoded(frame),
            _ = controller.recorder.interrupted() => controller.on_capture_interrupted().await,
            _ = sleep_until_opt(deadline) => controller.on_deadline(Instant::now()),
            _ = sweep.tick() => controller.sweep_hosts(),
        }
    }
}
