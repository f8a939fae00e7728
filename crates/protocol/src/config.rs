use serde::{Deserialize, Serialize};

/// Top-level viewer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewerConfig {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub canvas: CanvasConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Signaling relay WebSocket URL (ws:// or wss://)
    #[serde(default = "default_relay_url")]
    pub url: String,
    /// Identifier this viewer presents as `from` (random per process if absent)
    pub client_id: Option<String>,
    /// PEM certificate to pin for wss:// relays (system roots are still trusted)
    pub tls_cert: Option<String>,
    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Jitter factor applied to each delay (0.0 = none, 0.5 = +/-50%)
    #[serde(default = "default_reconnect_randomization")]
    pub reconnect_randomization: f64,
    /// Interval between keep-alive messages while connected
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

/// Native resolution of the session canvas. Frames are drawn at this size
/// and pointer coordinates are scaled into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConfig {
    #[serde(default = "default_canvas_width")]
    pub width: u32,
    #[serde(default = "default_canvas_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Time allowed for the host to acknowledge a disconnect before the
    /// session is cleared locally
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    /// Give up on a pending code/password negotiation after this many
    /// seconds (0 = wait indefinitely)
    #[serde(default)]
    pub negotiation_timeout_secs: u64,
    /// End an active session when the relay connection drops instead of
    /// re-attaching after reconnect
    #[serde(default)]
    pub teardown_on_transport_loss: bool,
    /// Forget discovered hosts not re-announced within this many seconds
    /// (0 = keep until the relay reports them gone)
    #[serde(default)]
    pub host_stale_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Local X11 display captured by screen recordings
    #[serde(default = "default_recording_display")]
    pub display: String,
    /// Capture rate in frames per second
    #[serde(default = "default_recording_framerate")]
    pub framerate: u32,
    /// JPEG quality of recorded frames (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Directory finished recordings are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Saved-hosts file (default: <data dir>/relaydesk/saved_hosts.json)
    pub saved_hosts_path: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            client_id: None,
            tls_cert: None,
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_randomization: default_reconnect_randomization(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: default_canvas_width(),
            height: default_canvas_height(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_ms: default_disconnect_grace_ms(),
            negotiation_timeout_secs: 0,
            teardown_on_transport_loss: false,
            host_stale_after_secs: 0,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            display: default_recording_display(),
            framerate: default_recording_framerate(),
            jpeg_quality: default_jpeg_quality(),
            output_dir: default_output_dir(),
        }
    }
}

impl ViewerConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the viewer should not start)
    /// or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Relay ---
        if !self.relay.url.starts_with("ws://") && !self.relay.url.starts_with("wss://") {
            issues.push(format!(
                "ERROR: relay.url '{}' must start with 'ws://' or 'wss://'. \
                 Example: wss://relay.example.com/ws",
                self.relay.url
            ));
        }
        if self.relay.tls_cert.is_some() && self.relay.url.starts_with("ws://") {
            issues.push(
                "WARNING: relay.tls_cert is set but relay.url is plain ws://. \
                 The certificate will not be used."
                    .to_string(),
            );
        }
        if let Some(id) = &self.relay.client_id
            && id.trim().is_empty()
        {
            issues.push("ERROR: relay.client_id must not be blank.".to_string());
        }
        if self.relay.reconnect_initial_delay_ms == 0 {
            issues.push(
                "ERROR: relay.reconnect_initial_delay_ms must be at least 1.".to_string(),
            );
        }
        if self.relay.reconnect_initial_delay_ms > self.relay.reconnect_max_delay_ms {
            issues.push(format!(
                "ERROR: relay.reconnect_initial_delay_ms ({}) must not exceed \
                 relay.reconnect_max_delay_ms ({}).",
                self.relay.reconnect_initial_delay_ms, self.relay.reconnect_max_delay_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.relay.reconnect_randomization) {
            issues.push(format!(
                "ERROR: relay.reconnect_randomization must be between 0.0 and 1.0, got {}.",
                self.relay.reconnect_randomization
            ));
        }
        if self.relay.keepalive_interval_secs == 0 {
            issues.push("ERROR: relay.keepalive_interval_secs must be at least 1.".to_string());
        }

        // --- Canvas ---
        if !(320..=7680).contains(&self.canvas.width) {
            issues.push(format!(
                "ERROR: canvas.width must be between 320 and 7680, got {}.",
                self.canvas.width
            ));
        }
        if !(240..=4320).contains(&self.canvas.height) {
            issues.push(format!(
                "ERROR: canvas.height must be between 240 and 4320, got {}.",
                self.canvas.height
            ));
        }

        // --- Session ---
        if self.session.disconnect_grace_ms > 10_000 {
            issues.push(format!(
                "WARNING: session.disconnect_grace_ms is {} ms. The viewer will sit in \
                 'disconnecting' for that long when the host does not acknowledge.",
                self.session.disconnect_grace_ms
            ));
        }
        if (1..5).contains(&self.session.negotiation_timeout_secs) {
            issues.push(format!(
                "WARNING: session.negotiation_timeout_secs is {}s. Hosts approve \
                 connections by hand; this will likely expire before they can respond.",
                self.session.negotiation_timeout_secs
            ));
        }

        // --- Recording ---
        if self.recording.framerate == 0 || self.recording.framerate > 60 {
            issues.push(format!(
                "ERROR: recording.framerate must be between 1 and 60, got {}.",
                self.recording.framerate
            ));
        }
        if self.recording.jpeg_quality == 0 || self.recording.jpeg_quality > 100 {
            issues.push(format!(
                "ERROR: recording.jpeg_quality must be between 1 and 100, got {}.",
                self.recording.jpeg_quality
            ));
        }
        if self.recording.output_dir.trim().is_empty() {
            issues.push("ERROR: recording.output_dir must not be empty.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:3001/ws".to_string()
}
fn default_reconnect_initial_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    5000
}
fn default_reconnect_randomization() -> f64 {
    0.5
}
fn default_keepalive_interval_secs() -> u64 {
    25
}
fn default_canvas_width() -> u32 {
    1280
}
fn default_canvas_height() -> u32 {
    720
}
fn default_disconnect_grace_ms() -> u64 {
    500
}
fn default_recording_display() -> String {
    ":0".to_string()
}
fn default_recording_framerate() -> u32 {
    10
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_output_dir() -> String {
    "recordings".to_string()
}
