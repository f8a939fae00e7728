use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use relaydesk_protocol::ViewerConfig;

use crate::cli::Args;

/// `<config dir>/relaydesk/viewer.toml`, or `viewer.toml` in the working
/// directory when the platform has no config dir.
pub(crate) fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("relaydesk"))
        .unwrap_or_default()
        .join("viewer.toml")
}

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub(crate) fn load_config(path: &Path) -> Result<ViewerConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(ViewerConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ViewerConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Command-line flags win over the file.
pub(crate) fn apply_overrides(config: &mut ViewerConfig, args: &Args) {
    if let Some(url) = &args.relay_url {
        config.relay.url = url.clone();
    }
    if let Some(path) = &args.saved_hosts_path {
        config.storage.saved_hosts_path = Some(path.clone());
    }
    if let Some(dir) = &args.recordings_dir {
        config.recording.output_dir = dir.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("relaydesk-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("viewer.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = load_config(Path::new("/nonexistent/relaydesk/viewer.toml")).unwrap();
        assert_eq!(config.relay.url, ViewerConfig::default().relay.url);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let path = temp_file(
            r#"
[relay]
url = "wss://relay.example.com/ws"

[session]
teardown_on_transport_loss = true
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.relay.url, "wss://relay.example.com/ws");
        assert!(config.session.teardown_on_transport_loss);
        assert_eq!(config.canvas.width, 1280);
        assert_eq!(config.recording.framerate, 10);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = temp_file("[relay\nurl = ");
        assert!(load_config(&path).is_err());
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn cli_overrides_file() {
        let mut config = ViewerConfig::default();
        let args = Args {
            relay_url: Some("ws://10.0.0.2:3001/ws".to_string()),
            recordings_dir: Some("/tmp/rec".to_string()),
            ..Default::default()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.relay.url, "ws://10.0.0.2:3001/ws");
        assert_eq!(config.recording.output_dir, "/tmp/rec");
        assert!(config.storage.saved_hosts_path.is_none());
    }
}
