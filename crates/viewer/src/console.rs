//! Line-oriented front-end: stdin commands in, UI events printed out.

use std::path::PathBuf;

use relaydesk_protocol::KeyDirection;

use crate::controller::{NoticeLevel, UiEvent, UiMode, UserCommand};
use crate::input::{PointerInput, WheelInput};
use crate::recording::HostRecordingUpdate;

pub(crate) const HELP: &str = "\
Commands:
  hosts                          list hosts announced by the relay
  saved                          list saved hosts
  pick <host-id>                 connect to an announced host
  code <6 digits>                connect with a session code
  reconnect <machine-id>         reconnect to a saved host (prompts for password)
  password [<machine-id>] <pw>   submit a password
  cancel                         abandon the pending connection or prompt
  forget <machine-id>            remove a saved host (asks for confirmation)
  confirm | keep                 answer a removal prompt
  key <key> [code] [keycode] [down|up]
  move <x> <y> <width> <height>  pointer position in rendered pixels
  click [left|middle|right|N]
  contextmenu
  scroll <delta-y>
  record start|stop              record this machine's display
  recordings                     list recordings saved this run
  host-record start|stop         ask the host to record its screen
  snapshot [path]                save the current frame as PNG
  exit                           end the session
  quit                           exit the viewer";

#[derive(Debug, PartialEq)]
pub(crate) enum ConsoleInput {
    Command(UserCommand),
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub(crate) fn parse_line(line: &str) -> Result<Option<ConsoleInput>, String> {
    let words = shell_words::split(line).map_err(|e| format!("Could not parse input: {e}"))?;
    let Some((verb, rest)) = words.split_first() else {
        return Ok(None);
    };
    let arg = |i: usize, what: &str| -> Result<String, String> {
        rest.get(i)
            .cloned()
            .ok_or_else(|| format!("Usage: {verb} <{what}>"))
    };

    let command = match verb.as_str() {
        "help" | "?" => return Ok(Some(ConsoleInput::Help)),
        "quit" => return Ok(Some(ConsoleInput::Quit)),
        "hosts" => UserCommand::ListHosts,
        "saved" => UserCommand::ListSaved,
        "pick" => UserCommand::Pick(arg(0, "host-id")?),
        "code" => UserCommand::Code(arg(0, "code")?),
        "reconnect" => UserCommand::Reconnect(arg(0, "machine-id")?),
        "password" => match rest {
            [password] => UserCommand::Password {
                machine_id: None,
                password: password.clone(),
            },
            [machine_id, password] => UserCommand::Password {
                machine_id: Some(machine_id.clone()),
                password: password.clone(),
            },
            _ => return Err("Usage: password [<machine-id>] <password>".to_string()),
        },
        "cancel" => UserCommand::Cancel,
        "forget" => UserCommand::Forget(arg(0, "machine-id")?),
        "confirm" => UserCommand::ConfirmRemoval,
        "keep" => UserCommand::KeepHost,
        "key" => parse_key(rest)?,
        "move" => {
            let n = parse_numbers(rest, 4, "move <x> <y> <width> <height>")?;
            UserCommand::Move(PointerInput {
                x: n[0],
                y: n[1],
                rendered_width: n[2],
                rendered_height: n[3],
            })
        }
        "click" => UserCommand::Click(parse_button(rest.first().map(String::as_str))?),
        "contextmenu" => UserCommand::ContextMenu,
        "scroll" => {
            let n = parse_numbers(rest, 1, "scroll <delta-y>")?;
            UserCommand::Scroll(WheelInput {
                delta_y: Some(n[0]),
                ..Default::default()
            })
        }
        "record" => match rest.first().map(String::as_str) {
            Some("start") => UserCommand::RecordStart,
            Some("stop") => UserCommand::RecordStop,
            _ => return Err("Usage: record start|stop".to_string()),
        },
        "recordings" => UserCommand::ListRecordings,
        "host-record" => match rest.first().map(String::as_str) {
            Some("start") => UserCommand::HostRecordStart,
            Some("stop") => UserCommand::HostRecordStop,
            _ => return Err("Usage: host-record start|stop".to_string()),
        },
        "snapshot" => UserCommand::Snapshot(match rest.first() {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(format!(
                "snapshot-{}.png",
                chrono::Utc::now().format("%Y%m%d-%H%M%S")
            )),
        }),
        "exit" => UserCommand::Exit,
        other => return Err(format!("Unknown command '{other}', type 'help'")),
    };
    Ok(Some(ConsoleInput::Command(command)))
}

fn parse_numbers(args: &[String], count: usize, usage: &str) -> Result<Vec<f64>, String> {
    if args.len() != count {
        return Err(format!("Usage: {usage}"));
    }
    args.iter()
        .map(|a| a.parse::<f64>().map_err(|_| format!("Not a number: {a}")))
        .collect()
}

fn parse_button(arg: Option<&str>) -> Result<u8, String> {
    match arg {
        None | Some("left") => Ok(0),
        Some("middle") => Ok(1),
        Some("right") => Ok(2),
        Some(n) => n.parse().map_err(|_| format!("Unknown button: {n}")),
    }
}

fn parse_key(args: &[String]) -> Result<UserCommand, String> {
    const USAGE: &str = "Usage: key <key> [code] [keycode] [down|up]";
    let mut args: Vec<&str> = args.iter().map(String::as_str).collect();
    let direction = match args.last() {
        Some(&"down") => Some(KeyDirection::Down),
        Some(&"up") => Some(KeyDirection::Up),
        _ => None,
    };
    if direction.is_some() {
        args.pop();
    }
    let (key, code, key_code) = match args.as_slice() {
        [key] => (key.to_string(), default_code(key), default_key_code(key)),
        [key, code] => (key.to_string(), code.to_string(), default_key_code(key)),
        [key, code, key_code] => (
            key.to_string(),
            code.to_string(),
            key_code
                .parse()
                .map_err(|_| format!("Invalid keycode: {key_code}"))?,
        ),
        _ => return Err(USAGE.to_string()),
    };
    Ok(UserCommand::Key {
        key,
        code,
        key_code,
        direction,
    })
}

/// Physical code for a key name, e.g. `a` -> `KeyA`, `7` -> `Digit7`.
fn default_code(key: &str) -> String {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => format!("Key{}", c.to_ascii_uppercase()),
        (Some(c), None) if c.is_ascii_digit() => format!("Digit{c}"),
        (Some(' '), None) => "Space".to_string(),
        _ => key.to_string(),
    }
}

/// Legacy `keyCode` for common keys; 0 when unknown.
fn default_key_code(key: &str) -> u32 {
    let mut chars = key.chars();
    if let (Some(c), None) = (chars.next(), chars.next())
        && (c.is_ascii_alphanumeric() || c == ' ')
    {
        return c.to_ascii_uppercase() as u32;
    }
    match key {
        "Backspace" => 8,
        "Tab" => 9,
        "Enter" => 13,
        "Shift" => 16,
        "Control" => 17,
        "Alt" => 18,
        "CapsLock" => 20,
        "Escape" => 27,
        "ArrowLeft" => 37,
        "ArrowUp" => 38,
        "ArrowRight" => 39,
        "ArrowDown" => 40,
        "Delete" => 46,
        "Meta" => 91,
        _ => 0,
    }
}

/// Render a UI event as a line of console output.
pub(crate) fn format_ui_event(event: &UiEvent) -> String {
    match event {
        UiEvent::Status(text) => format!("[relay] {text}"),
        UiEvent::Notice {
            level: NoticeLevel::Info,
            text,
        } => text.clone(),
        UiEvent::Notice {
            level: NoticeLevel::Error,
            text,
        } => format!("error: {text}"),
        UiEvent::ModeChanged(UiMode::Fullscreen) => "Session view active".to_string(),
        UiEvent::ModeChanged(UiMode::Landing) => "Session ended".to_string(),
        UiEvent::WaitingForApproval { host_name } => {
            format!("Waiting for approval from {host_name}...")
        }
        UiEvent::PasswordPrompt { machine_id } => {
            format!("Enter the password for {machine_id}: password <pw>")
        }
        UiEvent::ConfirmRemoval { machine_id, name } => {
            format!("Remove saved host {name} ({machine_id})? confirm | keep")
        }
        UiEvent::AvailableHosts(hosts) if hosts.is_empty() => "No hosts available".to_string(),
        UiEvent::AvailableHosts(hosts) => {
            let mut out = String::from("Available hosts:");
            for host in hosts {
                out.push_str(&format!("\n  {}  {}", host.id, host.name));
            }
            out
        }
        UiEvent::SavedHosts(hosts) if hosts.is_empty() => "No saved hosts".to_string(),
        UiEvent::SavedHosts(hosts) => {
            let mut out = String::from("Saved hosts:");
            for host in hosts {
                out.push_str(&format!(
                    "\n  {}  {}  (last connected {})",
                    host.machine_id,
                    host.name,
                    host.last_connected.format("%Y-%m-%d %H:%M")
                ));
            }
            out
        }
        UiEvent::RecordingSaved(artifact) => format!(
            "Recording saved: {} ({} bytes, {:.1}s)",
            artifact.blob_ref.display(),
            artifact.file_size_bytes,
            artifact.duration.as_secs_f64()
        ),
        UiEvent::Recordings(artifacts) if artifacts.is_empty() => "No recordings yet".to_string(),
        UiEvent::Recordings(artifacts) => {
            let mut out = String::from("Recordings:");
            for a in artifacts {
                out.push_str(&format!(
                    "\n  {}  {}  {} bytes  {:.1}s",
                    a.created_at.format("%H:%M:%S"),
                    a.blob_ref.display(),
                    a.file_size_bytes,
                    a.duration.as_secs_f64()
                ));
            }
            out
        }
        UiEvent::HostRecording(HostRecordingUpdate::Progress { status, progress }) => match progress {
            Some(p) => format!("Host recording: {status} ({:.0}%)", p * 100.0),
            None => format!("Host recording: {status}"),
        },
        UiEvent::HostRecording(HostRecordingUpdate::Stopped) => "Host recording stopped".to_string(),
        UiEvent::HostRecording(HostRecordingUpdate::Failed(message)) => {
            format!("Host recording failed: {message}")
        }
        UiEvent::HostRecordingComplete(complete) => format!(
            "Host recording {} complete: {} ({} bytes, {:.1}s)",
            complete.recording_id, complete.file_path, complete.file_size, complete.duration
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> UserCommand {
        match parse_line(line) {
            Ok(Some(ConsoleInput::Command(c))) => c,
            other => panic!("expected command for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn blank_line_is_nothing() {
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn quoted_arguments() {
        assert_eq!(
            command(r#"password M1 "correct horse""#),
            UserCommand::Password {
                machine_id: Some("M1".to_string()),
                password: "correct horse".to_string()
            }
        );
        assert_eq!(
            command("password hunter2"),
            UserCommand::Password {
                machine_id: None,
                password: "hunter2".to_string()
            }
        );
    }

    #[test]
    fn unbalanced_quotes_rejected() {
        assert!(parse_line("password \"oops").is_err());
    }

    #[test]
    fn key_defaults() {
        assert_eq!(
            command("key a"),
            UserCommand::Key {
                key: "a".to_string(),
                code: "KeyA".to_string(),
                key_code: 65,
                direction: None
            }
        );
        assert_eq!(
            command("key Shift ShiftLeft down"),
            UserCommand::Key {
                key: "Shift".to_string(),
                code: "ShiftLeft".to_string(),
                key_code: 16,
                direction: Some(KeyDirection::Down)
            }
        );
        assert_eq!(
            command("key F5 F5 116 up"),
            UserCommand::Key {
                key: "F5".to_string(),
                code: "F5".to_string(),
                key_code: 116,
                direction: Some(KeyDirection::Up)
            }
        );
        assert!(parse_line("key").is_err());
    }

    #[test]
    fn pointer_commands() {
        assert_eq!(
            command("move 320 180 640 360"),
            UserCommand::Move(PointerInput {
                x: 320.0,
                y: 180.0,
                rendered_width: 640.0,
                rendered_height: 360.0
            })
        );
        assert!(parse_line("move 1 2").is_err());
        assert_eq!(command("click"), UserCommand::Click(0));
        assert_eq!(command("click right"), UserCommand::Click(2));
        assert_eq!(command("click 4"), UserCommand::Click(4));
        assert!(matches!(command("scroll -120"), UserCommand::Scroll(w) if w.delta_y == Some(-120.0)));
    }

    #[test]
    fn recording_commands() {
        assert_eq!(command("record start"), UserCommand::RecordStart);
        assert_eq!(command("host-record stop"), UserCommand::HostRecordStop);
        assert!(parse_line("record pause").is_err());
    }

    #[test]
    fn exit_and_quit_differ() {
        assert_eq!(command("exit"), UserCommand::Exit);
        assert_eq!(parse_line("quit"), Ok(Some(ConsoleInput::Quit)));
    }

    #[test]
    fn unknown_command() {
        let err = parse_line("teleport").unwrap_err();
        assert!(err.contains("teleport"));
    }

    #[test]
    fn missing_argument_shows_usage() {
        assert_eq!(parse_line("code"), Err("Usage: code <code>".to_string()));
    }

    #[test]
    fn format_error_notice() {
        let line = format_ui_event(&UiEvent::Notice {
            level: NoticeLevel::Error,
            text: "Invalid code".to_string(),
        });
        assert_eq!(line, "error: Invalid code");
        assert_eq!(
            format_ui_event(&UiEvent::WaitingForApproval {
                host_name: "Bob's PC".to_string()
            }),
            "Waiting for approval from Bob's PC..."
        );
    }
}
