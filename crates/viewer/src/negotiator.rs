use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relaydesk_protocol::{
    AcceptedHost, ClientEvent, CodeAuth, PasswordAuth, PasswordAuthResponse, Rejection,
};
use tracing::{debug, info};

use crate::hosts::{AvailableHosts, SavedHost};
use crate::transport::Transport;

const CODE_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Session {
    pub host_id: String,
    pub host_name: String,
}

/// Where the viewer stands with respect to a remote host. Exactly one of
/// these holds at any time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum SessionState {
    #[default]
    Idle,
    PendingCodeAuth {
        code: String,
    },
    PendingPasswordAuth {
        machine_id: String,
    },
    PendingApproval {
        host_id: String,
        host_name: String,
    },
    Connected(Session),
    Disconnecting(Session),
}

impl SessionState {
    pub(crate) fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingCodeAuth { .. } | Self::PendingPasswordAuth { .. } | Self::PendingApproval { .. }
        )
    }

    /// The host a live or closing session points at.
    pub(crate) fn session(&self) -> Option<&Session> {
        match self {
            Self::Connected(s) | Self::Disconnecting(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PendingCodeAuth { .. } => write!(f, "verifying session code"),
            Self::PendingPasswordAuth { machine_id } => write!(f, "authenticating with {machine_id}"),
            Self::PendingApproval { host_name, .. } => write!(f, "waiting for approval from {host_name}"),
            Self::Connected(s) => write!(f, "connected to {}", s.host_name),
            Self::Disconnecting(s) => write!(f, "disconnecting from {}", s.host_name),
        }
    }
}

/// Result of feeding a relay reply into the negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transition {
    /// The reply did not match the current state.
    Ignored,
    AwaitingApproval { host_name: String },
    Established(Session),
    Rejected { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum NegotiationError {
    #[error("Please enter a valid 6-digit code")]
    InvalidCode,
    #[error("Please enter a machine ID")]
    EmptyMachineId,
    #[error("Please enter a password")]
    EmptyPassword,
    #[error("A session is already active")]
    SessionActive,
    #[error("Host {0} is no longer available")]
    UnknownHost(String),
}

/// Drives the three connection flows (direct pick, session code, saved
/// machine password) against the relay.
pub(crate) struct Negotiator {
    transport: Arc<dyn Transport>,
    state: SessionState,
    pending_since: Option<Instant>,
}

impl Negotiator {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: SessionState::Idle,
            pending_since: None,
        }
    }

    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    /// Host id of the current session, if Connected.
    pub(crate) fn connected_host(&self) -> Option<&str> {
        match &self.state {
            SessionState::Connected(s) => Some(&s.host_id),
            _ => None,
        }
    }

    /// Instant after which the pending negotiation expires, if any.
    pub(crate) fn pending_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.pending_since.map(|since| since + timeout)
    }

    fn ensure_no_session(&self) -> Result<(), NegotiationError> {
        if self.state.session().is_some() {
            return Err(NegotiationError::SessionActive);
        }
        if self.state.is_pending() {
            debug!(state = %self.state, "Superseding pending negotiation");
        }
        Ok(())
    }

    fn enter(&mut self, state: SessionState, now: Instant) {
        self.pending_since = state.is_pending().then_some(now);
        self.state = state;
    }

    /// Connect straight to a host from the discovery list.
    pub(crate) fn pick_host(
        &mut self,
        host_id: &str,
        available: &AvailableHosts,
        now: Instant,
    ) -> Result<Session, NegotiationError> {
        self.ensure_no_session()?;
        let host = available
            .get(host_id)
            .ok_or_else(|| NegotiationError::UnknownHost(host_id.to_string()))?;
        let session = Session {
            host_id: host.id.clone(),
            host_name: if host.name.is_empty() {
                host.id.clone()
            } else {
                host.name.clone()
            },
        };
        self.transport
            .send(ClientEvent::ConnectToHost(session.host_id.clone()));
        info!(host_id = %session.host_id, "Connecting to discovered host");
        self.enter(SessionState::Connected(session.clone()), now);
        Ok(session)
    }

    pub(crate) fn submit_code(&mut self, code: &str, now: Instant) -> Result<(), NegotiationError> {
        let code = code.trim();
        if code.len() != CODE_LEN || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NegotiationError::InvalidCode);
        }
        self.ensure_no_session()?;
        self.transport.send(ClientEvent::ConnectWithCode(CodeAuth {
            code: code.to_string(),
        }));
        info!("Session code submitted");
        self.enter(
            SessionState::PendingCodeAuth {
                code: code.to_string(),
            },
            now,
        );
        Ok(())
    }

    pub(crate) fn submit_password(
        &mut self,
        machine_id: &str,
        password: &str,
        now: Instant,
    ) -> Result<(), NegotiationError> {
        let machine_id = machine_id.trim();
        if machine_id.is_empty() {
            return Err(NegotiationError::EmptyMachineId);
        }
        if password.trim().is_empty() {
            return Err(NegotiationError::EmptyPassword);
        }
        self.ensure_no_session()?;
        self.transport
            .send(ClientEvent::ConnectWithPassword(PasswordAuth {
                machine_id: machine_id.to_string(),
                password: password.to_string(),
            }));
        info!(%machine_id, "Password authentication submitted");
        self.enter(
            SessionState::PendingPasswordAuth {
                machine_id: machine_id.to_string(),
            },
            now,
        );
        Ok(())
    }

    pub(crate) fn on_code_accepted(&mut self, host: AcceptedHost, now: Instant) -> Transition {
        if !matches!(self.state, SessionState::PendingCodeAuth { .. }) {
            debug!(state = %self.state, "Ignoring code-accepted");
            return Transition::Ignored;
        }
        let host_name = display_name(&host);
        info!(host_id = %host.host_id, "Code accepted, waiting for host approval");
        self.enter(
            SessionState::PendingApproval {
                host_id: host.host_id,
                host_name: host_name.clone(),
            },
            now,
        );
        Transition::AwaitingApproval { host_name }
    }

    pub(crate) fn on_code_rejected(&mut self, rejection: Rejection) -> Transition {
        if !matches!(self.state, SessionState::PendingCodeAuth { .. }) {
            debug!(state = %self.state, "Ignoring code-rejected");
            return Transition::Ignored;
        }
        self.reject(
            rejection
                .message
                .unwrap_or_else(|| "Invalid session code".to_string()),
        )
    }

    pub(crate) fn on_connection_accepted(
        &mut self,
        mut host: AcceptedHost,
        now: Instant,
    ) -> Transition {
        let fallback_name = match &self.state {
            SessionState::PendingApproval { host_id, host_name } => {
                // Approval from a host whose request was superseded or abandoned
                if !host_id.is_empty() && !host.host_id.is_empty() && *host_id != host.host_id {
                    debug!(
                        pending = %host_id,
                        accepted = %host.host_id,
                        "Ignoring connection-accepted for another host"
                    );
                    return Transition::Ignored;
                }
                if host.host_id.is_empty() {
                    host.host_id = host_id.clone();
                }
                Some(host_name.clone())
            }
            SessionState::PendingPasswordAuth { .. } => None,
            _ => {
                debug!(state = %self.state, "Ignoring connection-accepted");
                return Transition::Ignored;
            }
        };
        let host_name = if host.host_name.is_empty() {
            fallback_name.unwrap_or_else(|| host.host_id.clone())
        } else {
            host.host_name
        };
        self.establish(
            Session {
                host_id: host.host_id,
                host_name,
            },
            now,
        )
    }

    pub(crate) fn on_connection_rejected(&mut self) -> Transition {
        if !matches!(
            self.state,
            SessionState::PendingApproval { .. } | SessionState::PendingPasswordAuth { .. }
        ) {
            debug!(state = %self.state, "Ignoring connection-rejected");
            return Transition::Ignored;
        }
        self.reject("The host declined the connection".to_string())
    }

    /// `saved` is the stored entry for the pending machine id, used when the
    /// response omits the host's identity.
    pub(crate) fn on_password_auth_response(
        &mut self,
        response: PasswordAuthResponse,
        saved: Option<&SavedHost>,
        now: Instant,
    ) -> Transition {
        let SessionState::PendingPasswordAuth { machine_id } = &self.state else {
            debug!(state = %self.state, "Ignoring password-auth-response");
            return Transition::Ignored;
        };
        if !response.success {
            return self.reject(
                response
                    .message
                    .unwrap_or_else(|| "Authentication failed".to_string()),
            );
        }
        let host_id = response
            .host_id
            .or_else(|| saved.map(|h| h.host_id.clone()))
            .unwrap_or_else(|| machine_id.clone());
        let host_name = response
            .host_name
            .or_else(|| saved.map(|h| h.name.clone()))
            .unwrap_or_else(|| machine_id.clone());
        self.establish(Session { host_id, host_name }, now)
    }

    /// Machine id of a pending password negotiation.
    pub(crate) fn pending_machine_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::PendingPasswordAuth { machine_id } => Some(machine_id),
            _ => None,
        }
    }

    /// User dismissed the code or password prompt.
    pub(crate) fn abandon(&mut self) -> bool {
        if !self.state.is_pending() {
            return false;
        }
        info!(state = %self.state, "Negotiation abandoned");
        self.enter(SessionState::Idle, Instant::now());
        true
    }

    /// Revert a pending negotiation older than `timeout`.
    pub(crate) fn expire(&mut self, now: Instant, timeout: Duration) -> bool {
        match self.pending_since {
            Some(since) if self.state.is_pending() && now.saturating_duration_since(since) >= timeout => {
                info!(state = %self.state, "Negotiation timed out");
                self.enter(SessionState::Idle, now);
                true
            }
            _ => false,
        }
    }

    /// The relay connection dropped; replies to pending requests will never
    /// arrive. Sessions are left to the caller.
    pub(crate) fn on_transport_lost(&mut self) -> bool {
        if !self.state.is_pending() {
            return false;
        }
        info!(state = %self.state, "Pending negotiation lost with relay connection");
        self.enter(SessionState::Idle, Instant::now());
        true
    }

    /// Connected → Disconnecting. Returns the session being closed.
    pub(crate) fn begin_disconnect(&mut self) -> Option<Session> {
        let SessionState::Connected(session) = &self.state else {
            return None;
        };
        let session = session.clone();
        self.state = SessionState::Disconnecting(session.clone());
        Some(session)
    }

    /// Drop any session (closing or live) and return to Idle.
    pub(crate) fn finish_disconnect(&mut self) -> Option<Session> {
        let previous = std::mem::take(&mut self.state);
        match previous {
            SessionState::Connected(s) | SessionState::Disconnecting(s) => {
                self.pending_since = None;
                info!(host_id = %s.host_id, "Session closed");
                Some(s)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    fn establish(&mut self, session: Session, now: Instant) -> Transition {
        info!(host_id = %session.host_id, host_name = %session.host_name, "Session established");
        self.enter(SessionState::Connected(session.clone()), now);
        Transition::Established(session)
    }

    fn reject(&mut self, message: String) -> Transition {
        info!(state = %self.state, %message, "Negotiation rejected");
        self.enter(SessionState::Idle, Instant::now());
        Transition::Rejected { message }
    }
}

fn display_name(host: &AcceptedHost) -> String {
    if host.host_name.is_empty() {
        host.host_id.clone()
    } else {
        host.host_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use chrono::Utc;
    use relaydesk_protocol::HostInfo;

    fn negotiator() -> (Negotiator, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        (Negotiator::new(transport.clone()), transport)
    }

    fn accepted(id: &str, name: &str) -> AcceptedHost {
        AcceptedHost {
            host_id: id.to_string(),
            host_name: name.to_string(),
        }
    }

    #[test]
    fn code_validation_is_local() {
        let (mut neg, transport) = negotiator();
        let now = Instant::now();
        for bad in ["12345", "1234567", "12a456", "", "١٢٣٤٥٦"] {
            assert_eq!(neg.submit_code(bad, now), Err(NegotiationError::InvalidCode), "{bad:?}");
        }
        assert!(transport.sent().is_empty());
        assert_eq!(*neg.state(), SessionState::Idle);
    }

    #[test]
    fn code_is_trimmed_before_sending() {
        let (mut neg, transport) = negotiator();
        neg.submit_code(" 482913 ", Instant::now()).unwrap();
        assert_eq!(
            transport.sent(),
            vec![ClientEvent::ConnectWithCode(CodeAuth {
                code: "482913".to_string()
            })]
        );
        assert_eq!(
            *neg.state(),
            SessionState::PendingCodeAuth {
                code: "482913".to_string()
            }
        );
    }

    #[test]
    fn code_flow_to_connected() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_code("482913", now).unwrap();

        let t = neg.on_code_accepted(accepted("h1", "Bob's PC"), now);
        assert_eq!(
            t,
            Transition::AwaitingApproval {
                host_name: "Bob's PC".to_string()
            }
        );

        let t = neg.on_connection_accepted(accepted("h1", "Bob's PC"), now);
        let expected = Session {
            host_id: "h1".to_string(),
            host_name: "Bob's PC".to_string(),
        };
        assert_eq!(t, Transition::Established(expected.clone()));
        assert_eq!(*neg.state(), SessionState::Connected(expected));
        assert_eq!(neg.pending_deadline(Duration::from_secs(1)), None);
    }

    #[test]
    fn connection_accepted_without_name_keeps_announced_name() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_code("482913", now).unwrap();
        neg.on_code_accepted(accepted("h1", "Bob's PC"), now);
        match neg.on_connection_accepted(accepted("h1", ""), now) {
            Transition::Established(s) => assert_eq!(s.host_name, "Bob's PC"),
            other => panic!("expected Established, got {other:?}"),
        }
    }

    #[test]
    fn approval_from_superseded_host_is_ignored() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_code("111111", now).unwrap();
        neg.on_code_accepted(accepted("hA", "A"), now);
        neg.submit_code("222222", now).unwrap();
        neg.on_code_accepted(accepted("hB", "B"), now);

        assert_eq!(neg.on_connection_accepted(accepted("hA", "A"), now), Transition::Ignored);
        assert_eq!(
            *neg.state(),
            SessionState::PendingApproval {
                host_id: "hB".to_string(),
                host_name: "B".to_string()
            }
        );

        let t = neg.on_connection_accepted(accepted("hB", "B"), now);
        assert_eq!(
            t,
            Transition::Established(Session {
                host_id: "hB".to_string(),
                host_name: "B".to_string()
            })
        );
    }

    #[test]
    fn approval_without_host_id_uses_pending_host() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_code("482913", now).unwrap();
        neg.on_code_accepted(accepted("h1", "Bob's PC"), now);
        match neg.on_connection_accepted(accepted("", ""), now) {
            Transition::Established(s) => {
                assert_eq!(s.host_id, "h1");
                assert_eq!(s.host_name, "Bob's PC");
            }
            other => panic!("expected Established, got {other:?}"),
        }
    }

    #[test]
    fn code_rejected_returns_to_idle_with_message() {
        let (mut neg, _) = negotiator();
        neg.submit_code("000000", Instant::now()).unwrap();
        let t = neg.on_code_rejected(Rejection {
            message: Some("Invalid code".to_string()),
        });
        assert_eq!(
            t,
            Transition::Rejected {
                message: "Invalid code".to_string()
            }
        );
        assert_eq!(*neg.state(), SessionState::Idle);
    }

    #[test]
    fn late_rejection_is_a_no_op() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_code("482913", now).unwrap();
        neg.on_code_accepted(accepted("h1", "Bob"), now);
        neg.on_connection_accepted(accepted("h1", "Bob"), now);

        assert_eq!(neg.on_connection_rejected(), Transition::Ignored);
        assert_eq!(neg.on_code_rejected(Rejection::default()), Transition::Ignored);
        assert_eq!(neg.connected_host(), Some("h1"));
    }

    #[test]
    fn rejection_while_idle_never_changes_state() {
        let (mut neg, _) = negotiator();
        assert_eq!(neg.on_connection_rejected(), Transition::Ignored);
        assert_eq!(
            neg.on_connection_accepted(accepted("h1", "Bob"), Instant::now()),
            Transition::Ignored
        );
        assert_eq!(*neg.state(), SessionState::Idle);
    }

    #[test]
    fn host_rejects_after_approval_prompt() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_code("482913", now).unwrap();
        neg.on_code_accepted(accepted("h1", "Bob"), now);
        assert!(matches!(neg.on_connection_rejected(), Transition::Rejected { .. }));
        assert_eq!(*neg.state(), SessionState::Idle);
    }

    #[test]
    fn password_requires_both_fields() {
        let (mut neg, transport) = negotiator();
        let now = Instant::now();
        assert_eq!(
            neg.submit_password("  ", "pw", now),
            Err(NegotiationError::EmptyMachineId)
        );
        assert_eq!(
            neg.submit_password("M1", " ", now),
            Err(NegotiationError::EmptyPassword)
        );
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn password_success_falls_back_to_saved_host() {
        let (mut neg, transport) = negotiator();
        let now = Instant::now();
        neg.submit_password("M1", "pw", now).unwrap();
        assert_eq!(transport.count("connect-with-password"), 1);

        let saved = SavedHost {
            host_id: "h7".to_string(),
            machine_id: "M1".to_string(),
            name: "Office".to_string(),
            last_connected: Utc::now(),
        };
        let response = PasswordAuthResponse {
            success: true,
            message: None,
            host_id: None,
            host_name: None,
        };
        let t = neg.on_password_auth_response(response, Some(&saved), now);
        assert_eq!(
            t,
            Transition::Established(Session {
                host_id: "h7".to_string(),
                host_name: "Office".to_string()
            })
        );
    }

    #[test]
    fn password_success_without_saved_host_uses_machine_id() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_password("M1", "pw", now).unwrap();
        let response = PasswordAuthResponse {
            success: true,
            message: None,
            host_id: None,
            host_name: None,
        };
        match neg.on_password_auth_response(response, None, now) {
            Transition::Established(s) => assert_eq!(s.host_id, "M1"),
            other => panic!("expected Established, got {other:?}"),
        }
    }

    #[test]
    fn password_failure_default_message() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_password("M1", "wrong", now).unwrap();
        let response = PasswordAuthResponse {
            success: false,
            message: None,
            host_id: None,
            host_name: None,
        };
        assert_eq!(
            neg.on_password_auth_response(response, None, now),
            Transition::Rejected {
                message: "Authentication failed".to_string()
            }
        );
        assert_eq!(*neg.state(), SessionState::Idle);
    }

    #[test]
    fn pick_requires_announced_host() {
        let (mut neg, transport) = negotiator();
        let mut hosts = AvailableHosts::default();
        let now = Instant::now();
        assert_eq!(
            neg.pick_host("h1", &hosts, now),
            Err(NegotiationError::UnknownHost("h1".to_string()))
        );

        hosts.announce(
            HostInfo {
                id: "h1".to_string(),
                name: "Bob".to_string(),
                extra: Default::default(),
            },
            now,
        );
        let session = neg.pick_host("h1", &hosts, now).unwrap();
        assert_eq!(session.host_name, "Bob");
        assert_eq!(transport.sent(), vec![ClientEvent::ConnectToHost("h1".to_string())]);
        assert_eq!(neg.connected_host(), Some("h1"));
    }

    #[test]
    fn submissions_refused_while_connected() {
        let (mut neg, transport) = negotiator();
        let now = Instant::now();
        neg.submit_password("M1", "pw", now).unwrap();
        neg.on_connection_accepted(accepted("h1", "Bob"), now);
        transport.take();

        assert_eq!(neg.submit_code("123456", now), Err(NegotiationError::SessionActive));
        assert_eq!(
            neg.submit_password("M2", "pw", now),
            Err(NegotiationError::SessionActive)
        );
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn new_submission_supersedes_pending() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_code("111111", now).unwrap();
        neg.submit_password("M1", "pw", now).unwrap();
        assert_eq!(neg.pending_machine_id(), Some("M1"));
        // Reply to the superseded code request
        assert_eq!(neg.on_code_accepted(accepted("h1", "Bob"), now), Transition::Ignored);
    }

    #[test]
    fn abandon_only_affects_pending() {
        let (mut neg, transport) = negotiator();
        let now = Instant::now();
        assert!(!neg.abandon());
        neg.submit_code("482913", now).unwrap();
        assert!(neg.abandon());
        assert_eq!(*neg.state(), SessionState::Idle);
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn expiry_after_timeout() {
        let (mut neg, _) = negotiator();
        let start = Instant::now();
        let timeout = Duration::from_secs(30);
        neg.submit_code("482913", start).unwrap();
        assert_eq!(neg.pending_deadline(timeout), Some(start + timeout));
        assert!(!neg.expire(start + Duration::from_secs(29), timeout));
        assert!(neg.expire(start + timeout, timeout));
        assert_eq!(*neg.state(), SessionState::Idle);
        assert!(!neg.expire(start + timeout * 2, timeout));
    }

    #[test]
    fn transport_loss_reverts_pending_only() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_code("482913", now).unwrap();
        assert!(neg.on_transport_lost());
        assert_eq!(*neg.state(), SessionState::Idle);

        neg.submit_password("M1", "pw", now).unwrap();
        neg.on_connection_accepted(accepted("h1", "Bob"), now);
        assert!(!neg.on_transport_lost());
        assert_eq!(neg.connected_host(), Some("h1"));
    }

    #[test]
    fn disconnect_passes_through_disconnecting() {
        let (mut neg, _) = negotiator();
        let now = Instant::now();
        neg.submit_password("M1", "pw", now).unwrap();
        neg.on_connection_accepted(accepted("h1", "Bob"), now);

        let session = neg.begin_disconnect().unwrap();
        assert_eq!(*neg.state(), SessionState::Disconnecting(session.clone()));
        assert_eq!(neg.connected_host(), None);
        assert!(neg.begin_disconnect().is_none());
        assert_eq!(neg.finish_disconnect(), Some(session));
        assert_eq!(*neg.state(), SessionState::Idle);
        assert_eq!(neg.finish_disconnect(), None);
    }

    #[test]
    fn finish_disconnect_leaves_pending_untouched() {
        let (mut neg, _) = negotiator();
        neg.submit_code("482913", Instant::now()).unwrap();
        assert_eq!(neg.finish_disconnect(), None);
        assert!(neg.state().is_pending());
    }
}
