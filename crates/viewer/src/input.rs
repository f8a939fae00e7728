use std::sync::Arc;

use relaydesk_protocol::{
    ClientEvent, KeyDirection, Modifiers, MouseButton, RemoteKey, RemoteMouseClick,
    RemoteMouseMove, RemoteMouseScroll,
};
use tracing::debug;

use crate::transport::Transport;

/// Whether the local default action for an input event should be suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    PreventDefault,
    PassThrough,
}

/// Locally tracked modifier state.
///
/// Shift, Control, Alt and Meta are held keys. Caps Lock is a toggle that
/// flips once per physical press; auto-repeat key-downs leave it alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ModifierKeyState {
    state: Modifiers,
}

impl ModifierKeyState {
    pub(crate) fn observe(&mut self, key: &str, direction: KeyDirection, repeat: bool) {
        let down = direction == KeyDirection::Down;
        match key {
            "Shift" => self.state.shift = down,
            "Control" => self.state.control = down,
            "Alt" => self.state.alt = down,
            "Meta" | "OS" => self.state.meta = down,
            "CapsLock" if down && !repeat => self.state.caps_lock = !self.state.caps_lock,
            _ => {}
        }
    }

    /// Adopt the held-key flags reported alongside a local event. Focus
    /// changes can swallow key-ups, so the live flags win over the cache.
    pub(crate) fn reconcile(&mut self, live: Option<Modifiers>) {
        let Some(live) = live else { return };
        let cached = self.state;
        self.state.shift = live.shift;
        self.state.control = live.control;
        self.state.alt = live.alt;
        self.state.meta = live.meta;
        if cached != self.state {
            debug!(?cached, ?live, "Repaired modifier desync");
        }
    }

    pub(crate) fn snapshot(&self) -> Modifiers {
        self.state
    }

    pub(crate) fn reset(&mut self) {
        self.state = Modifiers::default();
    }
}

/// A local key event.
#[derive(Debug, Clone)]
pub(crate) struct KeyInput {
    pub key: String,
    pub code: String,
    pub key_code: u32,
    pub direction: KeyDirection,
    pub repeat: bool,
    /// Held-modifier flags reported by the local event, when available.
    pub live: Option<Modifiers>,
}

/// Pointer position in rendered (on-screen) pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PointerInput {
    pub x: f64,
    pub y: f64,
    pub rendered_width: f64,
    pub rendered_height: f64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ClickInput {
    pub button: u8,
    pub live: Option<Modifiers>,
}

/// Wheel payload; older event sources report only `detail` or `wheel_delta`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct WheelInput {
    pub delta_y: Option<f64>,
    pub detail: Option<f64>,
    pub wheel_delta: Option<f64>,
}

impl WheelInput {
    fn amount(&self) -> Option<f64> {
        self.delta_y.or(self.detail).or(self.wheel_delta)
    }
}

/// Map a rendered-pixel position onto the canvas' native resolution.
/// Returns `None` when the canvas has no rendered area.
pub(crate) fn scale_point(pointer: PointerInput, native: (u32, u32)) -> Option<(f64, f64)> {
    let (w, h) = (pointer.rendered_width, pointer.rendered_height);
    if !(w > 0.0 && h > 0.0) {
        return None;
    }
    let x = pointer.x.clamp(0.0, w);
    let y = pointer.y.clamp(0.0, h);
    Some((x * native.0 as f64 / w, y * native.1 as f64 / h))
}

/// Translates local input into remote-input events for the attached host.
pub(crate) struct InputForwarder {
    transport: Arc<dyn Transport>,
    target: Option<String>,
    modifiers: ModifierKeyState,
    native: (u32, u32),
}

impl InputForwarder {
    pub(crate) fn new(transport: Arc<dyn Transport>, native: (u32, u32)) -> Self {
        Self {
            transport,
            target: None,
            modifiers: ModifierKeyState::default(),
            native,
        }
    }

    pub(crate) fn attach(&mut self, host_id: &str) {
        debug!(%host_id, "Input attached");
        self.target = Some(host_id.to_string());
    }

    pub(crate) fn detach(&mut self) {
        if self.target.take().is_some() {
            debug!("Input detached");
        }
        self.modifiers.reset();
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.target.is_some()
    }

    #[cfg(test)]
    pub(crate) fn modifiers(&self) -> Modifiers {
        self.modifiers.snapshot()
    }

    pub(crate) fn handle_key(&mut self, input: KeyInput) -> Disposition {
        let Some(to) = self.target.clone() else {
            return Disposition::PassThrough;
        };
        self.modifiers.observe(&input.key, input.direction, input.repeat);
        self.modifiers.reconcile(input.live);
        self.transport.send(ClientEvent::RemoteKeyEvent(RemoteKey {
            to,
            direction: input.direction,
            key: input.key,
            code: input.code,
            key_code: input.key_code,
            modifiers: self.modifiers.snapshot(),
        }));
        Disposition::PreventDefault
    }

    pub(crate) fn handle_pointer_move(&mut self, pointer: PointerInput) -> Disposition {
        let Some(to) = self.target.clone() else {
            return Disposition::PassThrough;
        };
        let Some((x, y)) = scale_point(pointer, self.native) else {
            return Disposition::PassThrough;
        };
        self.transport.send(ClientEvent::RemoteMouseMove(RemoteMouseMove {
            to,
            x,
            y,
            screen_width: self.native.0,
            screen_height: self.native.1,
        }));
        Disposition::PreventDefault
    }

    pub(crate) fn handle_click(&mut self, click: ClickInput) -> Disposition {
        let Some(to) = self.target.clone() else {
            return Disposition::PassThrough;
        };
        let Some(button) = MouseButton::from_index(click.button) else {
            debug!(button = click.button, "Ignoring unmapped mouse button");
            return Disposition::PassThrough;
        };
        self.modifiers.reconcile(click.live);
        self.transport.send(ClientEvent::RemoteMouseClick(RemoteMouseClick {
            to,
            button,
            modifiers: Some(self.modifiers.snapshot()),
        }));
        Disposition::PreventDefault
    }

    pub(crate) fn handle_context_menu(&self) -> Disposition {
        if self.is_attached() {
            Disposition::PreventDefault
        } else {
            Disposition::PassThrough
        }
    }

    pub(crate) fn handle_wheel(&mut self, wheel: WheelInput) -> Disposition {
        let Some(to) = self.target.clone() else {
            return Disposition::PassThrough;
        };
        let Some(delta_y) = wheel.amount() else {
            return Disposition::PreventDefault;
        };
        self.transport
            .send(ClientEvent::RemoteMouseScroll(RemoteMouseScroll { to, delta_y }));
        Disposition::PreventDefault
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;

    fn forwarder() -> (InputForwarder, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let mut fwd = InputForwarder::new(transport.clone(), (1280, 720));
        fwd.attach("h1");
        (fwd, transport)
    }

    fn key(key: &str, direction: KeyDirection, repeat: bool) -> KeyInput {
        KeyInput {
            key: key.to_string(),
            code: key.to_string(),
            key_code: 0,
            direction,
            repeat,
            live: None,
        }
    }

    fn pointer(x: f64, y: f64, w: f64, h: f64) -> PointerInput {
        PointerInput {
            x,
            y,
            rendered_width: w,
            rendered_height: h,
        }
    }

    fn last_modifiers(transport: &RecordingTransport) -> Modifiers {
        match transport.sent().last() {
            Some(ClientEvent::RemoteKeyEvent(k)) => k.modifiers,
            other => panic!("expected key event, got {other:?}"),
        }
    }

    #[test]
    fn scale_to_native_resolution() {
        assert_eq!(scale_point(pointer(320.0, 180.0, 640.0, 360.0), (1280, 720)), Some((640.0, 360.0)));
        assert_eq!(scale_point(pointer(0.0, 0.0, 640.0, 360.0), (1280, 720)), Some((0.0, 0.0)));
        assert_eq!(scale_point(pointer(640.0, 360.0, 640.0, 360.0), (1280, 720)), Some((1280.0, 720.0)));
    }

    #[test]
    fn scale_clamps_outside_points() {
        assert_eq!(scale_point(pointer(-10.0, 900.0, 640.0, 360.0), (1280, 720)), Some((0.0, 720.0)));
    }

    #[test]
    fn zero_rendered_size_is_dropped() {
        assert_eq!(scale_point(pointer(1.0, 1.0, 0.0, 360.0), (1280, 720)), None);
        let (mut fwd, transport) = forwarder();
        assert_eq!(
            fwd.handle_pointer_move(pointer(1.0, 1.0, 640.0, 0.0)),
            Disposition::PassThrough
        );
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn pointer_move_carries_native_size() {
        let (mut fwd, transport) = forwarder();
        fwd.handle_pointer_move(pointer(320.0, 180.0, 640.0, 360.0));
        assert_eq!(
            transport.sent(),
            vec![ClientEvent::RemoteMouseMove(RemoteMouseMove {
                to: "h1".to_string(),
                x: 640.0,
                y: 360.0,
                screen_width: 1280,
                screen_height: 720,
            })]
        );
    }

    #[test]
    fn caps_lock_toggles_per_physical_press() {
        let (mut fwd, transport) = forwarder();
        fwd.handle_key(key("CapsLock", KeyDirection::Down, false));
        assert!(last_modifiers(&transport).caps_lock);
        fwd.handle_key(key("CapsLock", KeyDirection::Down, true));
        assert!(last_modifiers(&transport).caps_lock, "auto-repeat must not flip");
        fwd.handle_key(key("CapsLock", KeyDirection::Up, false));
        assert!(last_modifiers(&transport).caps_lock, "release must not flip");
        fwd.handle_key(key("CapsLock", KeyDirection::Down, false));
        assert!(!last_modifiers(&transport).caps_lock);
    }

    #[test]
    fn shift_is_held_not_toggled() {
        let (mut fwd, transport) = forwarder();
        fwd.handle_key(key("Shift", KeyDirection::Down, false));
        assert!(last_modifiers(&transport).shift);
        fwd.handle_key(key("a", KeyDirection::Down, false));
        assert!(last_modifiers(&transport).shift);
        fwd.handle_key(key("Shift", KeyDirection::Up, false));
        assert!(!last_modifiers(&transport).shift);
    }

    #[test]
    fn shift_release_clears_following_keys() {
        let (mut fwd, transport) = forwarder();
        fwd.handle_key(key("Shift", KeyDirection::Down, false));
        fwd.handle_key(key("A", KeyDirection::Down, false));
        assert!(last_modifiers(&transport).shift);
        fwd.handle_key(key("Shift", KeyDirection::Up, false));
        fwd.handle_key(key("A", KeyDirection::Down, false));
        assert!(!last_modifiers(&transport).shift);
        assert_eq!(transport.count("remote-key-event"), 4);
    }

    #[test]
    fn live_modifiers_repair_desync() {
        let (mut fwd, transport) = forwarder();
        fwd.handle_key(key("Control", KeyDirection::Down, false));
        // The key-up was lost to a focus change; the next event says otherwise
        let mut next = key("c", KeyDirection::Down, false);
        next.live = Some(Modifiers::default());
        fwd.handle_key(next);
        assert!(!last_modifiers(&transport).control);
    }

    #[test]
    fn reconcile_never_touches_caps_lock() {
        let mut state = ModifierKeyState::default();
        state.observe("CapsLock", KeyDirection::Down, false);
        state.reconcile(Some(Modifiers::default()));
        assert!(state.snapshot().caps_lock);
    }

    #[test]
    fn key_event_payload() {
        let (mut fwd, transport) = forwarder();
        let disposition = fwd.handle_key(KeyInput {
            key: "A".to_string(),
            code: "KeyA".to_string(),
            key_code: 65,
            direction: KeyDirection::Down,
            repeat: false,
            live: None,
        });
        assert_eq!(disposition, Disposition::PreventDefault);
        match &transport.sent()[0] {
            ClientEvent::RemoteKeyEvent(k) => {
                assert_eq!(k.to, "h1");
                assert_eq!(k.key, "A");
                assert_eq!(k.code, "KeyA");
                assert_eq!(k.key_code, 65);
                assert_eq!(k.direction, KeyDirection::Down);
            }
            other => panic!("expected key event, got {other:?}"),
        }
    }

    #[test]
    fn click_button_mapping() {
        let (mut fwd, transport) = forwarder();
        assert_eq!(
            fwd.handle_click(ClickInput { button: 2, live: None }),
            Disposition::PreventDefault
        );
        assert_eq!(
            fwd.handle_click(ClickInput { button: 4, live: None }),
            Disposition::PassThrough
        );
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            ClientEvent::RemoteMouseClick(c) => assert_eq!(c.button, MouseButton::Right),
            other => panic!("expected click, got {other:?}"),
        }
    }

    #[test]
    fn wheel_uses_first_present_delta() {
        let (mut fwd, transport) = forwarder();
        fwd.handle_wheel(WheelInput {
            delta_y: None,
            detail: Some(3.0),
            wheel_delta: Some(-120.0),
        });
        fwd.handle_wheel(WheelInput {
            delta_y: Some(-53.0),
            detail: Some(3.0),
            wheel_delta: None,
        });
        let deltas: Vec<f64> = transport
            .sent()
            .iter()
            .map(|e| match e {
                ClientEvent::RemoteMouseScroll(s) => s.delta_y,
                other => panic!("expected scroll, got {other:?}"),
            })
            .collect();
        assert_eq!(deltas, vec![3.0, -53.0]);
    }

    #[test]
    fn detached_forwarder_sends_nothing() {
        let (mut fwd, transport) = forwarder();
        fwd.handle_key(key("Shift", KeyDirection::Down, false));
        fwd.detach();
        transport.take();

        assert_eq!(fwd.handle_key(key("a", KeyDirection::Down, false)), Disposition::PassThrough);
        assert_eq!(
            fwd.handle_pointer_move(pointer(1.0, 1.0, 10.0, 10.0)),
            Disposition::PassThrough
        );
        assert_eq!(fwd.handle_click(ClickInput { button: 0, live: None }), Disposition::PassThrough);
        assert_eq!(fwd.handle_wheel(WheelInput::default()), Disposition::PassThrough);
        assert_eq!(fwd.handle_context_menu(), Disposition::PassThrough);
        assert!(transport.sent().is_empty());
        assert_eq!(fwd.modifiers(), Modifiers::default());
    }

    #[test]
    fn context_menu_suppressed_while_attached() {
        let (fwd, transport) = forwarder();
        assert_eq!(fwd.handle_context_menu(), Disposition::PreventDefault);
        assert!(transport.sent().is_empty());
    }
}
