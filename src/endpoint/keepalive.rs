use std::time::{Duration, Instant};

use event_listener::{Event, EventListener};
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepaliveParams {
    /// RX idle time before the first ProbeReq goes out.
    pub idle_timeout: Duration,
    /// How long to wait for a ProbeAck before resending or giving up.
    pub probe_timeout: Duration,
    /// ProbeReqs sent before the link is declared dead.
    pub max_idle_probes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    WaitingProbeAck(u32),
    Dead,
}

/// What the probe driver should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advice {
    /// No keepalive configured; wait for a parameter change.
    Disabled,
    WaitUntil(Instant),
    SendProbe,
    Dead,
}

struct State {
    params: Option<KeepaliveParams>,
    link: LinkState,
    last_rx: Instant,
    probe_sent: Instant,
}

/// Per-endpoint keepalive state machine.
///
/// Transitions are computed in [`Keepalive::advance`] so the machine can be
/// exercised without a socket; the endpoint's probe task owns the clock and
/// the actual ProbeReq transmission.
pub struct Keepalive {
    state: Mutex<State>,
    changed: Event,
}

impl Keepalive {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(State {
                params: None,
                link: LinkState::Idle,
                last_rx: now,
                probe_sent: now,
            }),
            changed: Event::new(),
        }
    }

    pub fn set_params(&self, params: Option<KeepaliveParams>) {
        let mut state = self.state.lock();
        state.params = params;
        if state.link != LinkState::Dead {
            state.link = LinkState::Idle;
            state.last_rx = Instant::now();
        }
        drop(state);
        self.changed.notify(usize::MAX);
    }

    pub fn params(&self) -> Option<KeepaliveParams> {
        self.state.lock().params
    }

    pub fn link_state(&self) -> LinkState {
        self.state.lock().link
    }

    /// Every received byte resets the idle clock and re-arms the machine.
    pub fn on_rx(&self) {
        let mut state = self.state.lock();
        state.last_rx = Instant::now();
        if state.link != LinkState::Dead {
            state.link = LinkState::Idle;
        }
    }

    /// Register interest in parameter changes before calling [`advance`].
    pub fn listen(&self) -> EventListener {
        self.changed.listen()
    }

    pub fn advance(&self, now: Instant) -> Advice {
        let mut state = self.state.lock();
        let Some(params) = state.params else {
            return Advice::Disabled;
        };
        match state.link {
            LinkState::Dead => Advice::Dead,
            LinkState::Idle => {
                let deadline = state.last_rx + params.idle_timeout;
                if now < deadline {
                    Advice::WaitUntil(deadline)
                } else {
                    state.link = LinkState::WaitingProbeAck(1);
                    state.probe_sent = now;
                    Advice::SendProbe
                }
            }
            LinkState::WaitingProbeAck(sent) => {
                let deadline = state.probe_sent + params.probe_timeout;
                if now < deadline {
                    Advice::WaitUntil(deadline)
                } else if sent < params.max_idle_probes {
                    state.link = LinkState::WaitingProbeAck(sent + 1);
                    state.probe_sent = now;
                    Advice::SendProbe
                } else {
                    state.link = LinkState::Dead;
                    Advice::Dead
                }
            }
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> KeepaliveParams {
        KeepaliveParams {
            idle_timeout: Duration::from_secs(40),
            probe_timeout: Duration::from_secs(10),
            max_idle_probes: 2,
        }
    }

    #[test]
    fn disabled_until_configured() {
        let ka = Keepalive::new();
        assert_eq!(ka.advance(Instant::now()), Advice::Disabled);
    }

    #[test]
    fn idle_then_probe_then_dead() {
        let ka = Keepalive::new();
        ka.set_params(Some(params()));
        let start = Instant::now();

        match ka.advance(start) {
            Advice::WaitUntil(deadline) => assert!(deadline > start),
            other => panic!("unexpected advice: {other:?}"),
        }

        // Idle timeout elapsed with no RX: first probe.
        let t1 = start + Duration::from_secs(41);
        assert_eq!(ka.advance(t1), Advice::SendProbe);
        assert_eq!(ka.link_state(), LinkState::WaitingProbeAck(1));

        // No ack by the probe timeout: second (final) probe.
        let t2 = t1 + Duration::from_secs(11);
        assert_eq!(ka.advance(t2), Advice::SendProbe);
        assert_eq!(ka.link_state(), LinkState::WaitingProbeAck(2));

        // Still nothing: dead.
        let t3 = t2 + Duration::from_secs(11);
        assert_eq!(ka.advance(t3), Advice::Dead);
        assert_eq!(ka.link_state(), LinkState::Dead);
    }

    #[test]
    fn rx_resets_to_idle() {
        let ka = Keepalive::new();
        ka.set_params(Some(params()));
        let start = Instant::now();
        assert_eq!(ka.advance(start + Duration::from_secs(41)), Advice::SendProbe);

        ka.on_rx();
        assert_eq!(ka.link_state(), LinkState::Idle);
        match ka.advance(Instant::now()) {
            Advice::WaitUntil(_) => {}
            other => panic!("unexpected advice: {other:?}"),
        }
    }
}
