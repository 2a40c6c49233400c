//! The listen state machine.
//!
//! Listen, advertise and discover requests from any thread funnel through
//! one serializing queue; the machine defers socket creation to the first
//! advertise/discover and tears everything down on the last disable, so an
//! idle daemon holds no sockets.

use std::{fmt, net::Ipv4Addr, str::FromStr, sync::Arc};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::name_service::IpNameService;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("unsupported transport in `{0}`")]
    UnsupportedTransport(String),
    #[error("missing `{0}` key")]
    MissingKey(&'static str),
    #[error("malformed `{key}` value `{value}`")]
    BadValue { key: &'static str, value: String },
}

/// A normalized TCP connect spec: `tcp:r4addr=<ipv4>,r4port=<port>`.
///
/// Both keys are required. `r4addr=0.0.0.0` is legal only for listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusAddr {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl FromStr for BusAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let args = s
            .strip_prefix("tcp:")
            .ok_or_else(|| AddrError::UnsupportedTransport(s.to_string()))?;
        let mut addr = None;
        let mut port = None;
        for part in args.split(',').filter(|part| !part.is_empty()) {
            match part.split_once('=') {
                Some(("r4addr", value)) => {
                    addr = Some(value.parse::<Ipv4Addr>().map_err(|_| AddrError::BadValue {
                        key: "r4addr",
                        value: value.to_string(),
                    })?)
                }
                Some(("r4port", value)) => {
                    port = Some(value.parse::<u16>().map_err(|_| AddrError::BadValue {
                        key: "r4port",
                        value: value.to_string(),
                    })?)
                }
                // Unknown keys are ignored for forward compatibility.
                _ => {}
            }
        }
        Ok(Self {
            addr: addr.ok_or(AddrError::MissingKey("r4addr"))?,
            port: port.ok_or(AddrError::MissingKey("r4port"))?,
        })
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:r4addr={},r4port={}", self.addr, self.port)
    }
}

enum ListenRequest {
    StartListen(BusAddr),
    StopListen(BusAddr),
    EnableAdvertise { name: String, quiet: bool },
    DisableAdvertise(String),
    EnableDiscover(String),
    DisableDiscover(String),
    SetUntrustedClientCount(usize),
}

#[derive(Default)]
struct MachineState {
    is_listening: bool,
    is_ns_enabled: bool,
    is_advertising: bool,
    is_discovering: bool,
    listen_addrs: Vec<BusAddr>,
    /// The spec actually bound (the ephemeral port resolved), if listening.
    bound_spec: Option<String>,
    advertise_list: Vec<(String, bool)>,
    discover_list: Vec<String>,
    router_adv_up: bool,
}

/// Cloneable front half: everything on the daemon uses this to file
/// requests; the machine task consumes them in order.
#[derive(Clone)]
pub struct ListenHandle {
    requests: mpsc::UnboundedSender<ListenRequest>,
    state: Arc<Mutex<MachineState>>,
}

impl ListenHandle {
    pub async fn start_listen(&self, addr: BusAddr) {
        let _ = self.requests.send(ListenRequest::StartListen(addr));
    }

    pub async fn stop_listen(&self, addr: BusAddr) {
        let _ = self.requests.send(ListenRequest::StopListen(addr));
    }

    pub async fn enable_advertise(&self, name: &str, quiet: bool) {
        let _ = self.requests.send(ListenRequest::EnableAdvertise {
            name: name.to_string(),
            quiet,
        });
    }

    pub async fn disable_advertise(&self, name: &str) {
        let _ = self
            .requests
            .send(ListenRequest::DisableAdvertise(name.to_string()));
    }

    pub async fn enable_discover(&self, prefix: &str) {
        let _ = self
            .requests
            .send(ListenRequest::EnableDiscover(prefix.to_string()));
    }

    pub async fn disable_discover(&self, prefix: &str) {
        let _ = self
            .requests
            .send(ListenRequest::DisableDiscover(prefix.to_string()));
    }

    /// The transport keeps the quiet router advertisement up only while the
    /// untrusted client count stays below the configured ceiling.
    pub async fn set_untrusted_client_count(&self, count: usize) {
        let _ = self
            .requests
            .send(ListenRequest::SetUntrustedClientCount(count));
    }

    /// Connect specs a peer can reach this router at right now.
    pub fn listen_specs(&self) -> Vec<String> {
        self.state.lock().bound_spec.iter().cloned().collect()
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().is_listening
    }
}

/// The serializing half. Owns the TCP listener; accepted sockets are handed
/// to the bus through `accepted_tx`.
pub struct ListenMachine {
    requests_rx: mpsc::UnboundedReceiver<ListenRequest>,
    accepted_tx: mpsc::Sender<TcpStream>,
    name_service: Arc<dyn IpNameService>,
    state: Arc<Mutex<MachineState>>,
    guid: String,
    router_advertisement: Option<String>,
    max_untrusted_clients: usize,
    listener: Option<TcpListener>,
}

enum Step {
    Request(Option<ListenRequest>),
    Accepted(std::io::Result<TcpStream>),
}

impl ListenMachine {
    pub fn new(
        guid: String,
        router_advertisement: Option<String>,
        max_untrusted_clients: usize,
        name_service: Arc<dyn IpNameService>,
        accepted_tx: mpsc::Sender<TcpStream>,
    ) -> (ListenHandle, ListenMachine) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MachineState::default()));
        (
            ListenHandle {
                requests,
                state: state.clone(),
            },
            ListenMachine {
                requests_rx,
                accepted_tx,
                name_service,
                state,
                guid,
                router_advertisement,
                max_untrusted_clients,
                listener: None,
            },
        )
    }

    pub async fn run(mut self) {
        loop {
            let step = match &self.listener {
                Some(listener) => {
                    tokio::select! {
                        request = self.requests_rx.recv() => Step::Request(request),
                        accepted = listener.accept() => {
                            Step::Accepted(accepted.map(|(stream, _)| stream))
                        }
                    }
                }
                None => Step::Request(self.requests_rx.recv().await),
            };
            match step {
                Step::Request(None) => break,
                Step::Request(Some(request)) => {
                    self.handle(request).await;
                    self.assert_consistency();
                }
                Step::Accepted(Ok(stream)) => {
                    if self.accepted_tx.send(stream).await.is_err() {
                        break;
                    }
                }
                Step::Accepted(Err(e)) => warn!("accept failed: {e}"),
            }
        }
        debug!("listen machine drained");
    }

    async fn handle(&mut self, request: ListenRequest) {
        match request {
            ListenRequest::StartListen(addr) => {
                {
                    let mut state = self.state.lock();
                    if !state.listen_addrs.contains(&addr) {
                        state.listen_addrs.push(addr);
                    }
                }
                // The socket itself waits for the first advertise/discover;
                // activating flushes anything already requested.
                self.activate().await;
            }
            ListenRequest::StopListen(addr) => {
                let now_empty = {
                    let mut state = self.state.lock();
                    state.listen_addrs.retain(|a| *a != addr);
                    state.listen_addrs.is_empty()
                };
                if now_empty {
                    self.teardown_everything();
                }
            }
            ListenRequest::EnableAdvertise { name, quiet } => {
                let was_enabled = self.state.lock().is_ns_enabled;
                {
                    let mut state = self.state.lock();
                    state.advertise_list.retain(|(n, _)| *n != name);
                    state.advertise_list.push((name.clone(), quiet));
                }
                if self.activate().await && was_enabled {
                    self.name_service.advertise(&name, quiet);
                }
            }
            ListenRequest::DisableAdvertise(name) => {
                let enabled = {
                    let mut state = self.state.lock();
                    state.advertise_list.retain(|(n, _)| *n != name);
                    state.is_advertising = state.is_ns_enabled && !state.advertise_list.is_empty();
                    state.is_ns_enabled
                };
                if enabled {
                    self.name_service.cancel_advertise(&name);
                }
                self.maybe_disable_ns();
            }
            ListenRequest::EnableDiscover(prefix) => {
                let was_enabled = self.state.lock().is_ns_enabled;
                {
                    let mut state = self.state.lock();
                    if !state.discover_list.contains(&prefix) {
                        state.discover_list.push(prefix.clone());
                    }
                }
                if self.activate().await && was_enabled {
                    self.name_service.find(&prefix);
                }
            }
            ListenRequest::DisableDiscover(prefix) => {
                let enabled = {
                    let mut state = self.state.lock();
                    state.discover_list.retain(|p| *p != prefix);
                    state.is_discovering = state.is_ns_enabled && !state.discover_list.is_empty();
                    state.is_ns_enabled
                };
                if enabled {
                    self.name_service.cancel_find(&prefix);
                }
                self.maybe_disable_ns();
            }
            ListenRequest::SetUntrustedClientCount(count) => {
                let Some(router_name) = self.router_advertisement.clone() else {
                    return;
                };
                let below_ceiling = count < self.max_untrusted_clients;
                let up = self.state.lock().router_adv_up;
                if below_ceiling && !up {
                    self.state.lock().router_adv_up = true;
                    if self.activate().await {
                        self.name_service.advertise(&router_name, true);
                    }
                } else if !below_ceiling && up {
                    let enabled = {
                        let mut state = self.state.lock();
                        state.router_adv_up = false;
                        state.is_ns_enabled
                    };
                    if enabled {
                        self.name_service.cancel_advertise(&router_name);
                    }
                    self.maybe_disable_ns();
                }
            }
        }
    }

    /// Bring the socket and name service up if anything wants them, and
    /// flush every recorded advertisement and discovery on the transition.
    /// Returns whether the name service is up afterwards.
    async fn activate(&mut self) -> bool {
        let wanted = {
            let state = self.state.lock();
            !state.advertise_list.is_empty()
                || !state.discover_list.is_empty()
                || state.router_adv_up
        };
        if !wanted {
            return false;
        }
        self.ensure_listening().await;

        let (newly_enabled, replay) = {
            let mut state = self.state.lock();
            if !state.is_listening {
                return false;
            }
            if state.is_ns_enabled {
                (false, None)
            } else {
                let Some(spec) = state.bound_spec.clone() else {
                    return false;
                };
                state.is_ns_enabled = true;
                (true, Some(spec))
            }
        };
        if let Some(spec) = replay {
            debug_assert!(newly_enabled);
            self.name_service.enable(&self.guid, &spec);
            let (advertisements, finds, router_adv) = {
                let state = self.state.lock();
                (
                    state.advertise_list.clone(),
                    state.discover_list.clone(),
                    state.router_adv_up,
                )
            };
            for (name, quiet) in advertisements {
                self.name_service.advertise(&name, quiet);
            }
            for prefix in finds {
                self.name_service.find(&prefix);
            }
            if router_adv {
                if let Some(router_name) = &self.router_advertisement {
                    self.name_service.advertise(router_name, true);
                }
            }
        }

        let mut state = self.state.lock();
        state.is_advertising = state.is_ns_enabled && !state.advertise_list.is_empty();
        state.is_discovering = state.is_ns_enabled && !state.discover_list.is_empty();
        state.is_ns_enabled
    }

    async fn ensure_listening(&mut self) {
        if self.listener.is_some() {
            return;
        }
        let Some(addr) = self.state.lock().listen_addrs.first().copied() else {
            return;
        };
        match TcpListener::bind((addr.addr, addr.port)).await {
            Ok(listener) => {
                let bound = listener.local_addr().map(|a| a.port()).unwrap_or(addr.port);
                let spec = BusAddr {
                    addr: addr.addr,
                    port: bound,
                };
                info!("listening on {spec}");
                self.listener = Some(listener);
                let mut state = self.state.lock();
                state.is_listening = true;
                state.bound_spec = Some(spec.to_string());
            }
            Err(e) => warn!("failed to bind {addr}: {e}"),
        }
    }

    fn maybe_disable_ns(&mut self) {
        let idle = {
            let state = self.state.lock();
            state.is_ns_enabled
                && state.advertise_list.is_empty()
                && state.discover_list.is_empty()
                && !state.router_adv_up
        };
        if idle {
            self.name_service.disable();
            let mut state = self.state.lock();
            state.is_ns_enabled = false;
            state.is_advertising = false;
            state.is_discovering = false;
            // No advertisement, no discovery: the socket goes too.
            state.is_listening = false;
            state.bound_spec = None;
            drop(state);
            self.listener = None;
            info!("idle: listen socket released");
        }
    }

    fn teardown_everything(&mut self) {
        let names: Vec<String> = {
            let state = self.state.lock();
            state
                .advertise_list
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            self.name_service.cancel_advertise(&name);
        }
        let prefixes: Vec<String> = self.state.lock().discover_list.clone();
        for prefix in prefixes {
            self.name_service.cancel_find(&prefix);
        }
        self.name_service.disable();
        self.listener = None;
        let mut state = self.state.lock();
        state.is_listening = false;
        state.is_ns_enabled = false;
        state.is_advertising = false;
        state.is_discovering = false;
        state.router_adv_up = false;
        state.bound_spec = None;
        state.advertise_list.clear();
        state.discover_list.clear();
    }

    fn assert_consistency(&self) {
        let state = self.state.lock();
        if !state.is_listening {
            debug_assert!(!state.is_advertising);
            debug_assert!(!state.is_discovering);
            debug_assert!(!state.is_ns_enabled);
        }
        if state.is_ns_enabled {
            debug_assert!(state.is_advertising || state.is_discovering || state.router_adv_up);
            debug_assert!(state.is_listening);
            debug_assert!(state.bound_spec.is_some());
        }
        if state.is_advertising {
            debug_assert!(!state.advertise_list.is_empty());
            debug_assert!(state.is_listening);
            debug_assert!(state.is_ns_enabled);
        }
        if state.is_discovering {
            debug_assert!(!state.discover_list.is_empty());
            debug_assert!(state.is_listening);
            debug_assert!(state.is_ns_enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name_service::InProcessNetwork;

    #[test]
    fn bus_addr_round_trip() {
        let addr: BusAddr = "tcp:r4addr=192.168.1.7,r4port=9955".parse().unwrap();
        assert_eq!(addr.addr, Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(addr.port, 9955);
        assert_eq!(addr.to_string(), "tcp:r4addr=192.168.1.7,r4port=9955");
    }

    #[test]
    fn bus_addr_requires_both_keys() {
        assert_eq!(
            "tcp:r4addr=10.0.0.1".parse::<BusAddr>(),
            Err(AddrError::MissingKey("r4port"))
        );
        assert_eq!(
            "tcp:r4port=80".parse::<BusAddr>(),
            Err(AddrError::MissingKey("r4addr"))
        );
        assert!(matches!(
            "udp:r4addr=10.0.0.1,r4port=80".parse::<BusAddr>(),
            Err(AddrError::UnsupportedTransport(_))
        ));
        assert!(matches!(
            "tcp:r4addr=nonsense,r4port=80".parse::<BusAddr>(),
            Err(AddrError::BadValue { key: "r4addr", .. })
        ));
    }

    #[tokio::test]
    async fn socket_deferred_until_first_advertise() {
        let network = InProcessNetwork::new();
        let (accepted_tx, _accepted_rx) = mpsc::channel(4);
        let (handle, machine) = ListenMachine::new(
            "a".repeat(32),
            None,
            8,
            network.node(),
            accepted_tx,
        );
        tokio::spawn(machine.run());

        handle
            .start_listen("tcp:r4addr=127.0.0.1,r4port=0".parse().unwrap())
            .await;
        tokio::task::yield_now().await;
        assert!(!handle.is_listening());
        assert!(handle.listen_specs().is_empty());

        handle.enable_advertise("org.acme.svc", false).await;
        // Give the machine a beat to bind.
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if handle.is_listening() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(handle.is_listening());
        assert_eq!(handle.listen_specs().len(), 1);

        // Last disable: socket goes away again.
        handle.disable_advertise("org.acme.svc").await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if !handle.is_listening() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!handle.is_listening());
    }
}
