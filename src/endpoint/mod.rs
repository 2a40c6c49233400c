//! Endpoints: the message sources and sinks the router fans out to.
//!
//! Every variant presents the same small capability surface (push, unique
//! name, remote-message policy, type tag). The routing tables hold
//! [`EndpointId`]s and resolve them through the [`Registry`]; handles are
//! cheap clones, so a reader that resolved an endpoint keeps it alive even
//! if it is deregistered concurrently.

mod keepalive;
mod tx_queue;

pub use keepalive::{Advice, Keepalive, KeepaliveParams, LinkState};
pub use tx_queue::{TxQueue, MAX_TX_QUEUE};

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use event_listener::{Event, EventListener};
use parking_lot::{Mutex, RwLock};

use crate::{
    codec::{Message, NameTransfer},
    guid::Guid,
    router::RoutingError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    Local,
    Null,
    Remote,
    BusToBus,
    Virtual,
}

/// Why a connection-backed endpoint went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly shutdown from either side.
    Clean,
    /// The peer vanished mid-stream.
    Abrupt,
    /// The keepalive machine declared the link dead.
    Timeout,
}

pub struct B2bInfo {
    pub remote_guid: Guid,
    pub remote_protocol_version: u32,
    pub name_transfer: NameTransfer,
}

struct B2bState {
    remote_guid: Guid,
    remote_protocol_version: u32,
    name_transfer: NameTransfer,
    /// Session this link was created to carry, once routes install. Used to
    /// pick among candidate links when routing session-scoped control
    /// traffic.
    session_id: AtomicU32,
}

struct RemoteState {
    tx: TxQueue,
    allow_remote: AtomicBool,
    keepalive: Keepalive,
    pause_after_rx_reply: AtomicBool,
    sudden_disconnect: AtomicBool,
    protocol_version: u32,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    b2b: Option<B2bState>,
}

struct VirtualState {
    /// `session id → ordered bus-to-bus endpoints`; id 0 holds the default
    /// routes installed on name exchange.
    routes: Mutex<BTreeMap<u32, Vec<Endpoint>>>,
    /// Set while the last route is being torn down. A stopping virtual
    /// endpoint is never revived; a fresh one is created after removal.
    stopping: AtomicBool,
}

enum Variant {
    Local { tx: TxQueue },
    Null { tx: TxQueue, allow_remote: AtomicBool },
    Remote(RemoteState),
    Virtual(VirtualState),
}

struct Inner {
    id: EndpointId,
    unique_name: String,
    variant: Variant,
    valid: AtomicBool,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    exited: AtomicBool,
}

#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("unique_name", &self.inner.unique_name)
            .field("type", &self.ep_type())
            .finish()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Endpoint {}

impl Endpoint {
    fn new(id: EndpointId, unique_name: String, variant: Variant) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                unique_name,
                variant,
                valid: AtomicBool::new(true),
                disconnect_reason: Mutex::new(None),
                exited: AtomicBool::new(false),
            }),
        }
    }

    pub fn new_local(id: EndpointId, unique_name: impl Into<String>) -> Self {
        Self::new(id, unique_name.into(), Variant::Local { tx: TxQueue::new() })
    }

    pub fn new_null(id: EndpointId, unique_name: impl Into<String>, allow_remote: bool) -> Self {
        Self::new(
            id,
            unique_name.into(),
            Variant::Null {
                tx: TxQueue::new(),
                allow_remote: AtomicBool::new(allow_remote),
            },
        )
    }

    pub fn new_remote(
        id: EndpointId,
        unique_name: impl Into<String>,
        allow_remote: bool,
        protocol_version: u32,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        b2b: Option<B2bInfo>,
    ) -> Self {
        Self::new(
            id,
            unique_name.into(),
            Variant::Remote(RemoteState {
                tx: TxQueue::new(),
                allow_remote: AtomicBool::new(allow_remote),
                keepalive: Keepalive::new(),
                pause_after_rx_reply: AtomicBool::new(false),
                sudden_disconnect: AtomicBool::new(false),
                protocol_version,
                local_addr,
                peer_addr,
                b2b: b2b.map(|info| B2bState {
                    remote_guid: info.remote_guid,
                    remote_protocol_version: info.remote_protocol_version,
                    name_transfer: info.name_transfer,
                    session_id: AtomicU32::new(0),
                }),
            }),
        )
    }

    pub fn new_virtual(id: EndpointId, unique_name: impl Into<String>) -> Self {
        Self::new(
            id,
            unique_name.into(),
            Variant::Virtual(VirtualState {
                routes: Mutex::new(BTreeMap::new()),
                stopping: AtomicBool::new(false),
            }),
        )
    }

    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    pub fn unique_name(&self) -> &str {
        &self.inner.unique_name
    }

    pub fn ep_type(&self) -> EndpointType {
        match &self.inner.variant {
            Variant::Local { .. } => EndpointType::Local,
            Variant::Null { .. } => EndpointType::Null,
            Variant::Remote(state) if state.b2b.is_some() => EndpointType::BusToBus,
            Variant::Remote(_) => EndpointType::Remote,
            Variant::Virtual(_) => EndpointType::Virtual,
        }
    }

    pub fn is_bus_to_bus(&self) -> bool {
        self.ep_type() == EndpointType::BusToBus
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    /// Whether messages originating behind a bus-to-bus endpoint may be
    /// delivered here.
    pub fn allow_remote_messages(&self) -> bool {
        match &self.inner.variant {
            Variant::Local { .. } => true,
            Variant::Null { allow_remote, .. } => allow_remote.load(Ordering::SeqCst),
            Variant::Remote(state) => {
                state.b2b.is_some() || state.allow_remote.load(Ordering::SeqCst)
            }
            // A virtual endpoint stands for an attachment that is remote by
            // definition.
            Variant::Virtual(_) => true,
        }
    }

    fn tx_queue(&self) -> Option<&TxQueue> {
        match &self.inner.variant {
            Variant::Local { tx } | Variant::Null { tx, .. } => Some(tx),
            Variant::Remote(state) => Some(&state.tx),
            Variant::Virtual(_) => None,
        }
    }

    /// Enqueue a message for this endpoint. For virtual endpoints the
    /// session id picks the bus-to-bus route; id 0 falls back to the default
    /// routes installed at name-exchange time.
    pub async fn push_message(
        &self,
        msg: Arc<Message>,
        session_id: u32,
    ) -> Result<(), RoutingError> {
        if !self.is_valid() {
            return Err(RoutingError::EndpointClosing);
        }
        match &self.inner.variant {
            Variant::Virtual(state) => {
                if state.stopping.load(Ordering::SeqCst) {
                    return Err(RoutingError::EndpointClosing);
                }
                let target = {
                    let routes = state.routes.lock();
                    routes
                        .get(&session_id)
                        .or_else(|| routes.get(&0))
                        .and_then(|eps| eps.iter().find(|ep| ep.is_valid()))
                        .cloned()
                };
                match target.as_ref().and_then(Endpoint::tx_queue) {
                    Some(queue) => queue.push(msg).await,
                    None => Err(RoutingError::NoRoute),
                }
            }
            _ => match self.tx_queue() {
                Some(queue) => queue.push(msg).await,
                None => Err(RoutingError::NoRoute),
            },
        }
    }

    /// Enqueue link control traffic ahead of user data.
    pub fn push_control(&self, msg: Arc<Message>) -> Result<(), RoutingError> {
        match self.tx_queue() {
            Some(queue) => queue.push_control(msg),
            None => Err(RoutingError::NoRoute),
        }
    }

    /// Dequeue the next outbound message. Used by the transmit pump of
    /// connection-backed endpoints and by in-process attachments.
    pub async fn next_outbound(&self) -> Option<Arc<Message>> {
        match self.tx_queue() {
            Some(queue) => queue.pop().await,
            None => None,
        }
    }

    /// Invalidate the endpoint and wake everything blocked on it. Safe to
    /// call repeatedly.
    pub fn stop(&self) {
        self.inner.valid.store(false, Ordering::SeqCst);
        if let Some(queue) = self.tx_queue() {
            queue.close();
        }
    }

    /// Wait for the transmit queue to drain (bounded by `max_wait`), then
    /// stop.
    pub async fn stop_after_tx_empty(&self, max_wait: Duration) {
        if let Some(queue) = self.tx_queue() {
            queue.wait_empty(max_wait).await;
        }
        self.stop();
    }

    pub fn tx_is_empty(&self) -> bool {
        self.tx_queue().map_or(true, TxQueue::is_empty)
    }

    pub fn keepalive(&self) -> Option<&Keepalive> {
        match &self.inner.variant {
            Variant::Remote(state) => Some(&state.keepalive),
            _ => None,
        }
    }

    /// Arm the one-shot that suspends RX after the next METHOD_RETURN.
    pub fn pause_after_rx_reply(&self) {
        if let Variant::Remote(state) = &self.inner.variant {
            state.pause_after_rx_reply.store(true, Ordering::SeqCst);
        }
    }

    pub fn take_pause_after_rx_reply(&self) -> bool {
        match &self.inner.variant {
            Variant::Remote(state) => state.pause_after_rx_reply.swap(false, Ordering::SeqCst),
            _ => false,
        }
    }

    pub fn set_sudden_disconnect(&self, sudden: bool) {
        if let Variant::Remote(state) = &self.inner.variant {
            state.sudden_disconnect.store(sudden, Ordering::SeqCst);
        }
    }

    pub fn sudden_disconnect(&self) -> bool {
        match &self.inner.variant {
            Variant::Remote(state) => state.sudden_disconnect.load(Ordering::SeqCst),
            _ => false,
        }
    }

    /// Peer protocol version, known once authentication completed.
    pub fn remote_protocol_version(&self) -> Option<u32> {
        match &self.inner.variant {
            Variant::Remote(state) => Some(
                state
                    .b2b
                    .as_ref()
                    .map_or(state.protocol_version, |b2b| b2b.remote_protocol_version),
            ),
            _ => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner.variant {
            Variant::Remote(state) => state.local_addr,
            _ => None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.inner.variant {
            Variant::Remote(state) => state.peer_addr,
            _ => None,
        }
    }

    pub fn remote_guid(&self) -> Option<&Guid> {
        match &self.inner.variant {
            Variant::Remote(state) => state.b2b.as_ref().map(|b2b| &b2b.remote_guid),
            _ => None,
        }
    }

    pub fn name_transfer(&self) -> Option<NameTransfer> {
        match &self.inner.variant {
            Variant::Remote(state) => state.b2b.as_ref().map(|b2b| b2b.name_transfer),
            _ => None,
        }
    }

    pub fn b2b_session_id(&self) -> u32 {
        match &self.inner.variant {
            Variant::Remote(state) => state
                .b2b
                .as_ref()
                .map_or(0, |b2b| b2b.session_id.load(Ordering::SeqCst)),
            _ => 0,
        }
    }

    pub fn set_b2b_session_id(&self, session_id: u32) {
        if let Variant::Remote(state) = &self.inner.variant {
            if let Some(b2b) = &state.b2b {
                b2b.session_id.store(session_id, Ordering::SeqCst);
            }
        }
    }

    pub fn set_disconnect_reason(&self, reason: DisconnectReason) {
        let mut slot = self.inner.disconnect_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.inner.disconnect_reason.lock()
    }

    /// First caller wins; the exit notification must fire exactly once.
    pub fn mark_exited(&self) -> bool {
        !self.inner.exited.swap(true, Ordering::SeqCst)
    }

    //
    // Virtual endpoint route management.
    //

    pub fn is_stopping(&self) -> bool {
        match &self.inner.variant {
            Variant::Virtual(state) => state.stopping.load(Ordering::SeqCst),
            _ => !self.is_valid(),
        }
    }

    pub fn set_stopping(&self) {
        if let Variant::Virtual(state) = &self.inner.variant {
            state.stopping.store(true, Ordering::SeqCst);
        }
    }

    /// Add a bus-to-bus route for `session_id` (0 = default route). Returns
    /// false if the endpoint is stopping or already has the route.
    pub fn add_session_route(&self, session_id: u32, b2b: &Endpoint) -> bool {
        let Variant::Virtual(state) = &self.inner.variant else {
            return false;
        };
        if state.stopping.load(Ordering::SeqCst) {
            return false;
        }
        let mut routes = state.routes.lock();
        let entry = routes.entry(session_id).or_default();
        if entry.iter().any(|ep| ep.id() == b2b.id()) {
            return false;
        }
        entry.push(b2b.clone());
        true
    }

    /// Remove the route for `session_id` through `b2b`.
    pub fn remove_session_route(&self, session_id: u32, b2b: EndpointId) {
        if let Variant::Virtual(state) = &self.inner.variant {
            let mut routes = state.routes.lock();
            if let Some(entry) = routes.get_mut(&session_id) {
                entry.retain(|ep| ep.id() != b2b);
                if entry.is_empty() {
                    routes.remove(&session_id);
                }
            }
        }
    }

    /// Drop the routes recorded for a session outright.
    pub fn clear_session_route(&self, session_id: u32) {
        if session_id == 0 {
            return;
        }
        if let Variant::Virtual(state) = &self.inner.variant {
            state.routes.lock().remove(&session_id);
        }
    }

    /// Drop every route through `b2b`. Returns true when no routes remain —
    /// at which point the virtual endpoint must be destroyed.
    pub fn remove_b2b_routes(&self, b2b: EndpointId) -> bool {
        match &self.inner.variant {
            Variant::Virtual(state) => {
                let mut routes = state.routes.lock();
                routes.retain(|_, eps| {
                    eps.retain(|ep| ep.id() != b2b);
                    !eps.is_empty()
                });
                routes.is_empty()
            }
            _ => false,
        }
    }

    pub fn has_route_through(&self, b2b: EndpointId) -> bool {
        match &self.inner.variant {
            Variant::Virtual(state) => state
                .routes
                .lock()
                .values()
                .any(|eps| eps.iter().any(|ep| ep.id() == b2b)),
            _ => false,
        }
    }

    /// The bus-to-bus endpoint the given session is routed through.
    pub fn route_for_session(&self, session_id: u32) -> Option<Endpoint> {
        match &self.inner.variant {
            Variant::Virtual(state) => {
                let routes = state.routes.lock();
                routes
                    .get(&session_id)
                    .or_else(|| routes.get(&0))
                    .and_then(|eps| eps.first())
                    .cloned()
            }
            _ => None,
        }
    }

    pub fn route_count(&self) -> usize {
        match &self.inner.variant {
            Variant::Virtual(state) => state.routes.lock().values().map(Vec::len).sum(),
            _ => 0,
        }
    }
}

/// Arena of live endpoints, keyed by [`EndpointId`].
///
/// Removal only unlinks the entry; the endpoint itself lives as long as the
/// last handle, so concurrent readers never observe a freed endpoint.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    endpoints: RwLock<HashMap<EndpointId, Endpoint>>,
    next_id: AtomicU64,
    changed: Event,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                endpoints: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                changed: Event::new(),
            }),
        }
    }

    pub fn mint_id(&self) -> EndpointId {
        EndpointId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn insert(&self, endpoint: Endpoint) {
        self.inner
            .endpoints
            .write()
            .insert(endpoint.id(), endpoint);
        self.inner.changed.notify(usize::MAX);
    }

    pub fn remove(&self, id: EndpointId) -> Option<Endpoint> {
        let removed = self.inner.endpoints.write().remove(&id);
        if removed.is_some() {
            self.inner.changed.notify(usize::MAX);
        }
        removed
    }

    pub fn get(&self, id: EndpointId) -> Option<Endpoint> {
        self.inner.endpoints.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.endpoints.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.inner.endpoints.read().values().cloned().collect()
    }

    /// Listener signaled whenever the endpoint set changes; used by waiters
    /// polling for a virtual endpoint to materialize.
    pub fn changed(&self) -> EventListener {
        self.inner.changed.listen()
    }

    pub fn notify_changed(&self) {
        self.inner.changed.notify(usize::MAX);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;

    fn message() -> Arc<Message> {
        Arc::new(Message::signal("/", "org.test", "Tick", vec![]))
    }

    fn b2b(registry: &Registry, guid: Guid) -> Endpoint {
        Endpoint::new_remote(
            registry.mint_id(),
            format!(":{}.1", guid.short()),
            true,
            crate::codec::PROTOCOL_VERSION,
            None,
            None,
            Some(B2bInfo {
                remote_guid: guid,
                remote_protocol_version: crate::codec::PROTOCOL_VERSION,
                name_transfer: NameTransfer::AllNames,
            }),
        )
    }

    #[tokio::test]
    async fn virtual_routes_by_session_with_default_fallback() {
        let registry = Registry::new();
        let link_a = b2b(&registry, Guid::generate());
        let link_b = b2b(&registry, Guid::generate());

        let vep = Endpoint::new_virtual(registry.mint_id(), ":remote.2");
        assert!(vep.add_session_route(0, &link_a));
        assert!(vep.add_session_route(7, &link_b));

        vep.push_message(message(), 7).await.unwrap();
        assert_eq!(link_b.next_outbound().await.unwrap().member.as_deref(), Some("Tick"));
        assert!(link_a.tx_is_empty());

        // Unknown session falls back to the default route.
        vep.push_message(message(), 99).await.unwrap();
        assert!(!link_a.tx_is_empty());
    }

    #[tokio::test]
    async fn last_route_removal_empties_virtual() {
        let registry = Registry::new();
        let link = b2b(&registry, Guid::generate());
        let vep = Endpoint::new_virtual(registry.mint_id(), ":remote.2");
        assert!(vep.add_session_route(0, &link));
        assert!(!vep.remove_b2b_routes(EndpointId(9999)));
        assert!(vep.remove_b2b_routes(link.id()));
        assert_eq!(vep.route_count(), 0);
    }

    #[tokio::test]
    async fn stopped_endpoint_rejects_pushes() {
        let registry = Registry::new();
        let ep = Endpoint::new_null(registry.mint_id(), ":local.2", true);
        ep.stop();
        assert_eq!(
            ep.push_message(message(), 0).await,
            Err(RoutingError::EndpointClosing)
        );
    }

    #[test]
    fn exit_fires_once() {
        let registry = Registry::new();
        let ep = Endpoint::new_null(registry.mint_id(), ":local.2", true);
        assert!(ep.mark_exited());
        assert!(!ep.mark_exited());
    }
}
