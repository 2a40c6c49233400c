//! The router core: takes inbound messages and routes them to an
//! appropriate set of endpoints.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, OnceLock,
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::{
    codec::{Message, MessageFlags},
    endpoint::{Endpoint, EndpointId, EndpointType, Registry},
    match_rules::RuleTable,
    name_table::{NameOwnerChanged, NameTable},
    objects,
};

/// Status of a routing attempt, and the routing-layer error kinds endpoints
/// surface on their RX paths.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route to destination")]
    NoRoute,
    #[error("delivery blocked by remote-message policy")]
    Blocked,
    #[error("endpoint closing")]
    EndpointClosing,
    #[error("router stopping")]
    Stopping,
    #[error("message time-to-live expired")]
    TimeToLiveExpired,
    #[error("body signature does not match the member")]
    SignatureMismatch,
    #[error("reply serial matches no outstanding call")]
    UnmatchedReplySerial,
    #[error("invalid header serial")]
    InvalidHeaderSerial,
}

/// Hook consulted for unicast messages carrying the auto-start flag whose
/// destination has no owner.
pub trait ServiceStarter: Send + Sync {
    fn start_service(&self, name: &str) -> bool;
}

/// One fan-out row for session multicast, ordered by
/// `(sender, session id, bus-to-bus endpoint, destination)`.
///
/// Local destinations carry `b2b = None` and are each delivered to;
/// remote destinations sharing a bus-to-bus link are delivered once per
/// distinct link, the far router fanning out from there.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionCastEntry {
    pub src: String,
    pub id: u32,
    pub b2b: Option<EndpointId>,
    pub dest: EndpointId,
}

pub struct Router {
    registry: Registry,
    names: NameTable,
    rules: RuleTable,
    cast_set: Mutex<BTreeSet<SessionCastEntry>>,
    b2b: Mutex<BTreeSet<EndpointId>>,
    local: OnceLock<Endpoint>,
    serial: AtomicU32,
    stopping: AtomicBool,
    service_starter: Mutex<Option<Arc<dyn ServiceStarter>>>,
    sessionless_tx: Mutex<Option<UnboundedSender<Arc<Message>>>>,
}

impl Router {
    pub fn new(registry: Registry) -> (Self, UnboundedReceiver<NameOwnerChanged>) {
        let (names, name_changes_rx) = NameTable::new(registry.clone());
        (
            Self {
                registry,
                names,
                rules: RuleTable::new(),
                cast_set: Mutex::new(BTreeSet::new()),
                b2b: Mutex::new(BTreeSet::new()),
                local: OnceLock::new(),
                serial: AtomicU32::new(1),
                stopping: AtomicBool::new(false),
                service_starter: Mutex::new(None),
                sessionless_tx: Mutex::new(None),
            },
            name_changes_rx,
        )
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn names(&self) -> &NameTable {
        &self.names
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// The in-process endpoint hosting the daemon's own bus objects.
    pub fn local_endpoint(&self) -> &Endpoint {
        self.local.get().expect("local endpoint not registered")
    }

    pub fn set_service_starter(&self, starter: Arc<dyn ServiceStarter>) {
        *self.service_starter.lock() = Some(starter);
    }

    pub fn set_sessionless_store(&self, tx: UnboundedSender<Arc<Message>>) {
        *self.sessionless_tx.lock() = Some(tx);
    }

    /// Mint a serial for a locally originated message.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::SeqCst);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Duplicate stops are safe.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Make an endpoint routable. Bus-to-bus endpoints join the global
    /// broadcast set; everything else appears directly on the bus.
    pub fn register_endpoint(&self, endpoint: &Endpoint) {
        self.registry.insert(endpoint.clone());
        if endpoint.ep_type() == EndpointType::Local {
            self.local
                .set(endpoint.clone())
                .expect("local endpoint registered twice");
        }
        if endpoint.is_bus_to_bus() {
            self.b2b.lock().insert(endpoint.id());
        } else {
            self.names.add_unique_name(endpoint);
        }
        self.registry.notify_changed();
    }

    pub fn unregister_endpoint(&self, endpoint: &Endpoint) {
        if endpoint.is_bus_to_bus() {
            self.b2b.lock().remove(&endpoint.id());
            let mut cast_set = self.cast_set.lock();
            cast_set.retain(|entry| entry.b2b != Some(endpoint.id()));
        } else {
            self.remove_session_routes(endpoint.unique_name(), 0);
            self.names.remove_unique_name(endpoint.unique_name());
            self.rules.remove_all(endpoint.id());
        }
        self.registry.remove(endpoint.id());
    }

    /// Resolve a name, falling back to bus-to-bus endpoints which do not
    /// appear in the name table.
    pub fn find_endpoint(&self, name: &str) -> Option<Endpoint> {
        self.names.find_endpoint(name).or_else(|| {
            let b2b = self.b2b.lock();
            b2b.iter()
                .filter_map(|id| self.registry.get(*id))
                .find(|ep| ep.unique_name() == name)
        })
    }

    pub fn b2b_endpoints(&self) -> Vec<Endpoint> {
        let ids: Vec<EndpointId> = self.b2b.lock().iter().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.registry.get(id))
            .collect()
    }

    /// Route `msg` on behalf of `sender`.
    ///
    /// No table lock is held while an endpoint push is in flight: the
    /// matching endpoints are snapshotted first, pushed to afterwards.
    pub async fn push_message(
        &self,
        mut msg: Arc<Message>,
        sender: &Endpoint,
    ) -> Result<(), RoutingError> {
        if self.is_stopping() {
            return Err(RoutingError::Stopping);
        }
        let local = self.local.get().ok_or(RoutingError::EndpointClosing)?;
        if !local.is_valid() {
            return Err(RoutingError::EndpointClosing);
        }

        // Locally originated messages get their serial minted here, before
        // any cross-endpoint push can observe it.
        if sender.id() == local.id() && msg.serial == 0 {
            Arc::make_mut(&mut msg).serial = self.next_serial();
        }

        match msg.destination.clone() {
            Some(destination) => self.push_unicast(msg, sender, &destination).await,
            None if msg.session_id == 0 => self.push_broadcast(msg, sender).await,
            None => self.push_session_cast(msg, sender).await,
        }
    }

    async fn push_unicast(
        &self,
        msg: Arc<Message>,
        sender: &Endpoint,
        destination: &str,
    ) -> Result<(), RoutingError> {
        let reply_expected = msg.reply_expected();
        let session_id = msg.session_id;
        match self.find_endpoint(destination) {
            Some(dest) => {
                if sender.is_bus_to_bus() && !dest.allow_remote_messages() {
                    debug!(
                        "blocking message from {:?} to {} (serial={}): receiver does not allow \
                         remote messages",
                        msg.sender,
                        dest.unique_name(),
                        msg.serial
                    );
                    if reply_expected {
                        self.reply_with_error(
                            &msg,
                            "org.alljoyn.Bus.Blocked",
                            &format!("Remote method calls blocked for bus name: {destination}"),
                        )
                        .await;
                    }
                    Err(RoutingError::Blocked)
                } else if dest.ep_type() == EndpointType::Virtual
                    && reply_expected
                    && !sender.allow_remote_messages()
                {
                    debug!(
                        "blocking method call from {:?} to {} (serial={}): caller does not allow \
                         remote messages",
                        msg.sender,
                        dest.unique_name(),
                        msg.serial
                    );
                    self.reply_with_error(
                        &msg,
                        "org.alljoyn.Bus.Blocked",
                        "Method reply would be blocked because caller does not allow remote \
                         messages",
                    )
                    .await;
                    Err(RoutingError::Blocked)
                } else {
                    let status = dest.push_message(msg, session_id).await;
                    if let Err(e) = status {
                        if e != RoutingError::EndpointClosing && e != RoutingError::Stopping {
                            warn!("push to {} failed: {e}", dest.unique_name());
                        }
                    }
                    status
                }
            }
            None => {
                let started = msg.flags.contains(MessageFlags::AutoStart)
                    && !sender.is_bus_to_bus()
                    && sender.ep_type() != EndpointType::Null
                    && self
                        .service_starter
                        .lock()
                        .as_ref()
                        .is_some_and(|starter| starter.start_service(destination));
                if started {
                    return Ok(());
                }
                if reply_expected {
                    // Let the sender know its call cannot be passed on.
                    self.reply_with_error(
                        &msg,
                        "org.freedesktop.DBus.Error.ServiceUnknown",
                        &format!("Unknown bus name: {destination}"),
                    )
                    .await;
                } else {
                    debug!("discarding message: no route to {destination}:{session_id}");
                }
                Err(RoutingError::NoRoute)
            }
        }
    }

    async fn push_broadcast(
        &self,
        msg: Arc<Message>,
        sender: &Endpoint,
    ) -> Result<(), RoutingError> {
        let matching = self.rules.matching_endpoints(&msg, &self.names);
        for id in matching {
            let Some(dest) = self.registry.get(id) else {
                continue;
            };
            // Silently ignored unless the message originated locally or the
            // destination opted into remote messages.
            if sender.is_bus_to_bus() && !dest.allow_remote_messages() {
                continue;
            }
            if let Err(e) = dest.push_message(msg.clone(), 0).await {
                if e != RoutingError::EndpointClosing && e != RoutingError::Stopping {
                    warn!("broadcast push to {} failed: {e}", dest.unique_name());
                }
            }
        }

        if msg.is_sessionless() {
            if !sender.is_bus_to_bus() {
                if let Some(tx) = &*self.sessionless_tx.lock() {
                    let _ = tx.send(msg.clone());
                }
            }
        } else if msg.is_global_broadcast() {
            // DetachSession travels with header id 0 so it can reach bus
            // controllers that are not session members. Selecting the
            // bus-to-bus link by the id in the body keeps it from overtaking
            // the session's last data messages on another link.
            let mut effective_id = 0;
            if msg.is_member(objects::DAEMON_IFACE, "DetachSession") {
                effective_id = msg.arg_u32(0).unwrap_or_else(|e| {
                    warn!("failed to unmarshal args for DetachSession message: {e}");
                    0
                });
            }

            for ep in self.b2b_endpoints() {
                if ep.id() == sender.id() {
                    continue;
                }
                if effective_id != 0 && ep.b2b_session_id() != effective_id {
                    continue;
                }
                if let Err(e) = ep.push_message(msg.clone(), effective_id).await {
                    if e != RoutingError::EndpointClosing && e != RoutingError::Stopping {
                        warn!("global broadcast to {} failed: {e}", ep.unique_name());
                    }
                }
            }
        }

        Ok(())
    }

    async fn push_session_cast(
        &self,
        msg: Arc<Message>,
        _sender: &Endpoint,
    ) -> Result<(), RoutingError> {
        let src = msg.sender.clone().unwrap_or_default();
        let id = msg.session_id;
        let entries: Vec<SessionCastEntry> = {
            let cast_set = self.cast_set.lock();
            cast_set
                .iter()
                .filter(|entry| entry.src == src && entry.id == id)
                .cloned()
                .collect()
        };

        let mut found_dest = false;
        let mut pushed_b2b: Vec<EndpointId> = Vec::new();
        for entry in entries {
            if let Some(b2b) = entry.b2b {
                if pushed_b2b.contains(&b2b) {
                    continue;
                }
                pushed_b2b.push(b2b);
            }
            let Some(dest) = self.registry.get(entry.dest) else {
                continue;
            };
            found_dest = true;
            if let Err(e) = dest.push_message(msg.clone(), id).await {
                if e != RoutingError::EndpointClosing && e != RoutingError::Stopping {
                    warn!("session cast to {} failed: {e}", dest.unique_name());
                }
            }
        }

        if found_dest {
            Ok(())
        } else {
            Err(RoutingError::NoRoute)
        }
    }

    /// Push a synthetic error back at the caller so its reply handler fires
    /// exactly once.
    async fn reply_with_error(&self, original: &Message, error_name: &str, description: &str) {
        let local = self.local_endpoint().clone();
        let mut error = Message::error(original, error_name, description);
        error.sender = Some(local.unique_name().to_string());
        error.serial = self.next_serial();
        if let Err(e) = Box::pin(self.push_message(Arc::new(error), &local)).await {
            debug!("failed to return {error_name} to {:?}: {e}", original.sender);
        }
    }

    /// Install the bidirectional fan-out rows for one src/dest pair of a
    /// session.
    pub fn add_session_route(
        &self,
        id: u32,
        src: &Endpoint,
        src_b2b: Option<&Endpoint>,
        dest: &Endpoint,
        dest_b2b: Option<&Endpoint>,
    ) -> Result<(), RoutingError> {
        if id == 0 {
            return Err(RoutingError::NoRoute);
        }
        if dest.ep_type() == EndpointType::Virtual {
            let b2b = dest_b2b.ok_or(RoutingError::NoRoute)?;
            if !dest.add_session_route(id, b2b) && !dest.has_route_through(b2b.id()) {
                return Err(RoutingError::EndpointClosing);
            }
        }
        if src.ep_type() == EndpointType::Virtual {
            let b2b = src_b2b.ok_or(RoutingError::NoRoute)?;
            if !src.add_session_route(id, b2b) && !src.has_route_through(b2b.id()) {
                return Err(RoutingError::EndpointClosing);
            }
        }
        if let Some(b2b) = src_b2b {
            b2b.set_b2b_session_id(id);
        }
        if let Some(b2b) = dest_b2b {
            b2b.set_b2b_session_id(id);
        }

        let mut cast_set = self.cast_set.lock();
        cast_set.insert(SessionCastEntry {
            src: src.unique_name().to_string(),
            id,
            b2b: dest_b2b.map(Endpoint::id),
            dest: dest.id(),
        });
        cast_set.insert(SessionCastEntry {
            src: dest.unique_name().to_string(),
            id,
            b2b: src_b2b.map(Endpoint::id),
            dest: src.id(),
        });
        Ok(())
    }

    /// Remove the fan-out rows for one src/dest pair.
    pub fn remove_session_route(&self, id: u32, src: &Endpoint, dest: &Endpoint) {
        if id == 0 {
            return;
        }
        let src_b2b = src.route_for_session(id);
        let dest_b2b = dest.route_for_session(id);
        if dest.ep_type() == EndpointType::Virtual {
            dest.clear_session_route(id);
        }
        if src.ep_type() == EndpointType::Virtual {
            src.clear_session_route(id);
        }
        let mut cast_set = self.cast_set.lock();
        cast_set.remove(&SessionCastEntry {
            src: src.unique_name().to_string(),
            id,
            b2b: dest_b2b.map(|ep| ep.id()),
            dest: dest.id(),
        });
        cast_set.remove(&SessionCastEntry {
            src: dest.unique_name().to_string(),
            id,
            b2b: src_b2b.map(|ep| ep.id()),
            dest: src.id(),
        });
    }

    /// Remove every fan-out row naming `src` (as source or destination) for
    /// the given session; id 0 sweeps all of its sessions.
    pub fn remove_session_routes(&self, src: &str, id: u32) {
        let src_ep = self.find_endpoint(src);
        let mut cast_set = self.cast_set.lock();
        let doomed: Vec<SessionCastEntry> = cast_set
            .iter()
            .filter(|entry| {
                (entry.id == id || id == 0)
                    && (entry.src == src
                        || src_ep.as_ref().map(Endpoint::id) == Some(entry.dest))
            })
            .cloned()
            .collect();
        for entry in doomed {
            if entry.id != 0 {
                if let Some(dest) = self.registry.get(entry.dest) {
                    if dest.ep_type() == EndpointType::Virtual {
                        dest.clear_session_route(entry.id);
                    }
                }
            }
            cast_set.remove(&entry);
        }
    }

    /// Whether any fan-out row still references the session.
    pub fn has_session_routes(&self, id: u32) -> bool {
        self.cast_set.lock().iter().any(|entry| entry.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{NameTransfer, PROTOCOL_VERSION},
        endpoint::B2bInfo,
        guid::Guid,
    };

    fn router() -> Router {
        let registry = Registry::new();
        let (router, _rx) = Router::new(registry);
        let local = Endpoint::new_local(router.registry().mint_id(), ":local.1");
        router.register_endpoint(&local);
        router
    }

    fn null_ep(router: &Router, name: &str) -> Endpoint {
        let ep = Endpoint::new_null(router.registry().mint_id(), name, true);
        router.register_endpoint(&ep);
        ep
    }

    fn b2b_ep(router: &Router, name: &str) -> Endpoint {
        let guid = Guid::generate();
        let ep = Endpoint::new_remote(
            router.registry().mint_id(),
            name,
            true,
            PROTOCOL_VERSION,
            None,
            None,
            Some(B2bInfo {
                remote_guid: guid,
                remote_protocol_version: PROTOCOL_VERSION,
                name_transfer: NameTransfer::AllNames,
            }),
        );
        router.register_endpoint(&ep);
        ep
    }

    fn signal_from(sender: &Endpoint) -> Arc<Message> {
        let mut msg = Message::signal("/", "org.test", "Tick", vec![]);
        msg.sender = Some(sender.unique_name().to_string());
        msg.serial = 7;
        Arc::new(msg)
    }

    #[tokio::test]
    async fn unicast_reaches_destination() {
        let router = router();
        let a = null_ep(&router, ":local.2");
        let b = null_ep(&router, ":local.3");
        let msg = Arc::new(
            Message::signal("/", "org.test", "Tick", vec![]).with_destination(b.unique_name()),
        );
        router.push_message(msg, &a).await.unwrap();
        assert_eq!(b.next_outbound().await.unwrap().member.as_deref(), Some("Tick"));
    }

    #[tokio::test]
    async fn unknown_destination_returns_service_unknown_error() {
        let router = router();
        let a = null_ep(&router, ":local.2");
        let mut call = Message::method_call(":local.9", "/", "org.test", "Frob", vec![]);
        call.sender = Some(a.unique_name().to_string());
        call.serial = 11;
        let status = router.push_message(Arc::new(call), &a).await;
        assert_eq!(status, Err(RoutingError::NoRoute));

        // The caller's reply handler must fire: a synthetic error came back.
        let reply = a.next_outbound().await.unwrap();
        assert_eq!(
            reply.error_name.as_deref(),
            Some("org.freedesktop.DBus.Error.ServiceUnknown")
        );
        assert_eq!(reply.reply_serial, Some(11));
    }

    #[tokio::test]
    async fn remote_sender_blocked_by_policy() {
        let router = router();
        let b2b = b2b_ep(&router, ":remote-link.1");
        let shy = Endpoint::new_null(router.registry().mint_id(), ":local.4", false);
        router.register_endpoint(&shy);

        let mut msg = Message::signal("/", "org.test", "Tick", vec![]);
        msg.destination = Some(":local.4".to_string());
        msg.sender = Some(":far.2".to_string());
        let status = router.push_message(Arc::new(msg), &b2b).await;
        assert_eq!(status, Err(RoutingError::Blocked));
        assert!(shy.tx_is_empty());
    }

    #[tokio::test]
    async fn session_cast_delivers_once_per_link() {
        let router = router();
        let a = null_ep(&router, ":local.2");
        let b = null_ep(&router, ":local.3");
        let link = b2b_ep(&router, ":link.1");
        let far = Endpoint::new_virtual(router.registry().mint_id(), ":far.2");
        let far2 = Endpoint::new_virtual(router.registry().mint_id(), ":far.3");
        router.registry().insert(far.clone());
        router.registry().insert(far2.clone());

        let id = 99;
        router.add_session_route(id, &a, None, &b, None).unwrap();
        router
            .add_session_route(id, &a, None, &far, Some(&link))
            .unwrap();
        router
            .add_session_route(id, &a, None, &far2, Some(&link))
            .unwrap();

        let msg = Arc::new(
            Message::signal("/", "org.test", "Tick", vec![])
                .with_session_id(id),
        );
        let mut msg = msg;
        Arc::make_mut(&mut msg).sender = Some(a.unique_name().to_string());
        router.push_message(msg, &a).await.unwrap();

        // Local member got it; the shared link carried exactly one copy.
        assert!(!b.tx_is_empty());
        assert_eq!(link.next_outbound().await.unwrap().session_id, id);
        assert!(link.tx_is_empty());
    }

    #[tokio::test]
    async fn session_cast_without_entries_is_no_route() {
        let router = router();
        let a = null_ep(&router, ":local.2");
        let mut msg = Message::signal("/", "org.test", "Tick", vec![]).with_session_id(1234);
        msg.sender = Some(a.unique_name().to_string());
        assert_eq!(
            router.push_message(Arc::new(msg), &a).await,
            Err(RoutingError::NoRoute)
        );
    }

    #[tokio::test]
    async fn detach_session_picks_link_by_body_id() {
        let router = router();
        let link_a = b2b_ep(&router, ":link.1");
        let link_b = b2b_ep(&router, ":link.2");
        link_a.set_b2b_session_id(77);
        link_b.set_b2b_session_id(99);

        let mut detach = Message::signal(
            objects::DAEMON_PATH,
            objects::DAEMON_IFACE,
            "DetachSession",
            vec![crate::codec::Arg::U32(99), crate::codec::Arg::Str(":x.2".into())],
        );
        detach.flags |= MessageFlags::GlobalBroadcast;
        detach.sender = Some(":local.1".to_string());
        let local = router.local_endpoint().clone();
        router.push_message(Arc::new(detach), &local).await.unwrap();

        assert!(link_a.tx_is_empty());
        assert_eq!(
            link_b.next_outbound().await.unwrap().member.as_deref(),
            Some("DetachSession")
        );
    }

    #[tokio::test]
    async fn broadcast_delivered_once_per_subscriber() {
        let router = router();
        let a = null_ep(&router, ":local.2");
        let b = null_ep(&router, ":local.3");
        router
            .rules()
            .add(b.id(), "interface='org.test'".parse().unwrap());
        router.rules().add(b.id(), "member='Tick'".parse().unwrap());

        router.push_message(signal_from(&a), &a).await.unwrap();
        assert!(b.next_outbound().await.is_some());
        assert!(b.tx_is_empty());
    }

    #[tokio::test]
    async fn stopped_router_rejects_pushes() {
        let router = router();
        let a = null_ep(&router, ":local.2");
        router.stop();
        router.stop();
        assert_eq!(
            router.push_message(signal_from(&a), &a).await,
            Err(RoutingError::Stopping)
        );
    }
}
