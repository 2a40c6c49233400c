//! In-process attachments: the handle behind every null endpoint.
//!
//! A bundled client talks to its router directly, no socket involved. The
//! attachment pumps its endpoint's queue, answers AcceptSession callbacks,
//! and matches replies to outstanding calls by serial.

use std::{
    collections::HashMap,
    os::fd::OwnedFd,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use enumflags2::BitFlags;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{
    bus::BusState,
    codec::{Arg, Message, MessageType, SessionOpts, TransportMask},
    endpoint::Endpoint,
    name_table::NameFlag,
    objects,
    router::RoutingError,
    sessions::JoinReply,
};

const CALL_TIMEOUT: Duration = Duration::from_secs(35);

/// JoinSession may ride out a 30 s endpoint wait per hop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(120);

type AcceptHook = Box<dyn FnMut(u16, u32, &str) -> bool + Send>;

pub struct Attachment {
    bus: Arc<BusState>,
    endpoint: Endpoint,
    serial: Arc<AtomicU32>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Message>>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Message>>>,
    accept_hook: Arc<Mutex<Option<AcceptHook>>>,
}

impl Attachment {
    pub(crate) fn new(bus: Arc<BusState>, endpoint: Endpoint) -> Self {
        let serial = Arc::new(AtomicU32::new(1));
        let pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Message>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let accept_hook: Arc<Mutex<Option<AcceptHook>>> = Arc::new(Mutex::new(None));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let pump_bus = bus.clone();
        let pump_ep = endpoint.clone();
        let pump_serial = serial.clone();
        let pump_pending = pending.clone();
        let pump_hook = accept_hook.clone();
        tokio::spawn(async move {
            while let Some(msg) = pump_ep.next_outbound().await {
                match msg.ty {
                    MessageType::MethodReturn | MessageType::Error => {
                        let waiter = msg
                            .reply_serial
                            .and_then(|serial| pump_pending.lock().remove(&serial));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send((*msg).clone());
                            }
                            None => {
                                let _ = incoming_tx.send(msg);
                            }
                        }
                    }
                    MessageType::MethodCall
                        if msg.is_member(objects::PEER_SESSION_IFACE, "AcceptSession") =>
                    {
                        let accept = match (
                            msg.arg_u16(0),
                            msg.arg_u32(1),
                            msg.arg_str(2),
                        ) {
                            (Ok(port), Ok(id), Ok(joiner)) => {
                                let mut hook = pump_hook.lock();
                                match hook.as_mut() {
                                    Some(hook) => hook(port, id, joiner),
                                    None => true,
                                }
                            }
                            _ => false,
                        };
                        let mut reply = Message::method_return(&msg, vec![Arg::Bool(accept)]);
                        reply.sender = Some(pump_ep.unique_name().to_string());
                        reply.serial = pump_serial.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = pump_bus
                            .router()
                            .push_message(Arc::new(reply), &pump_ep)
                            .await
                        {
                            debug!("AcceptSession reply failed: {e}");
                        }
                    }
                    _ => {
                        let _ = incoming_tx.send(msg);
                    }
                }
            }
            pump_bus.notify_endpoint_exit(&pump_ep);
        });

        Self {
            bus,
            endpoint,
            serial,
            pending,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            accept_hook,
        }
    }

    pub fn unique_name(&self) -> &str {
        self.endpoint.unique_name()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Decide future AcceptSession callbacks; without a hook every joiner
    /// is let in.
    pub fn set_accept_hook(&self, hook: impl FnMut(u16, u32, &str) -> bool + Send + 'static) {
        *self.accept_hook.lock() = Some(Box::new(hook));
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::SeqCst)
    }

    fn stamp(&self, msg: &mut Message) {
        msg.sender = Some(self.unique_name().to_string());
        if msg.serial == 0 {
            msg.serial = self.next_serial();
        }
    }

    /// Route a message into the bus as this attachment.
    pub async fn send(&self, mut msg: Message) -> Result<(), RoutingError> {
        self.stamp(&mut msg);
        self.bus
            .router()
            .push_message(Arc::new(msg), &self.endpoint)
            .await
    }

    /// Signal into a session: empty destination, non-zero session id.
    pub async fn send_session_signal(
        &self,
        session_id: u32,
        interface: &str,
        member: &str,
        args: Vec<Arg>,
    ) -> Result<(), RoutingError> {
        self.send(Message::signal("/", interface, member, args).with_session_id(session_id))
            .await
    }

    pub async fn call(&self, msg: Message) -> Option<Message> {
        self.call_with_timeout(msg, CALL_TIMEOUT).await
    }

    async fn call_with_timeout(&self, mut msg: Message, max_wait: Duration) -> Option<Message> {
        self.stamp(&mut msg);
        let serial = msg.serial;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(serial, tx);
        if let Err(e) = self
            .bus
            .router()
            .push_message(Arc::new(msg), &self.endpoint)
            .await
        {
            debug!("call failed to route: {e}");
            self.pending.lock().remove(&serial);
            return None;
        }
        match tokio::time::timeout(max_wait, rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => {
                self.pending.lock().remove(&serial);
                None
            }
        }
    }

    async fn bus_call(&self, member: &str, args: Vec<Arg>) -> Option<Message> {
        self.call(Message::method_call(
            objects::BUS_NAME,
            objects::BUS_PATH,
            objects::BUS_IFACE,
            member,
            args,
        ))
        .await
    }

    /// Next signal or stray message delivered to this attachment.
    pub async fn next_message(&self, max_wait: Duration) -> Option<Arc<Message>> {
        let mut incoming = self.incoming.lock().await;
        tokio::time::timeout(max_wait, incoming.recv()).await.ok()?
    }

    //
    // org.freedesktop.DBus conveniences.
    //

    pub async fn request_name(&self, name: &str, flags: BitFlags<NameFlag>) -> u32 {
        let reply = self
            .call(Message::method_call(
                objects::DBUS_NAME,
                objects::DBUS_PATH,
                objects::DBUS_IFACE,
                "RequestName",
                vec![Arg::Str(name.to_string()), Arg::U32(flags.bits().into())],
            ))
            .await;
        reply.and_then(|r| r.arg_u32(0).ok()).unwrap_or(0)
    }

    pub async fn add_match(&self, rule: &str) -> bool {
        self.call(Message::method_call(
            objects::DBUS_NAME,
            objects::DBUS_PATH,
            objects::DBUS_IFACE,
            "AddMatch",
            vec![Arg::Str(rule.to_string())],
        ))
        .await
        .map_or(false, |reply| reply.ty == MessageType::MethodReturn)
    }

    //
    // org.alljoyn.Bus conveniences.
    //

    /// Returns `(reply code, bound port)`.
    pub async fn bind_session_port(&self, port: u16, opts: SessionOpts) -> (u32, u16) {
        match self
            .bus_call(
                "BindSessionPort",
                vec![Arg::U16(port), Arg::SessionOpts(opts)],
            )
            .await
        {
            Some(reply) => (
                reply.arg_u32(0).unwrap_or(0),
                reply.arg_u16(1).unwrap_or(0),
            ),
            None => (0, 0),
        }
    }

    pub async fn unbind_session_port(&self, port: u16) -> u32 {
        self.bus_call("UnbindSessionPort", vec![Arg::U16(port)])
            .await
            .and_then(|reply| reply.arg_u32(0).ok())
            .unwrap_or(0)
    }

    pub async fn join_session(
        &self,
        host: &str,
        port: u16,
        opts: SessionOpts,
    ) -> (JoinReply, u32, SessionOpts) {
        let reply = self
            .call_with_timeout(
                Message::method_call(
                    objects::BUS_NAME,
                    objects::BUS_PATH,
                    objects::BUS_IFACE,
                    "JoinSession",
                    vec![
                        Arg::Str(host.to_string()),
                        Arg::U16(port),
                        Arg::SessionOpts(opts),
                    ],
                ),
                JOIN_TIMEOUT,
            )
            .await;
        match reply {
            Some(reply) if reply.ty == MessageType::MethodReturn => (
                JoinReply::from_code(reply.arg_u32(0).unwrap_or(JoinReply::Failed as u32)),
                reply.arg_u32(1).unwrap_or(0),
                reply.arg_session_opts(2).unwrap_or(opts),
            ),
            _ => (JoinReply::Failed, 0, opts),
        }
    }

    pub async fn leave_session(&self, id: u32) -> u32 {
        self.bus_call("LeaveSession", vec![Arg::U32(id)])
            .await
            .and_then(|reply| reply.arg_u32(0).ok())
            .unwrap_or(0)
    }

    pub async fn remove_session_member(&self, id: u32, member: &str) -> u32 {
        self.bus_call(
            "RemoveSessionMember",
            vec![Arg::U32(id), Arg::Str(member.to_string())],
        )
        .await
        .and_then(|reply| reply.arg_u32(0).ok())
        .unwrap_or(0)
    }

    pub async fn set_link_timeout(&self, id: u32, secs: u32) -> (u32, u32) {
        match self
            .bus_call("SetLinkTimeout", vec![Arg::U32(id), Arg::U32(secs)])
            .await
        {
            Some(reply) => (
                reply.arg_u32(0).unwrap_or(0),
                reply.arg_u32(1).unwrap_or(0),
            ),
            None => (0, 0),
        }
    }

    pub async fn advertise_name(&self, name: &str, transports: BitFlags<TransportMask>) -> u32 {
        self.bus_call(
            "AdvertiseName",
            vec![Arg::Str(name.to_string()), Arg::U16(transports.bits())],
        )
        .await
        .and_then(|reply| reply.arg_u32(0).ok())
        .unwrap_or(0)
    }

    pub async fn cancel_advertise_name(
        &self,
        name: &str,
        transports: BitFlags<TransportMask>,
    ) -> u32 {
        self.bus_call(
            "CancelAdvertiseName",
            vec![Arg::Str(name.to_string()), Arg::U16(transports.bits())],
        )
        .await
        .and_then(|reply| reply.arg_u32(0).ok())
        .unwrap_or(0)
    }

    pub async fn find_advertised_name(&self, prefix: &str) -> u32 {
        self.bus_call("FindAdvertisedName", vec![Arg::Str(prefix.to_string())])
            .await
            .and_then(|reply| reply.arg_u32(0).ok())
            .unwrap_or(0)
    }

    pub async fn cancel_find_advertised_name(&self, prefix: &str) -> u32 {
        self.bus_call(
            "CancelFindAdvertisedName",
            vec![Arg::Str(prefix.to_string())],
        )
        .await
        .and_then(|reply| reply.arg_u32(0).ok())
        .unwrap_or(0)
    }

    /// Claim the raw socket of a session this attachment participates in.
    /// The descriptor is handed over in-process; it cannot ride the wire.
    pub fn take_session_fd(&self, id: u32) -> Option<OwnedFd> {
        self.bus.sessions().take_session_fd(self.unique_name(), id)
    }

    /// Detach from the bus. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.endpoint.stop();
    }
}
