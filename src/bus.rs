//! The bus: listener/authenticator, owner of every connection's I/O tasks,
//! and the glue between the router, the session manager, the listen machine
//! and the name service.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use enumflags2::BitFlags;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, trace, warn};

use crate::{
    attachment::Attachment,
    auth::{self, AuthEngine, HelloFrame, WelcomeFrame},
    codec::{
        self, Arg, Message, MessageFlags, MessageType, NameTransfer, SessionOpts, TransportMask,
    },
    config::Config,
    endpoint::{
        Advice, B2bInfo, DisconnectReason, Endpoint, EndpointId, EndpointType, Registry,
    },
    guid::Guid,
    listen::{BusAddr, ListenHandle, ListenMachine},
    name_service::{FoundNames, IpNameService},
    name_table::NameOwnerChanged,
    objects,
    propagation,
    router::Router,
    sessions::{JoinReply, SessionLostReason, SessionManager},
};

/// How long the daemon waits on its own method calls (AcceptSession,
/// AttachSession, GetSessionInfo).
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for outbound bus-to-bus links.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the retained sessionless-signal backlog.
const SESSIONLESS_BACKLOG: usize = 50;

enum BusEvent {
    EndpointExited(Endpoint),
}

struct EndpointIo {
    rx: JoinHandle<Option<OwnedReadHalf>>,
    tx: JoinHandle<Option<OwnedWriteHalf>>,
    keepalive: JoinHandle<()>,
    rx_stop: Arc<Notify>,
}

/// Shared state behind every daemon task.
pub struct BusState {
    guid: Guid,
    config: Config,
    router: Router,
    sessions: SessionManager,
    listen: ListenHandle,
    name_service: Arc<dyn IpNameService>,
    auth_engine: Arc<dyn AuthEngine>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    io_tasks: Mutex<HashMap<EndpointId, EndpointIo>>,
    events_tx: mpsc::UnboundedSender<BusEvent>,
    setup_permits: Arc<Semaphore>,
    next_name_index: AtomicU64,
    incomplete_auths: AtomicUsize,
    untrusted_clients: AtomicUsize,
    sessionless_backlog: Mutex<VecDeque<Arc<Message>>>,
}

/// The daemon. Owns the event loops; everything else reaches the shared
/// [`BusState`].
pub struct Bus {
    state: Arc<BusState>,
    accepted_rx: mpsc::Receiver<TcpStream>,
    events_rx: mpsc::UnboundedReceiver<BusEvent>,
    name_changes_rx: mpsc::UnboundedReceiver<NameOwnerChanged>,
    ns_events_rx: mpsc::UnboundedReceiver<FoundNames>,
}

impl Bus {
    pub fn new(config: Config, name_service: Arc<dyn IpNameService>) -> Result<Self> {
        Self::with_auth_engine(config, name_service, Arc::new(auth::Anonymous))
    }

    pub fn with_auth_engine(
        config: Config,
        name_service: Arc<dyn IpNameService>,
        auth_engine: Arc<dyn AuthEngine>,
    ) -> Result<Self> {
        let guid = Guid::generate();
        let registry = Registry::new();
        let (router, name_changes_rx) = Router::new(registry);
        let sessions = SessionManager::new(guid.clone());

        let (accepted_tx, accepted_rx) = mpsc::channel(8);
        let (listen, listen_machine) = ListenMachine::new(
            guid.as_str().to_string(),
            config
                .router_advertisement
                .as_ref()
                .map(|name| format!("{name}.{}", guid.short())),
            config.max_untrusted_clients,
            name_service.clone(),
            accepted_tx,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ns_events_tx, ns_events_rx) = mpsc::unbounded_channel();
        name_service.set_callback(ns_events_tx);

        let setup_permits = Arc::new(Semaphore::new(config.max_concurrent_session_setups));
        let state = Arc::new(BusState {
            router,
            sessions,
            listen,
            name_service,
            auth_engine,
            pending: Mutex::new(HashMap::new()),
            io_tasks: Mutex::new(HashMap::new()),
            events_tx,
            setup_permits,
            next_name_index: AtomicU64::new(2),
            incomplete_auths: AtomicUsize::new(0),
            untrusted_clients: AtomicUsize::new(0),
            sessionless_backlog: Mutex::new(VecDeque::new()),
            config,
            guid,
        });

        // The controller endpoint: index 1, owner of the well-known bus
        // objects, subscribed to the daemon signals.
        let local = Endpoint::new_local(
            state.router.registry().mint_id(),
            state.controller_name(),
        );
        state.router.register_endpoint(&local);
        for name in [objects::DBUS_NAME, objects::BUS_NAME, objects::DAEMON_NAME] {
            state
                .router
                .names()
                .request_name(name, &state.controller_name(), BitFlags::empty());
        }
        state.router.rules().add(
            local.id(),
            "type='signal',interface='org.alljoyn.Daemon'"
                .parse()
                .expect("static rule"),
        );

        // Sessionless signals from local senders land in a bounded backlog.
        let (sessionless_tx, mut sessionless_rx) = mpsc::unbounded_channel();
        state.router.set_sessionless_store(sessionless_tx);
        let backlog_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = sessionless_rx.recv().await {
                let mut backlog = backlog_state.sessionless_backlog.lock();
                if backlog.len() == SESSIONLESS_BACKLOG {
                    backlog.pop_front();
                }
                backlog.push_back(msg);
            }
        });

        tokio::spawn(listen_machine.run());
        tokio::spawn(Self::control_loop(state.clone(), local));

        // No untrusted clients yet, so the quiet router advertisement may
        // go up as soon as a listen address arrives.
        let listen_init = state.listen.clone();
        tokio::spawn(async move {
            listen_init.set_untrusted_client_count(0).await;
        });

        Ok(Self {
            state,
            accepted_rx,
            events_rx,
            name_changes_rx,
            ns_events_rx,
        })
    }

    pub fn state(&self) -> &Arc<BusState> {
        &self.state
    }

    /// Everything delivered to the controller endpoint goes through the
    /// well-known objects.
    async fn control_loop(state: Arc<BusState>, local: Endpoint) {
        while let Some(msg) = local.next_outbound().await {
            objects::dispatch(&state, msg).await;
        }
        debug!("controller endpoint drained");
    }

    /// The daemon's event loop. Runs until the router is stopped and every
    /// source drains.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.accepted_rx.recv() => match accepted {
                    Some(stream) => self.state.clone().handle_accepted(stream),
                    None => break,
                },
                event = self.events_rx.recv() => match event {
                    Some(BusEvent::EndpointExited(ep)) => {
                        self.state.handle_endpoint_exit(&ep).await;
                    }
                    None => break,
                },
                change = self.name_changes_rx.recv() => match change {
                    Some(change) => self.state.handle_name_change(&change).await,
                    None => break,
                },
                found = self.ns_events_rx.recv() => match found {
                    Some(found) => {
                        self.state
                            .sessions
                            .found_names(
                                &self.state,
                                &found.bus_addr,
                                &found.guid,
                                found.transports,
                                &found.names,
                                found.ttl,
                            )
                            .await;
                    }
                    None => break,
                },
            }
            if self.state.router.is_stopping() {
                break;
            }
        }
        Ok(())
    }

    /// Duplicate stops are safe.
    pub async fn stop(&self) {
        self.state.router.stop();
        for ep in self.state.router.registry().snapshot() {
            ep.stop();
        }
        let tasks: Vec<EndpointIo> = {
            let mut io_tasks = self.state.io_tasks.lock();
            io_tasks.drain().map(|(_, io)| io).collect()
        };
        join_all(tasks.into_iter().map(|io| async move {
            io.keepalive.abort();
            io.rx_stop.notify_waiters();
            let _ = io.tx.await;
            let _ = io.rx.await;
        }))
        .await;
        info!("bus stopped");
    }
}

impl BusState {
    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn listen(&self) -> &ListenHandle {
        &self.listen
    }

    pub fn name_service(&self) -> &Arc<dyn IpNameService> {
        &self.name_service
    }

    pub fn controller_name(&self) -> String {
        format!(":{}.1", self.guid.short())
    }

    pub fn mint_unique_name(&self) -> String {
        format!(
            ":{}.{}",
            self.guid.short(),
            self.next_name_index.fetch_add(1, Ordering::SeqCst)
        )
    }

    /// Connect specs a peer can currently reach this router at.
    pub fn listen_specs(&self) -> Vec<String> {
        self.listen.listen_specs()
    }

    /// One slot of the bounded join/attach setup concurrency. `None` only
    /// while shutting down.
    pub async fn acquire_setup_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.setup_permits.clone().acquire_owned().await.ok()
    }

    pub fn sessionless_backlog_len(&self) -> usize {
        self.sessionless_backlog.lock().len()
    }

    //
    // In-process attachments (the null endpoints).
    //

    pub fn attach(self: &Arc<Self>, allow_remote: bool) -> Attachment {
        let ep = Endpoint::new_null(
            self.router.registry().mint_id(),
            self.mint_unique_name(),
            allow_remote,
        );
        self.router.register_endpoint(&ep);
        Attachment::new(self.clone(), ep)
    }

    pub(crate) fn notify_endpoint_exit(&self, ep: &Endpoint) {
        if ep.mark_exited() {
            let _ = self.events_tx.send(BusEvent::EndpointExited(ep.clone()));
        }
    }

    //
    // Message plumbing on behalf of the controller.
    //

    fn stamp(&self, msg: &mut Message) {
        if msg.sender.is_none() {
            msg.sender = Some(self.controller_name());
        }
        if msg.serial == 0 {
            msg.serial = self.router.next_serial();
        }
    }

    /// Route a message out of the controller.
    pub async fn send_from_controller(&self, mut msg: Message) {
        self.stamp(&mut msg);
        let local = self.router.local_endpoint().clone();
        if let Err(e) = self.router.push_message(Arc::new(msg), &local).await {
            debug!("controller send failed: {e}");
        }
    }

    /// Push a message straight onto a specific endpoint, bypassing routing.
    pub async fn send_over(&self, ep: &Endpoint, mut msg: Message) {
        self.stamp(&mut msg);
        let session_id = msg.session_id;
        if let Err(e) = ep.push_message(Arc::new(msg), session_id).await {
            debug!("direct send over {} failed: {e}", ep.unique_name());
        }
    }

    /// Method call from the controller, routed by destination.
    pub async fn call(&self, mut msg: Message) -> Option<Message> {
        self.stamp(&mut msg);
        let serial = msg.serial;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(serial, tx);
        let local = self.router.local_endpoint().clone();
        if let Err(e) = self.router.push_message(Arc::new(msg), &local).await {
            debug!("controller call failed to route: {e}");
            self.pending.lock().remove(&serial);
            return None;
        }
        self.await_reply(serial, rx).await
    }

    /// Method call pushed over a specific bus-to-bus link.
    pub async fn call_over(&self, ep: &Endpoint, mut msg: Message) -> Option<Message> {
        self.stamp(&mut msg);
        let serial = msg.serial;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(serial, tx);
        let session_id = msg.session_id;
        if let Err(e) = ep.push_message(Arc::new(msg), session_id).await {
            debug!("call over {} failed: {e}", ep.unique_name());
            self.pending.lock().remove(&serial);
            return None;
        }
        self.await_reply(serial, rx).await
    }

    async fn await_reply(&self, serial: u32, rx: oneshot::Receiver<Message>) -> Option<Message> {
        match timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => {
                self.pending.lock().remove(&serial);
                None
            }
        }
    }

    /// Resolve a reply delivered to the controller.
    pub fn dispatch_reply(&self, msg: Arc<Message>) {
        let Some(serial) = msg.reply_serial else {
            return;
        };
        match self.pending.lock().remove(&serial) {
            Some(tx) => {
                let _ = tx.send((*msg).clone());
            }
            None => debug!("reply serial {serial} matches no outstanding call"),
        }
    }

    //
    // Daemon-originated calls and signals.
    //

    /// Ask the binder whether the joiner may come in.
    pub async fn accept_session(
        &self,
        binder: &str,
        port: u16,
        id: u32,
        joiner: &str,
        opts: &SessionOpts,
    ) -> bool {
        let msg = Message::method_call(
            binder,
            objects::BUS_PATH,
            objects::PEER_SESSION_IFACE,
            "AcceptSession",
            vec![
                Arg::U16(port),
                Arg::U32(id),
                Arg::Str(joiner.to_string()),
                Arg::SessionOpts(*opts),
            ],
        );
        match self.call(msg).await {
            Some(reply) if reply.ty == MessageType::MethodReturn => {
                reply.args.first().and_then(Arg::as_bool).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// The daemon-to-daemon AttachSession method.
    pub async fn send_attach_session(
        &self,
        b2b: &Endpoint,
        port: u16,
        joiner: &str,
        host: &str,
        dest: &str,
        host_bus_addr: &str,
        opts: &SessionOpts,
    ) -> (JoinReply, u32, SessionOpts, Vec<String>) {
        let Some(remote_guid) = b2b.remote_guid() else {
            return (JoinReply::Failed, 0, *opts, Vec::new());
        };
        let msg = Message::method_call(
            format!(":{}.1", remote_guid.short()),
            objects::DAEMON_PATH,
            objects::DAEMON_IFACE,
            "AttachSession",
            vec![
                Arg::U16(port),
                Arg::Str(joiner.to_string()),
                Arg::Str(host.to_string()),
                Arg::Str(dest.to_string()),
                Arg::Str(b2b.unique_name().to_string()),
                Arg::Str(host_bus_addr.to_string()),
                Arg::SessionOpts(*opts),
            ],
        );
        let Some(reply) = self.call_over(b2b, msg).await else {
            return (JoinReply::Failed, 0, *opts, Vec::new());
        };
        if reply.ty != MessageType::MethodReturn {
            return (JoinReply::Failed, 0, *opts, Vec::new());
        }
        let code = reply.arg_u32(0).unwrap_or(JoinReply::Failed as u32);
        let id = reply.arg_u32(1).unwrap_or(0);
        let opts_out = reply.arg_session_opts(2).unwrap_or(*opts);
        let members = reply
            .args
            .get(3)
            .and_then(Arg::as_str_array)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        (JoinReply::from_code(code), id, opts_out, members)
    }

    /// Ask the remote router hosting `host` where it can be connected.
    pub async fn get_session_info_remote(&self, host: &str, port: u16) -> Vec<String> {
        let Some(short) = Guid::short_from_unique_name(host) else {
            return Vec::new();
        };
        let msg = Message::method_call(
            format!(":{short}.1"),
            objects::DAEMON_PATH,
            objects::DAEMON_IFACE,
            "GetSessionInfo",
            vec![Arg::Str(host.to_string()), Arg::U16(port)],
        );
        match self.call(msg).await {
            Some(reply) if reply.ty == MessageType::MethodReturn => reply
                .args
                .first()
                .and_then(Arg::as_str_array)
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Global-broadcast DetachSession; the session id rides in the body so
    /// the router can pick the link that still carries the session's data.
    pub async fn send_detach_session(&self, id: u32, member: &str) {
        let msg = Message::signal(
            objects::DAEMON_PATH,
            objects::DAEMON_IFACE,
            "DetachSession",
            vec![Arg::U32(id), Arg::Str(member.to_string())],
        )
        .with_flags(MessageFlags::GlobalBroadcast.into());
        self.send_from_controller(msg).await;
    }

    pub async fn send_session_lost(&self, dest: &str, id: u32, reason: SessionLostReason) {
        let legacy = self
            .router
            .find_endpoint(dest)
            .and_then(|ep| ep.remote_protocol_version())
            .map_or(false, |version| {
                version < crate::sessions::PROTOCOL_VERSION_REASONS
            });
        let msg = if legacy {
            Message::signal(
                objects::BUS_PATH,
                objects::BUS_IFACE,
                "SessionLost",
                vec![Arg::U32(id)],
            )
        } else {
            Message::signal(
                objects::BUS_PATH,
                objects::BUS_IFACE,
                "SessionLostWithReason",
                vec![Arg::U32(id), Arg::U32(reason as u32)],
            )
        };
        self.send_from_controller(msg.with_destination(dest)).await;
    }

    pub async fn send_mp_session_changed(&self, dest: &str, id: u32, member: &str, is_add: bool) {
        let msg = Message::signal(
            objects::BUS_PATH,
            objects::BUS_IFACE,
            "MPSessionChanged",
            vec![
                Arg::U32(id),
                Arg::Str(member.to_string()),
                Arg::Bool(is_add),
            ],
        );
        self.send_from_controller(msg.with_destination(dest)).await;
    }

    pub async fn send_session_joined(&self, binder: &str, port: u16, id: u32, joiner: &str) {
        let msg = Message::signal(
            objects::BUS_PATH,
            objects::BUS_IFACE,
            "SessionJoined",
            vec![Arg::U16(port), Arg::U32(id), Arg::Str(joiner.to_string())],
        );
        self.send_from_controller(msg.with_destination(binder)).await;
    }

    pub async fn send_found_advertised_name(
        &self,
        dest: &str,
        name: &str,
        transports: BitFlags<TransportMask>,
        prefix: &str,
        found: bool,
    ) {
        let member = if found {
            "FoundAdvertisedName"
        } else {
            "LostAdvertisedName"
        };
        let msg = Message::signal(
            objects::BUS_PATH,
            objects::BUS_IFACE,
            member,
            vec![
                Arg::Str(name.to_string()),
                Arg::U16(transports.bits()),
                Arg::Str(prefix.to_string()),
            ],
        );
        self.send_from_controller(msg.with_destination(dest)).await;
    }

    //
    // Inbound connection lifecycle.
    //

    fn handle_accepted(self: Arc<Self>, stream: TcpStream) {
        // DoS posture: over-limit accepts are refused by immediate
        // shutdown, slow authenticators are aborted.
        let connections = self.router.b2b_endpoints().len()
            + self.untrusted_clients.load(Ordering::SeqCst)
            + self.incomplete_auths.load(Ordering::SeqCst);
        if connections >= self.config.max_connections
            || self.incomplete_auths.load(Ordering::SeqCst)
                >= self.config.max_incomplete_connections
        {
            warn!("connection refused: at capacity");
            drop(stream);
            return;
        }
        self.incomplete_auths.fetch_add(1, Ordering::SeqCst);
        let state = self.clone();
        tokio::spawn(async move {
            let auth_timeout = state.config.auth_timeout;
            let result = timeout(auth_timeout, state.authenticate_inbound(stream)).await;
            state.incomplete_auths.fetch_sub(1, Ordering::SeqCst);
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("authentication failed: {e:#}"),
                Err(_) => debug!("authentication aborted after {auth_timeout:?}"),
            }
        });
    }

    async fn authenticate_inbound(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        let hello = auth::read_hello(&mut stream).await?;
        self.auth_engine.verify(&hello)?;

        let unique_name = self.mint_unique_name();
        let name_transfer = hello.negotiated_name_transfer();
        auth::send_welcome(
            &mut stream,
            &WelcomeFrame {
                guid: self.guid.clone(),
                unique_name: unique_name.clone(),
                protocol_version: codec::PROTOCOL_VERSION,
                name_transfer,
            },
        )
        .await?;

        let b2b = if hello.bus_to_bus {
            let remote_guid = hello
                .guid
                .clone()
                .ok_or_else(|| anyhow!("bus-to-bus hello without a GUID"))?;
            Some(B2bInfo {
                remote_guid,
                remote_protocol_version: hello.protocol_version,
                name_transfer,
            })
        } else {
            None
        };
        let is_b2b = b2b.is_some();

        let ep = Endpoint::new_remote(
            self.router.registry().mint_id(),
            unique_name,
            hello.allow_remote,
            hello.protocol_version,
            local_addr,
            peer_addr,
            b2b,
        );
        self.router.register_endpoint(&ep);
        self.start_io(&ep, stream);
        debug!("accepted {} ({:?})", ep.unique_name(), ep.ep_type());

        if is_b2b {
            propagation::exchange_names_with(self, &ep).await;
            self.arm_session_setup_watchdog(&ep);
        } else {
            let count = self.untrusted_clients.fetch_add(1, Ordering::SeqCst) + 1;
            self.listen.set_untrusted_client_count(count).await;
        }
        Ok(())
    }

    /// A bus-to-bus endpoint that never becomes part of a session (and
    /// carries no names) is a resource leak; scavenge it.
    fn arm_session_setup_watchdog(self: &Arc<Self>, ep: &Endpoint) {
        let state = self.clone();
        let ep = ep.clone();
        tokio::spawn(async move {
            tokio::time::sleep(state.config.session_setup_timeout).await;
            if !ep.is_valid() {
                return;
            }
            if ep.b2b_session_id() != 0 {
                return;
            }
            let carries_names = state
                .router
                .registry()
                .snapshot()
                .iter()
                .any(|other| other.has_route_through(ep.id()));
            if carries_names {
                return;
            }
            warn!(
                "{}: no session control within {:?}; tearing down",
                ep.unique_name(),
                state.config.session_setup_timeout
            );
            ep.set_disconnect_reason(DisconnectReason::Clean);
            ep.stop();
            state.notify_endpoint_exit(&ep);
        });
    }

    /// Dial a peer router. The spec must name a concrete host: the
    /// wildcard address is only legal for listeners.
    pub async fn connect_to(self: &Arc<Self>, spec: &str) -> Result<Endpoint> {
        let addr: BusAddr = spec.parse()?;
        if addr.addr.is_unspecified() {
            bail!("r4addr=0.0.0.0 is legal only for listeners");
        }
        if addr.port == 0 {
            bail!("r4port must be 1-65535 for outbound connects");
        }
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((addr.addr, addr.port)))
            .await
            .context("connect timed out")??;

        let hello = HelloFrame::router(self.guid.clone(), NameTransfer::AllNames);
        let welcome = timeout(
            self.config.auth_timeout,
            auth::connect(&mut stream, &hello),
        )
        .await
        .context("authentication timed out")??;

        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        let ep = Endpoint::new_remote(
            self.router.registry().mint_id(),
            welcome.unique_name.clone(),
            true,
            welcome.protocol_version,
            local_addr,
            peer_addr,
            Some(B2bInfo {
                remote_guid: welcome.guid.clone(),
                remote_protocol_version: welcome.protocol_version,
                name_transfer: welcome.name_transfer,
            }),
        );
        self.router.register_endpoint(&ep);
        self.start_io(&ep, stream);
        info!("connected to router {} at {spec}", welcome.guid.short());

        propagation::exchange_names_with(self, &ep).await;
        Ok(ep)
    }

    //
    // Per-endpoint I/O.
    //

    fn start_io(self: &Arc<Self>, ep: &Endpoint, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let rx_stop = Arc::new(Notify::new());

        let tx = tokio::spawn(Self::tx_pump(self.clone(), ep.clone(), write_half));
        let rx = tokio::spawn(Self::rx_pump(
            self.clone(),
            ep.clone(),
            read_half,
            rx_stop.clone(),
        ));
        let keepalive = tokio::spawn(Self::keepalive_pump(self.clone(), ep.clone()));

        self.io_tasks.lock().insert(
            ep.id(),
            EndpointIo {
                rx,
                tx,
                keepalive,
                rx_stop,
            },
        );
    }

    async fn tx_pump(
        state: Arc<BusState>,
        ep: Endpoint,
        mut write_half: OwnedWriteHalf,
    ) -> Option<OwnedWriteHalf> {
        while let Some(msg) = ep.next_outbound().await {
            if let Err(e) = codec::write_frame(&mut write_half, &*msg).await {
                debug!("{}: write failed: {e}", ep.unique_name());
                ep.set_sudden_disconnect(true);
                ep.set_disconnect_reason(DisconnectReason::Abrupt);
                ep.stop();
                state.notify_endpoint_exit(&ep);
                return None;
            }
            trace!("{}: sent {:?}/{:?}", ep.unique_name(), msg.interface, msg.member);
        }
        // Queue closed in an orderly fashion; the socket half survives for
        // a possible raw handoff.
        Some(write_half)
    }

    async fn rx_pump(
        state: Arc<BusState>,
        ep: Endpoint,
        mut read_half: OwnedReadHalf,
        rx_stop: Arc<Notify>,
    ) -> Option<OwnedReadHalf> {
        loop {
            let msg: Message = tokio::select! {
                biased;
                _ = rx_stop.notified() => return Some(read_half),
                frame = codec::read_frame(&mut read_half) => match frame {
                    Ok(msg) => msg,
                    Err(e) => {
                        let clean = !ep.is_valid()
                            || matches!(
                                &e,
                                codec::CodecError::Io(io)
                                    if io.kind() == std::io::ErrorKind::UnexpectedEof
                            );
                        if clean {
                            ep.set_disconnect_reason(DisconnectReason::Clean);
                        } else {
                            debug!("{}: rx failed: {e}", ep.unique_name());
                            ep.set_sudden_disconnect(true);
                            ep.set_disconnect_reason(DisconnectReason::Abrupt);
                        }
                        break;
                    }
                },
            };

            if let Some(keepalive) = ep.keepalive() {
                keepalive.on_rx();
            }

            // Link-level probe traffic never reaches the router.
            if msg.is_member(objects::DAEMON_IFACE, "ProbeReq") {
                let mut ack =
                    Message::signal(objects::DAEMON_PATH, objects::DAEMON_IFACE, "ProbeAck", vec![]);
                ack.sender = Some(state.controller_name());
                ack.serial = state.router.next_serial();
                let _ = ep.push_control(Arc::new(ack));
                continue;
            }
            if msg.is_member(objects::DAEMON_IFACE, "ProbeAck") {
                continue;
            }

            let mut msg = msg;
            msg.rcv_endpoint = Some(ep.unique_name().to_string());
            if ep.is_bus_to_bus() {
                if msg.sender.is_none() {
                    debug!("{}: dropping senderless message", ep.unique_name());
                    continue;
                }
            } else {
                // Attachments speak for themselves, nobody else.
                match &msg.sender {
                    Some(sender) if sender != ep.unique_name() => {
                        debug!("{}: rejecting forged sender {sender}", ep.unique_name());
                        continue;
                    }
                    Some(_) => {}
                    None => msg.sender = Some(ep.unique_name().to_string()),
                }
            }

            // A zero serial on reliable point-to-point traffic is fatal;
            // broadcast and unreliable traffic tolerates duplicates and
            // disorder.
            if msg.serial == 0 {
                if msg.destination.is_some() {
                    warn!("{}: invalid header serial; dropping connection", ep.unique_name());
                    ep.set_sudden_disconnect(true);
                    ep.set_disconnect_reason(DisconnectReason::Abrupt);
                    break;
                }
                debug!("{}: dropping serial-less broadcast", ep.unique_name());
                continue;
            }

            let was_reply = msg.ty == MessageType::MethodReturn;
            let msg = Arc::new(msg);
            if let Err(e) = state.router.push_message(msg, &ep).await {
                trace!("{}: not routed: {e}", ep.unique_name());
            }

            // One-shot RX suspension for raw-session handoff.
            if was_reply && ep.take_pause_after_rx_reply() {
                return Some(read_half);
            }
        }

        ep.stop();
        state.notify_endpoint_exit(&ep);
        None
    }

    async fn keepalive_pump(state: Arc<BusState>, ep: Endpoint) {
        let Some(keepalive) = ep.keepalive() else {
            return;
        };
        loop {
            if !ep.is_valid() {
                return;
            }
            let listener = keepalive.listen();
            match keepalive.advance(std::time::Instant::now()) {
                Advice::Disabled => listener.await,
                Advice::WaitUntil(deadline) => {
                    let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                    tokio::select! {
                        () = sleep => {}
                        () = listener => {}
                    }
                }
                Advice::SendProbe => {
                    let probe = Message::signal(
                        objects::DAEMON_PATH,
                        objects::DAEMON_IFACE,
                        "ProbeReq",
                        vec![],
                    );
                    if ep.push_control(Arc::new(probe)).is_err() {
                        return;
                    }
                }
                Advice::Dead => {
                    warn!("{}: link dead after idle probes", ep.unique_name());
                    ep.set_sudden_disconnect(true);
                    ep.set_disconnect_reason(DisconnectReason::Timeout);
                    ep.stop();
                    state.notify_endpoint_exit(&ep);
                    return;
                }
            }
        }
    }

    /// Orderly teardown of a connection-backed endpoint that recovers its
    /// socket for a raw-session splice.
    pub async fn shutdown_endpoint_for_raw(&self, ep: &Endpoint) -> Result<TcpStream> {
        let io = self
            .io_tasks
            .lock()
            .remove(&ep.id())
            .ok_or_else(|| anyhow!("no i/o tasks for {}", ep.unique_name()))?;
        io.keepalive.abort();

        // Drain what is queued, then wake both pumps.
        ep.stop_after_tx_empty(Duration::from_secs(5)).await;
        io.rx_stop.notify_waiters();

        let write_half = io
            .tx
            .await
            .ok()
            .flatten()
            .ok_or_else(|| anyhow!("transmit half lost"))?;
        let read_half = io
            .rx
            .await
            .ok()
            .flatten()
            .ok_or_else(|| anyhow!("receive half lost"))?;

        // The raw session survives on its descriptor; the virtual endpoints
        // routed through this link go quietly, with nobody notified.
        ep.mark_exited();
        for other in self.router.registry().snapshot() {
            if other.ep_type() == EndpointType::Virtual && other.remove_b2b_routes(ep.id()) {
                other.set_stopping();
                self.router.unregister_endpoint(&other);
            }
        }
        self.router.unregister_endpoint(ep);

        read_half
            .reunite(write_half)
            .context("socket halves did not reunite")
    }

    //
    // Event-loop handlers.
    //

    async fn handle_endpoint_exit(self: &Arc<Self>, ep: &Endpoint) {
        debug!("{} exited ({:?})", ep.unique_name(), ep.ep_type());
        if let Some(io) = self.io_tasks.lock().remove(&ep.id()) {
            io.keepalive.abort();
            io.rx_stop.notify_waiters();
        }
        if ep.is_bus_to_bus() {
            self.sessions.remove_b2b_endpoint(self, ep).await;
            self.router.unregister_endpoint(ep);
        } else {
            self.sessions.endpoint_exited(self, ep.unique_name()).await;
            self.router.unregister_endpoint(ep);
            if ep.ep_type() == EndpointType::Remote {
                let count = self
                    .untrusted_clients
                    .fetch_sub(1, Ordering::SeqCst)
                    .saturating_sub(1);
                self.listen.set_untrusted_client_count(count).await;
            }
        }
    }

    async fn handle_name_change(self: &Arc<Self>, change: &NameOwnerChanged) {
        // The canonical broadcast.
        let msg = Message::signal(
            objects::DBUS_PATH,
            objects::DBUS_IFACE,
            "NameOwnerChanged",
            vec![
                Arg::Str(change.name.clone()),
                Arg::Str(change.old_owner.clone().unwrap_or_default()),
                Arg::Str(change.new_owner.clone().unwrap_or_default()),
            ],
        );
        self.send_from_controller(msg).await;

        // The directed companions.
        if let Some(new_owner) = &change.new_owner {
            if self.is_local_attachment(new_owner) {
                let msg = Message::signal(
                    objects::DBUS_PATH,
                    objects::DBUS_IFACE,
                    "NameAcquired",
                    vec![Arg::Str(change.name.clone())],
                )
                .with_destination(new_owner);
                self.send_from_controller(msg).await;
            }
        }
        if let Some(old_owner) = &change.old_owner {
            if change.old_owner != change.new_owner
                && change.name != *old_owner
                && self.is_local_attachment(old_owner)
            {
                let msg = Message::signal(
                    objects::DBUS_PATH,
                    objects::DBUS_IFACE,
                    "NameLost",
                    vec![Arg::Str(change.name.clone())],
                )
                .with_destination(old_owner);
                self.send_from_controller(msg).await;
            }
        }

        propagation::forward_name_change(self, change).await;
    }

    fn is_local_attachment(&self, name: &str) -> bool {
        self.router
            .find_endpoint(name)
            .map_or(false, |ep| ep.ep_type() != EndpointType::Virtual)
    }
}
