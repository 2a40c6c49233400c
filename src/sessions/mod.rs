//! The session manager: bind/join/attach/leave, multipoint membership,
//! advertise/discover bookkeeping and raw-session handoff.
//!
//! All shared state sits in one [`SessionState`] behind one lock. The lock
//! is never held across an await: every operation computes its effects under
//! the lock, releases it, then pushes messages and waits.

mod advertise;
pub mod raw;

pub use advertise::{AdvertiseReply, CancelReply, FindReply, NameMapEntry};

use std::{
    collections::HashMap,
    os::fd::OwnedFd,
    sync::Arc,
    time::{Duration, Instant},
};

use enumflags2::BitFlags;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    bus::BusState,
    codec::{SessionOpts, Traffic, TransportMask},
    endpoint::{DisconnectReason, Endpoint, EndpointType, KeepaliveParams},
    guid::Guid,
};

pub const SESSION_PORT_ANY: u16 = 0;

/// First port probed when the binder asks for any port.
const DYNAMIC_PORT_START: u16 = 10_000;

/// How long join/attach wait for a virtual endpoint to materialize over a
/// freshly created bus-to-bus link.
const ENDPOINT_WAIT: Duration = Duration::from_secs(30);

const MIN_LINK_TIMEOUT_SECS: u32 = 40;
const LINK_PROBE_TIMEOUT_SECS: u32 = 10;
const LINK_MAX_IDLE_PROBES: u32 = 4;

/// Peers older than this cannot handle `RemoveSessionMember` or reasoned
/// session-lost signals.
pub const PROTOCOL_VERSION_REASONS: u32 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BindReply {
    Success = 1,
    AlreadyExists = 2,
    Failed = 3,
    InvalidOpts = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum UnbindReply {
    Success = 1,
    Failed = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum JoinReply {
    Success = 1,
    NoSession = 2,
    Unreachable = 3,
    ConnectFailed = 4,
    Rejected = 5,
    BadSessionOpts = 6,
    Failed = 7,
    AlreadyJoined = 8,
}

impl JoinReply {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Success,
            2 => Self::NoSession,
            3 => Self::Unreachable,
            4 => Self::ConnectFailed,
            5 => Self::Rejected,
            6 => Self::BadSessionOpts,
            8 => Self::AlreadyJoined,
            _ => Self::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum LeaveReply {
    Success = 1,
    NoSession = 2,
    Failed = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RemoveMemberReply {
    Success = 1,
    NoSession = 2,
    NotMultipoint = 3,
    NotBinder = 4,
    NotFound = 5,
    IncompatibleRemote = 6,
    Failed = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SetLinkTimeoutReply {
    Success = 1,
    NoSession = 2,
    NoDestSupport = 3,
    Failed = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum GetHostInfoReply {
    Success = 1,
    NoSession = 2,
    IsBinder = 3,
    NotSupportedOnTransport = 4,
    Failed = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SessionLostReason {
    RemoteEndLeft = 1,
    RemoteEndAbrupt = 2,
    RemovedByBinder = 3,
    LinkTimeout = 4,
    Other = 5,
}

impl SessionLostReason {
    pub fn from_disconnect(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::Clean => Self::RemoteEndLeft,
            DisconnectReason::Abrupt => Self::RemoteEndAbrupt,
            DisconnectReason::Timeout => Self::LinkTimeout,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::RemoteEndLeft,
            2 => Self::RemoteEndAbrupt,
            3 => Self::RemovedByBinder,
            4 => Self::LinkTimeout,
            _ => Self::Other,
        }
    }
}

/// One session-map row, keyed by `(endpoint_name, id)`. The binder's
/// reservation rows use `id = 0` (one per bound port) and are only ever
/// removed by an explicit unbind or the binder's disconnect.
pub struct SessionEntry {
    pub endpoint_name: String,
    pub id: u32,
    pub session_host: Option<String>,
    pub session_port: u16,
    pub opts: SessionOpts,
    /// Participants other than the host, self included.
    pub member_names: Vec<String>,
    pub fd: Option<OwnedFd>,
    pub is_initializing: bool,
    pub is_raw_ready: bool,
}

impl SessionEntry {
    fn alive_count(&self) -> usize {
        self.member_names.len() + usize::from(self.session_host.is_some())
    }
}

pub(crate) struct SessionState {
    pub(crate) session_map: Vec<SessionEntry>,
    pub(crate) advertise_map: Vec<advertise::AdvertiseEntry>,
    pub(crate) discover_map: Vec<advertise::DiscoverEntry>,
    pub(crate) name_map: Vec<NameMapEntry>,
    /// `short guid → advertised names` used to find a connect address when
    /// the only hint is a `:guid…` unique name.
    pub(crate) adv_alias_map: HashMap<String, Vec<(String, BitFlags<TransportMask>)>>,
    pub(crate) name_map_generation: u64,
}

impl SessionState {
    fn find_entry(&self, name: &str, id: u32) -> Option<&SessionEntry> {
        self.session_map
            .iter()
            .find(|e| e.endpoint_name == name && e.id == id)
    }

    fn find_entry_mut(&mut self, name: &str, id: u32) -> Option<&mut SessionEntry> {
        self.session_map
            .iter_mut()
            .find(|e| e.endpoint_name == name && e.id == id)
    }

    fn find_reservation(&self, binder: &str, port: u16) -> Option<&SessionEntry> {
        self.session_map
            .iter()
            .find(|e| e.endpoint_name == binder && e.id == 0 && e.session_port == port)
    }

    fn remove_entry(&mut self, name: &str, id: u32) -> Option<SessionEntry> {
        let index = self
            .session_map
            .iter()
            .position(|e| e.endpoint_name == name && e.id == id)?;
        Some(self.session_map.remove(index))
    }

    /// Uniform non-zero id, re-rolled while it collides with a live entry.
    fn mint_session_id(&self) -> u32 {
        loop {
            let id = fastrand::u32(1..=u32::MAX);
            if !self.session_map.iter().any(|e| e.id == id) {
                return id;
            }
        }
    }
}

pub struct SessionManager {
    guid: Guid,
    pub(crate) state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(guid: Guid) -> Self {
        Self {
            guid,
            state: Mutex::new(SessionState {
                session_map: Vec::new(),
                advertise_map: Vec::new(),
                discover_map: Vec::new(),
                name_map: Vec::new(),
                adv_alias_map: HashMap::new(),
                name_map_generation: 0,
            }),
        }
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    //
    // BindSessionPort / UnbindSessionPort
    //

    pub fn bind_session_port(
        &self,
        bus: &BusState,
        sender: &str,
        session_port: u16,
        opts: SessionOpts,
    ) -> (BindReply, u16) {
        if opts.traffic == Traffic::RawUnreliable
            || (opts.traffic == Traffic::RawReliable && opts.is_multipoint)
        {
            return (BindReply::InvalidOpts, session_port);
        }
        if bus.router().find_endpoint(sender).is_none() {
            return (BindReply::Failed, session_port);
        }

        let mut state = self.state.lock();
        let session_port = if session_port == SESSION_PORT_ANY {
            let mut candidate = DYNAMIC_PORT_START;
            while state.find_reservation(sender, candidate).is_some() {
                match candidate.checked_add(1) {
                    Some(next) => candidate = next,
                    None => return (BindReply::Failed, 0),
                }
            }
            candidate
        } else {
            if state.find_reservation(sender, session_port).is_some() {
                return (BindReply::AlreadyExists, session_port);
            }
            session_port
        };

        state.session_map.push(SessionEntry {
            endpoint_name: sender.to_string(),
            id: 0,
            session_host: Some(sender.to_string()),
            session_port,
            opts,
            member_names: Vec::new(),
            fd: None,
            is_initializing: false,
            is_raw_ready: false,
        });
        debug!("{sender} bound session port {session_port}");
        (BindReply::Success, session_port)
    }

    pub fn unbind_session_port(&self, _bus: &BusState, sender: &str, session_port: u16) -> UnbindReply {
        let mut state = self.state.lock();
        let before = state.session_map.len();
        state
            .session_map
            .retain(|e| !(e.id == 0 && e.endpoint_name == sender && e.session_port == session_port));
        if state.session_map.len() < before {
            UnbindReply::Success
        } else {
            UnbindReply::Failed
        }
    }

    //
    // JoinSession — active side
    //

    pub async fn join_session(
        &self,
        bus: &Arc<BusState>,
        joiner: &str,
        session_host: &str,
        session_port: u16,
        opts_in: SessionOpts,
    ) -> (JoinReply, u32, SessionOpts) {
        if bus.router().is_stopping() {
            return (JoinReply::Failed, 0, opts_in);
        }
        if opts_in.traffic == Traffic::RawUnreliable {
            return (JoinReply::BadSessionOpts, 0, opts_in);
        }
        let Some(joiner_ep) = bus.router().find_endpoint(joiner) else {
            return (JoinReply::Failed, 0, opts_in);
        };
        let host_ep = bus.router().find_endpoint(session_host);

        // Self-join guard: endpoint identity, not name equality.
        if let Some(host_ep) = &host_ep {
            if host_ep.id() == joiner_ep.id() {
                return (JoinReply::AlreadyJoined, 0, opts_in);
            }
            let host_unique = host_ep.unique_name().to_string();
            let state = self.state.lock();
            if state.session_map.iter().any(|e| {
                e.id != 0
                    && e.endpoint_name == joiner
                    && e.session_host.as_deref() == Some(host_unique.as_str())
                    && e.session_port == session_port
            }) {
                return (JoinReply::AlreadyJoined, 0, opts_in);
            }
        }

        match host_ep {
            Some(ep) if ep.ep_type() != EndpointType::Virtual => {
                self.join_session_local(bus, &joiner_ep, &ep, session_port, opts_in)
                    .await
            }
            _ => {
                self.join_session_remote(bus, &joiner_ep, session_host, session_port, opts_in)
                    .await
            }
        }
    }

    async fn join_session_local(
        &self,
        bus: &Arc<BusState>,
        joiner_ep: &Endpoint,
        host_ep: &Endpoint,
        session_port: u16,
        opts_in: SessionOpts,
    ) -> (JoinReply, u32, SessionOpts) {
        let binder = host_ep.unique_name().to_string();
        let joiner = joiner_ep.unique_name().to_string();

        let (id, opts_out, fresh_entry) = {
            let mut state = self.state.lock();
            let Some(reservation) = state.find_reservation(&binder, session_port) else {
                return (JoinReply::NoSession, 0, opts_in);
            };
            if !reservation.opts.is_compatible(&opts_in) {
                return (JoinReply::BadSessionOpts, 0, opts_in);
            }
            let mut opts_out = reservation.opts;
            opts_out.transports &= opts_in.transports;

            let existing = state
                .session_map
                .iter()
                .find(|e| {
                    e.id != 0
                        && e.endpoint_name == binder
                        && e.session_port == session_port
                        && e.opts.is_multipoint
                })
                .map(|e| e.id);
            match existing {
                Some(id) => (id, opts_out, false),
                None => {
                    let id = state.mint_session_id();
                    state.session_map.push(SessionEntry {
                        endpoint_name: binder.clone(),
                        id,
                        session_host: Some(binder.clone()),
                        session_port,
                        opts: opts_out,
                        member_names: Vec::new(),
                        fd: None,
                        is_initializing: true,
                        is_raw_ready: false,
                    });
                    (id, opts_out, true)
                }
            }
        };

        // Locks are down while the binder decides.
        let accepted = bus
            .accept_session(&binder, session_port, id, &joiner, &opts_out)
            .await;
        if !accepted {
            if fresh_entry {
                self.state.lock().remove_entry(&binder, id);
            }
            return (JoinReply::Rejected, 0, opts_in);
        }

        match opts_out.traffic {
            Traffic::Messages => {
                if bus
                    .router()
                    .add_session_route(id, joiner_ep, None, host_ep, None)
                    .is_err()
                {
                    if fresh_entry {
                        self.state.lock().remove_entry(&binder, id);
                    }
                    return (JoinReply::Failed, 0, opts_in);
                }
            }
            Traffic::RawReliable if !opts_out.is_multipoint => {}
            _ => {
                if fresh_entry {
                    self.state.lock().remove_entry(&binder, id);
                }
                return (JoinReply::BadSessionOpts, 0, opts_in);
            }
        }

        let prior_members = {
            let mut state = self.state.lock();
            let Some(host_entry) = state.find_entry_mut(&binder, id) else {
                return (JoinReply::Failed, 0, opts_in);
            };
            let prior = host_entry.member_names.clone();
            if !host_entry.member_names.contains(&joiner) {
                host_entry.member_names.push(joiner.clone());
            }
            host_entry.is_initializing = false;
            for entry in state
                .session_map
                .iter_mut()
                .filter(|e| e.id == id && e.endpoint_name != binder && e.endpoint_name != joiner)
            {
                if !entry.member_names.contains(&joiner) {
                    entry.member_names.push(joiner.clone());
                }
            }
            let mut member_names = vec![joiner.clone()];
            member_names.extend(prior.iter().cloned());
            state.session_map.push(SessionEntry {
                endpoint_name: joiner.clone(),
                id,
                session_host: Some(binder.clone()),
                session_port,
                opts: opts_out,
                member_names,
                fd: None,
                is_initializing: false,
                is_raw_ready: false,
            });
            prior
        };

        if opts_out.traffic == Traffic::RawReliable {
            match raw::socket_pair() {
                Ok((host_fd, joiner_fd)) => {
                    let mut state = self.state.lock();
                    if let Some(entry) = state.find_entry_mut(&binder, id) {
                        entry.fd = Some(host_fd);
                        entry.is_raw_ready = true;
                    }
                    if let Some(entry) = state.find_entry_mut(&joiner, id) {
                        entry.fd = Some(joiner_fd);
                        entry.is_raw_ready = true;
                    }
                }
                Err(e) => {
                    warn!("failed to create raw session socket pair: {e}");
                    let mut state = self.state.lock();
                    state.remove_entry(&joiner, id);
                    if fresh_entry {
                        state.remove_entry(&binder, id);
                    }
                    return (JoinReply::Failed, 0, opts_in);
                }
            }
        } else {
            // Mesh the joiner with the members that were already in.
            for member in &prior_members {
                if member == &joiner {
                    continue;
                }
                if let Some(member_ep) = bus.router().find_endpoint(member) {
                    let member_b2b = member_ep.route_for_session(id);
                    let _ = bus.router().add_session_route(
                        id,
                        joiner_ep,
                        None,
                        &member_ep,
                        member_b2b.as_ref(),
                    );
                }
            }
        }

        bus.send_session_joined(&binder, session_port, id, &joiner).await;
        if opts_out.is_multipoint {
            bus.send_mp_session_changed(&joiner, id, &binder, true).await;
            for member in &prior_members {
                bus.send_mp_session_changed(&joiner, id, member, true).await;
            }
            bus.send_mp_session_changed(&binder, id, &joiner, true).await;
            for member in &prior_members {
                if let Some(ep) = bus.router().find_endpoint(member) {
                    if ep.ep_type() != EndpointType::Virtual {
                        bus.send_mp_session_changed(member, id, &joiner, true).await;
                    }
                }
            }
        }

        info!("{joiner} joined session {id} hosted by {binder} on port {session_port}");
        (JoinReply::Success, id, opts_out)
    }

    async fn join_session_remote(
        &self,
        bus: &Arc<BusState>,
        joiner_ep: &Endpoint,
        session_host: &str,
        session_port: u16,
        opts_in: SessionOpts,
    ) -> (JoinReply, u32, SessionOpts) {
        let joiner = joiner_ep.unique_name().to_string();
        let host_ep = bus.router().find_endpoint(session_host);
        let mut b2b: Option<Endpoint> = None;

        // An existing compatible multipoint session to the same host lets us
        // reuse its bus-to-bus route instead of connecting again.
        if let Some(vep) = &host_ep {
            let reuse_id = {
                let state = self.state.lock();
                state
                    .session_map
                    .iter()
                    .find(|e| {
                        e.id != 0
                            && e.opts.is_multipoint
                            && e.opts.is_compatible(&opts_in)
                            && e.session_host.as_deref() == Some(vep.unique_name())
                    })
                    .map(|e| e.id)
            };
            if let Some(reuse_id) = reuse_id {
                b2b = vep.route_for_session(reuse_id);
            }
        }

        if b2b.is_none() {
            let mut candidates = self.connect_candidates(session_host, opts_in.transports);
            if candidates.is_empty()
                && host_ep
                    .as_ref()
                    .map_or(false, |ep| ep.ep_type() == EndpointType::Virtual)
            {
                candidates = bus.get_session_info_remote(session_host, session_port).await;
            }
            if candidates.is_empty() {
                return (JoinReply::Unreachable, 0, opts_in);
            }
            for addr in &candidates {
                match bus.connect_to(addr).await {
                    Ok(ep) => {
                        b2b = Some(ep);
                        break;
                    }
                    Err(e) => debug!("connect to {addr} failed: {e:#}"),
                }
            }
            if b2b.is_none() {
                return (JoinReply::ConnectFailed, 0, opts_in);
            }
        }
        let b2b = b2b.expect("bus-to-bus endpoint selected");

        let Some(host_vep) =
            wait_for_remote_endpoint(bus, session_host, &b2b, ENDPOINT_WAIT).await
        else {
            return (JoinReply::Failed, 0, opts_in);
        };
        let host_unique = host_vep.unique_name().to_string();

        // For raw traffic the link turns into the session's byte stream
        // right after the attach reply; suspend RX on that reply so no raw
        // byte is consumed as a frame.
        if opts_in.traffic == Traffic::RawReliable {
            b2b.pause_after_rx_reply();
        }

        let (reply, id, opts_out, members) = bus
            .send_attach_session(&b2b, session_port, &joiner, session_host, session_host, "", &opts_in)
            .await;
        if reply != JoinReply::Success {
            if opts_in.traffic == Traffic::RawReliable {
                // The link was dedicated to this raw session; with the
                // attach refused it has no further use.
                b2b.take_pause_after_rx_reply();
                b2b.set_disconnect_reason(DisconnectReason::Clean);
                b2b.stop();
                bus.notify_endpoint_exit(&b2b);
            }
            return (reply, 0, opts_in);
        }

        if opts_out.traffic == Traffic::Messages
            && bus
                .router()
                .add_session_route(id, joiner_ep, None, &host_vep, Some(&b2b))
                .is_err()
        {
            return (JoinReply::Failed, 0, opts_in);
        }

        {
            let mut state = self.state.lock();
            let mut member_names = vec![joiner.clone()];
            member_names.extend(
                members
                    .iter()
                    .filter(|m| **m != joiner && **m != host_unique)
                    .cloned(),
            );
            state.session_map.push(SessionEntry {
                endpoint_name: joiner.clone(),
                id,
                session_host: Some(host_unique.clone()),
                session_port,
                opts: opts_out,
                member_names,
                fd: None,
                is_initializing: false,
                is_raw_ready: false,
            });
        }

        if opts_out.traffic == Traffic::Messages {
            for member in &members {
                if member == &joiner || member == &host_unique {
                    continue;
                }
                let member_ep = match bus.router().find_endpoint(member) {
                    Some(ep) => Some(ep),
                    None => {
                        wait_for_remote_endpoint(bus, member, &b2b, Duration::from_secs(5)).await
                    }
                };
                let Some(member_ep) = member_ep else {
                    warn!("session {id}: member {member} never materialized");
                    continue;
                };
                if member_ep.ep_type() == EndpointType::Virtual {
                    if opts_out.is_multipoint {
                        // Members hosted on third routers get spliced in with a
                        // secondary attach through the link carrying the host.
                        let (member_reply, ..) = bus
                            .send_attach_session(
                                &b2b,
                                session_port,
                                &joiner,
                                session_host,
                                member,
                                "",
                                &opts_in,
                            )
                            .await;
                        if member_reply != JoinReply::Success {
                            warn!("secondary attach to {member} failed: {member_reply:?}");
                            continue;
                        }
                    }
                    let _ = bus
                        .router()
                        .add_session_route(id, joiner_ep, None, &member_ep, Some(&b2b));
                } else {
                    let _ = bus
                        .router()
                        .add_session_route(id, joiner_ep, None, &member_ep, None);
                }
            }
        }

        if opts_out.traffic == Traffic::RawReliable {
            match bus.shutdown_endpoint_for_raw(&b2b).await {
                Ok(stream) => match stream.into_std() {
                    Ok(stream) => {
                        let mut state = self.state.lock();
                        if let Some(entry) = state.find_entry_mut(&joiner, id) {
                            entry.fd = Some(stream.into());
                            entry.is_raw_ready = true;
                        }
                    }
                    Err(e) => {
                        warn!("failed to recover raw socket: {e}");
                        return (JoinReply::Failed, 0, opts_in);
                    }
                },
                Err(e) => {
                    warn!("failed to shut down endpoint for raw session: {e:#}");
                    return (JoinReply::Failed, 0, opts_in);
                }
            }
        }

        if opts_out.is_multipoint {
            bus.send_mp_session_changed(&joiner, id, &host_unique, true).await;
            for member in &members {
                if member != &joiner && member != &host_unique {
                    bus.send_mp_session_changed(&joiner, id, member, true).await;
                }
            }
        }

        info!("{joiner} joined remote session {id} hosted by {host_unique}");
        (JoinReply::Success, id, opts_out)
    }

    fn connect_candidates(
        &self,
        host: &str,
        transports: BitFlags<TransportMask>,
    ) -> Vec<String> {
        let state = self.state.lock();
        let mut addrs: Vec<String> = Vec::new();
        for entry in state
            .name_map
            .iter()
            .filter(|e| e.name == host && e.transports.intersects(transports))
        {
            if !addrs.contains(&entry.bus_addr) {
                addrs.push(entry.bus_addr.clone());
            }
        }
        if addrs.is_empty() {
            // The only hint may be a `:guid…` unique name; map it back to an
            // advertised name we saw from that router.
            if let Some(short) = Guid::short_from_unique_name(host) {
                if let Some(aliases) = state.adv_alias_map.get(short) {
                    for (adv_name, mask) in aliases {
                        if !mask.intersects(transports) {
                            continue;
                        }
                        for entry in state.name_map.iter().filter(|e| &e.name == adv_name) {
                            if !addrs.contains(&entry.bus_addr) {
                                addrs.push(entry.bus_addr.clone());
                            }
                        }
                    }
                }
            }
        }
        addrs
    }

    //
    // AttachSession — passive / forwarding side
    //

    #[allow(clippy::too_many_arguments)]
    pub async fn attach_session(
        &self,
        bus: &Arc<BusState>,
        from_b2b: &Endpoint,
        session_port: u16,
        joiner: &str,
        session_host: &str,
        dest: &str,
        host_bus_addr: &str,
        opts_in: SessionOpts,
    ) -> AttachOutcome {
        if bus.router().is_stopping() {
            return AttachOutcome::failed(JoinReply::Failed, opts_in);
        }
        match bus.router().find_endpoint(dest) {
            Some(ep)
                if ep.ep_type() != EndpointType::Virtual
                    && ep.ep_type() != EndpointType::BusToBus =>
            {
                self.attach_local(bus, from_b2b, &ep, session_port, joiner, opts_in)
                    .await
            }
            Some(ep)
                if ep.ep_type() == EndpointType::Virtual && from_b2b.b2b_session_id() != 0 =>
            {
                self.attach_forward(
                    bus,
                    from_b2b,
                    &ep,
                    session_port,
                    joiner,
                    session_host,
                    dest,
                    host_bus_addr,
                    opts_in,
                )
                .await
            }
            _ => {
                self.attach_connect_forward(
                    bus,
                    from_b2b,
                    session_port,
                    joiner,
                    session_host,
                    dest,
                    host_bus_addr,
                    opts_in,
                )
                .await
            }
        }
    }

    async fn attach_local(
        &self,
        bus: &Arc<BusState>,
        from_b2b: &Endpoint,
        binder_ep: &Endpoint,
        session_port: u16,
        joiner: &str,
        opts_in: SessionOpts,
    ) -> AttachOutcome {
        let binder = binder_ep.unique_name().to_string();

        let (id, opts_out, fresh_entry, member_attach) = {
            let mut state = self.state.lock();
            match state.find_reservation(&binder, session_port) {
                Some(reservation) => {
                    if !reservation.opts.is_compatible(&opts_in) {
                        return AttachOutcome::failed(JoinReply::BadSessionOpts, opts_in);
                    }
                    let mut opts_out = reservation.opts;
                    opts_out.transports &= opts_in.transports;
                    let existing = state
                        .session_map
                        .iter()
                        .find(|e| {
                            e.id != 0
                                && e.endpoint_name == binder
                                && e.session_port == session_port
                                && e.opts.is_multipoint
                        })
                        .map(|e| e.id);
                    match existing {
                        Some(id) => (id, opts_out, false, false),
                        None => {
                            let id = state.mint_session_id();
                            state.session_map.push(SessionEntry {
                                endpoint_name: binder.clone(),
                                id,
                                session_host: Some(binder.clone()),
                                session_port,
                                opts: opts_out,
                                member_names: Vec::new(),
                                fd: None,
                                is_initializing: true,
                                is_raw_ready: false,
                            });
                            (id, opts_out, true, false)
                        }
                    }
                }
                None => {
                    // Not the binder: a secondary multipoint attach aimed at
                    // an existing member of a session hosted here.
                    let Some(entry) = state.session_map.iter().find(|e| {
                        e.id != 0
                            && e.endpoint_name == binder
                            && e.session_port == session_port
                            && e.opts.is_multipoint
                    }) else {
                        return AttachOutcome::failed(JoinReply::NoSession, opts_in);
                    };
                    if !entry.opts.is_compatible(&opts_in) {
                        return AttachOutcome::failed(JoinReply::BadSessionOpts, opts_in);
                    }
                    (entry.id, entry.opts, false, true)
                }
            }
        };

        // Members accepted the session when they joined; only the binder
        // gets an AcceptSession callback.
        let accepted = member_attach
            || bus
                .accept_session(&binder, session_port, id, joiner, &opts_out)
                .await;
        if !accepted {
            if fresh_entry {
                self.state.lock().remove_entry(&binder, id);
            }
            return AttachOutcome::failed(JoinReply::Rejected, opts_in);
        }

        let Some(joiner_vep) = wait_for_remote_endpoint(bus, joiner, from_b2b, ENDPOINT_WAIT).await
        else {
            if fresh_entry {
                self.state.lock().remove_entry(&binder, id);
            }
            return AttachOutcome::failed(JoinReply::Failed, opts_in);
        };

        let mut post = None;
        match opts_out.traffic {
            Traffic::Messages => {
                if bus
                    .router()
                    .add_session_route(id, binder_ep, None, &joiner_vep, Some(from_b2b))
                    .is_err()
                {
                    if fresh_entry {
                        self.state.lock().remove_entry(&binder, id);
                    }
                    return AttachOutcome::failed(JoinReply::Failed, opts_in);
                }
            }
            Traffic::RawReliable if !opts_out.is_multipoint => match raw::socket_pair() {
                Ok((binder_fd, pump_fd)) => {
                    let mut state = self.state.lock();
                    if let Some(entry) = state.find_entry_mut(&binder, id) {
                        entry.fd = Some(binder_fd);
                        entry.is_raw_ready = true;
                    }
                    post = Some(RawSplice::ToBinder(pump_fd));
                }
                Err(e) => {
                    warn!("failed to create raw session socket pair: {e}");
                    if fresh_entry {
                        self.state.lock().remove_entry(&binder, id);
                    }
                    return AttachOutcome::failed(JoinReply::Failed, opts_in);
                }
            },
            _ => {
                if fresh_entry {
                    self.state.lock().remove_entry(&binder, id);
                }
                return AttachOutcome::failed(JoinReply::BadSessionOpts, opts_in);
            }
        }

        let joiner = joiner.to_string();
        let prior_members = {
            let mut state = self.state.lock();
            let Some(host_entry) = state.find_entry_mut(&binder, id) else {
                return AttachOutcome::failed(JoinReply::Failed, opts_in);
            };
            let prior = host_entry.member_names.clone();
            if !host_entry.member_names.contains(&joiner) {
                host_entry.member_names.push(joiner.clone());
            }
            host_entry.is_initializing = false;
            for entry in state
                .session_map
                .iter_mut()
                .filter(|e| e.id == id && e.endpoint_name != binder)
            {
                if !entry.member_names.contains(&joiner) {
                    entry.member_names.push(joiner.clone());
                }
            }
            prior
        };

        if member_attach {
            // The notifications all went out with the primary attach; this
            // hop only pins the member <-> joiner route.
            let _ = bus
                .router()
                .add_session_route(id, binder_ep, None, &joiner_vep, Some(from_b2b));
        } else {
            if opts_out.is_multipoint {
                for member in &prior_members {
                    if let Some(member_ep) = bus.router().find_endpoint(member) {
                        if member_ep.ep_type() != EndpointType::Virtual {
                            let _ = bus.router().add_session_route(
                                id,
                                &member_ep,
                                None,
                                &joiner_vep,
                                Some(from_b2b),
                            );
                            bus.send_mp_session_changed(member, id, &joiner, true).await;
                        }
                    }
                }
                bus.send_mp_session_changed(&binder, id, &joiner, true).await;
            }
            bus.send_session_joined(&binder, session_port, id, &joiner).await;
        }

        let mut members = vec![binder.clone()];
        members.extend(prior_members.into_iter().filter(|m| *m != joiner));

        info!("attached {joiner} to session {id} hosted here by {binder}");
        AttachOutcome {
            reply: JoinReply::Success,
            id,
            opts: opts_out,
            members,
            post,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attach_forward(
        &self,
        bus: &Arc<BusState>,
        from_b2b: &Endpoint,
        dest_ep: &Endpoint,
        session_port: u16,
        joiner: &str,
        session_host: &str,
        dest: &str,
        host_bus_addr: &str,
        opts_in: SessionOpts,
    ) -> AttachOutcome {
        // Secondary multipoint attach: the session is already in flight on
        // the calling link, the member lives one hop further.
        let Some(out_b2b) = dest_ep.route_for_session(from_b2b.b2b_session_id()) else {
            return AttachOutcome::failed(JoinReply::NoSession, opts_in);
        };
        let (reply, id, opts_out, members) = bus
            .send_attach_session(
                &out_b2b,
                session_port,
                joiner,
                session_host,
                dest,
                host_bus_addr,
                &opts_in,
            )
            .await;
        if reply != JoinReply::Success {
            return AttachOutcome::failed(reply, opts_in);
        }
        let Some(joiner_vep) = wait_for_remote_endpoint(bus, joiner, from_b2b, ENDPOINT_WAIT).await
        else {
            return AttachOutcome::failed(JoinReply::Failed, opts_in);
        };
        let _ = bus
            .router()
            .add_session_route(id, &joiner_vep, Some(from_b2b), dest_ep, Some(&out_b2b));

        let post = (opts_out.traffic == Traffic::RawReliable).then(|| RawSplice::Forward(out_b2b));
        AttachOutcome {
            reply: JoinReply::Success,
            id,
            opts: opts_out,
            members,
            post,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attach_connect_forward(
        &self,
        bus: &Arc<BusState>,
        from_b2b: &Endpoint,
        session_port: u16,
        joiner: &str,
        session_host: &str,
        dest: &str,
        host_bus_addr: &str,
        opts_in: SessionOpts,
    ) -> AttachOutcome {
        if host_bus_addr.is_empty() {
            return AttachOutcome::failed(JoinReply::Unreachable, opts_in);
        }
        let out_b2b = match bus.connect_to(host_bus_addr).await {
            Ok(ep) => ep,
            Err(e) => {
                debug!("forwarding connect to {host_bus_addr} failed: {e:#}");
                return AttachOutcome::failed(JoinReply::ConnectFailed, opts_in);
            }
        };
        let Some(dest_vep) = wait_for_remote_endpoint(bus, dest, &out_b2b, ENDPOINT_WAIT).await
        else {
            return AttachOutcome::failed(JoinReply::Failed, opts_in);
        };
        let (reply, id, opts_out, members) = bus
            .send_attach_session(
                &out_b2b,
                session_port,
                joiner,
                session_host,
                dest,
                host_bus_addr,
                &opts_in,
            )
            .await;
        if reply != JoinReply::Success {
            return AttachOutcome::failed(reply, opts_in);
        }
        let Some(joiner_vep) = wait_for_remote_endpoint(bus, joiner, from_b2b, ENDPOINT_WAIT).await
        else {
            return AttachOutcome::failed(JoinReply::Failed, opts_in);
        };
        let _ = bus
            .router()
            .add_session_route(id, &joiner_vep, Some(from_b2b), &dest_vep, Some(&out_b2b));

        let post = (opts_out.traffic == Traffic::RawReliable).then(|| RawSplice::Forward(out_b2b));
        AttachOutcome {
            reply: JoinReply::Success,
            id,
            opts: opts_out,
            members,
            post,
        }
    }

    //
    // Leave / RemoveSessionMember / DetachSession
    //

    pub async fn leave_session(&self, bus: &Arc<BusState>, sender: &str, id: u32) -> LeaveReply {
        if id == 0 || self.state.lock().find_entry(sender, id).is_none() {
            return LeaveReply::NoSession;
        }
        // Tell the peer routers first so their entries go too.
        bus.send_detach_session(id, sender).await;
        self.remove_member(bus, id, sender, SessionLostReason::RemoteEndLeft, false)
            .await;
        LeaveReply::Success
    }

    pub async fn remove_session_member(
        &self,
        bus: &Arc<BusState>,
        sender: &str,
        id: u32,
        member: &str,
    ) -> RemoveMemberReply {
        {
            let state = self.state.lock();
            let Some(entry) = state.find_entry(sender, id) else {
                return RemoveMemberReply::NoSession;
            };
            if entry.session_host.as_deref() != Some(sender) {
                return RemoveMemberReply::NotBinder;
            }
            if !entry.opts.is_multipoint {
                return RemoveMemberReply::NotMultipoint;
            }
            if !entry.member_names.iter().any(|m| m == member) {
                return RemoveMemberReply::NotFound;
            }
        }
        match bus.router().find_endpoint(member) {
            None => return RemoveMemberReply::NotFound,
            Some(member_ep) if member_ep.ep_type() == EndpointType::Virtual => {
                let protocol = member_ep
                    .route_for_session(id)
                    .and_then(|b2b| b2b.remote_protocol_version())
                    .unwrap_or(0);
                if protocol < PROTOCOL_VERSION_REASONS {
                    return RemoveMemberReply::IncompatibleRemote;
                }
            }
            Some(_) => {}
        }

        bus.send_detach_session(id, member).await;
        self.remove_member(bus, id, member, SessionLostReason::RemovedByBinder, true)
            .await;
        RemoveMemberReply::Success
    }

    /// DetachSession from a peer router: drop the member everywhere, with
    /// loss reasons taken from the signal's context.
    pub async fn handle_detach_session(
        &self,
        bus: &Arc<BusState>,
        id: u32,
        member: &str,
        reason: SessionLostReason,
    ) {
        self.remove_member(bus, id, member, reason, false).await;
    }

    /// The common detach path: scrub `member` out of session `id`, detect
    /// the sessions that became lost and notify survivors. `SessionLost`
    /// goes out only after the route removal is visible.
    async fn remove_member(
        &self,
        bus: &Arc<BusState>,
        id: u32,
        member: &str,
        reason: SessionLostReason,
        notify_member: bool,
    ) {
        // Reservation rows (id 0) are never session-loss territory.
        if id == 0 {
            return;
        }
        let mut mp_notices: Vec<String> = Vec::new();
        let mut lost: Vec<String> = Vec::new();
        let removed_fd;
        {
            let mut state = self.state.lock();
            removed_fd = state.remove_entry(member, id).and_then(|e| e.fd);
            for entry in state.session_map.iter_mut().filter(|e| e.id == id) {
                let before = entry.alive_count();
                entry.member_names.retain(|m| m != member);
                if entry.session_host.as_deref() == Some(member) {
                    entry.session_host = None;
                }
                if entry.opts.is_multipoint && entry.alive_count() < before {
                    mp_notices.push(entry.endpoint_name.clone());
                }
            }
            let doomed: Vec<String> = state
                .session_map
                .iter()
                .filter(|e| {
                    e.id == id && e.fd.is_none() && !e.is_initializing && e.alive_count() <= 1
                })
                .map(|e| e.endpoint_name.clone())
                .collect();
            for name in doomed {
                state.remove_entry(&name, id);
                lost.push(name);
            }
        }
        drop(removed_fd);

        bus.router().remove_session_routes(member, id);

        for dest in &mp_notices {
            if dest == member || lost.contains(dest) {
                continue;
            }
            if is_local_name(bus, dest) {
                bus.send_mp_session_changed(dest, id, member, false).await;
            }
        }
        for dest in &lost {
            if dest == member || !is_local_name(bus, dest) {
                continue;
            }
            bus.send_session_lost(dest, id, reason).await;
        }
        if notify_member && is_local_name(bus, member) {
            bus.send_session_lost(member, id, reason).await;
        }
    }

    /// A local attachment went away: detach it from every session and drop
    /// its reservations, advertisements and discoveries.
    pub async fn endpoint_exited(&self, bus: &Arc<BusState>, name: &str) {
        let ids = self.session_ids_with_member(name);
        for id in ids {
            bus.send_detach_session(id, name).await;
            self.remove_member(bus, id, name, SessionLostReason::RemoteEndLeft, false)
                .await;
        }
        self.state
            .lock()
            .session_map
            .retain(|e| !(e.id == 0 && e.endpoint_name == name));
        self.cancel_all_for_owner(bus, name).await;
    }

    /// A bus-to-bus link died: destroy the virtual endpoints that lost their
    /// last route and detach their names from every session.
    pub async fn remove_b2b_endpoint(&self, bus: &Arc<BusState>, b2b: &Endpoint) {
        let reason = SessionLostReason::from_disconnect(
            b2b.disconnect_reason().unwrap_or(DisconnectReason::Abrupt),
        );
        let mut dead_names: Vec<String> = Vec::new();
        for ep in bus.router().registry().snapshot() {
            if ep.ep_type() != EndpointType::Virtual || !ep.has_route_through(b2b.id()) {
                continue;
            }
            if ep.remove_b2b_routes(b2b.id()) {
                ep.set_stopping();
                dead_names.push(ep.unique_name().to_string());
                bus.router().unregister_endpoint(&ep);
            }
        }
        for name in dead_names {
            for id in self.session_ids_with_member(&name) {
                self.remove_member(bus, id, &name, reason, false).await;
            }
        }
    }

    //
    // Odd jobs on live sessions
    //

    /// Hand the raw socket to the session participant. The fd moves out; a
    /// second call reports `None`.
    pub fn take_session_fd(&self, sender: &str, id: u32) -> Option<OwnedFd> {
        let mut state = self.state.lock();
        let entry = state.find_entry_mut(sender, id)?;
        if !entry.is_raw_ready {
            return None;
        }
        entry.fd.take()
    }

    pub fn set_link_timeout(
        &self,
        bus: &BusState,
        sender: &str,
        id: u32,
        req_secs: u32,
    ) -> (SetLinkTimeoutReply, u32) {
        let hops: Vec<String> = {
            let state = self.state.lock();
            let Some(entry) = state.find_entry(sender, id) else {
                return (SetLinkTimeoutReply::NoSession, 0);
            };
            entry
                .session_host
                .iter()
                .chain(entry.member_names.iter())
                .cloned()
                .collect()
        };
        let b2b = hops.iter().find_map(|name| {
            bus.router()
                .find_endpoint(name)
                .filter(|ep| ep.ep_type() == EndpointType::Virtual)
                .and_then(|ep| ep.route_for_session(id))
        });
        match b2b {
            None => (SetLinkTimeoutReply::NoDestSupport, 0),
            Some(b2b) => {
                let actual = req_secs.max(MIN_LINK_TIMEOUT_SECS);
                match b2b.keepalive() {
                    Some(keepalive) => {
                        keepalive.set_params(Some(KeepaliveParams {
                            idle_timeout: Duration::from_secs(actual.into()),
                            probe_timeout: Duration::from_secs(LINK_PROBE_TIMEOUT_SECS.into()),
                            max_idle_probes: LINK_MAX_IDLE_PROBES,
                        }));
                        (SetLinkTimeoutReply::Success, actual)
                    }
                    None => (SetLinkTimeoutReply::Failed, 0),
                }
            }
        }
    }

    pub fn get_host_info(
        &self,
        bus: &BusState,
        sender: &str,
        id: u32,
    ) -> (GetHostInfoReply, Option<(String, String)>) {
        let host = {
            let state = self.state.lock();
            let Some(entry) = state.find_entry(sender, id) else {
                return (GetHostInfoReply::NoSession, None);
            };
            if entry.session_host.as_deref() == Some(sender) {
                return (GetHostInfoReply::IsBinder, None);
            }
            match &entry.session_host {
                Some(host) => host.clone(),
                None => return (GetHostInfoReply::Failed, None),
            }
        };
        match bus.router().find_endpoint(&host) {
            Some(ep) if ep.ep_type() == EndpointType::Virtual => {
                let Some(b2b) = ep.route_for_session(id) else {
                    return (GetHostInfoReply::Failed, None);
                };
                match (b2b.local_addr(), b2b.peer_addr()) {
                    (Some(local), Some(peer)) => (
                        GetHostInfoReply::Success,
                        Some((local.ip().to_string(), peer.ip().to_string())),
                    ),
                    _ => (GetHostInfoReply::Failed, None),
                }
            }
            Some(_) => (GetHostInfoReply::NotSupportedOnTransport, None),
            None => (GetHostInfoReply::Failed, None),
        }
    }

    /// Answer a peer router asking where the binder of `(creator, port)` can
    /// be connected.
    pub fn get_session_info(&self, bus: &BusState, creator: &str, port: u16) -> Vec<String> {
        let binder = match bus.router().find_endpoint(creator) {
            Some(ep) => ep.unique_name().to_string(),
            None => creator.to_string(),
        };
        let state = self.state.lock();
        if state.find_reservation(&binder, port).is_some() {
            bus.listen_specs()
        } else {
            Vec::new()
        }
    }

    /// Live session ids that `name` participates in, as host or member.
    pub fn session_ids_with_member(&self, name: &str) -> Vec<u32> {
        let state = self.state.lock();
        let mut ids: Vec<u32> = state
            .session_map
            .iter()
            .filter(|e| {
                e.id != 0
                    && (e.endpoint_name == name
                        || e.session_host.as_deref() == Some(name)
                        || e.member_names.iter().any(|m| m == name))
            })
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.state
            .lock()
            .session_map
            .iter()
            .filter(|e| e.id != 0)
            .count()
    }
}

/// Outcome of an inbound AttachSession, shipped back over the calling link
/// by the daemon object. `post` carries raw-splice work that must not start
/// until the reply bytes are out.
pub struct AttachOutcome {
    pub reply: JoinReply,
    pub id: u32,
    pub opts: SessionOpts,
    pub members: Vec<String>,
    pub post: Option<RawSplice>,
}

impl AttachOutcome {
    fn failed(reply: JoinReply, opts: SessionOpts) -> Self {
        Self {
            reply,
            id: 0,
            opts,
            members: Vec::new(),
            post: None,
        }
    }
}

pub enum RawSplice {
    /// Pump the calling link's socket into the local binder's raw socket.
    ToBinder(OwnedFd),
    /// Pump the calling link into the onward link of a forwarded attach.
    Forward(Endpoint),
}

fn is_local_name(bus: &BusState, name: &str) -> bool {
    bus.router()
        .find_endpoint(name)
        .map_or(false, |ep| ep.ep_type() != EndpointType::Virtual)
}

/// Wait for `name` to become routable — for remote names, for its virtual
/// endpoint to hold a route through `via`. Wakes on endpoint-set changes
/// rather than polling.
pub(crate) async fn wait_for_remote_endpoint(
    bus: &BusState,
    name: &str,
    via: &Endpoint,
    max_wait: Duration,
) -> Option<Endpoint> {
    let deadline = Instant::now() + max_wait;
    loop {
        let listener = bus.router().registry().changed();
        if let Some(ep) = bus.router().find_endpoint(name) {
            match ep.ep_type() {
                EndpointType::Virtual => {
                    if !ep.is_stopping() && ep.has_route_through(via.id()) {
                        return Some(ep);
                    }
                }
                _ => return Some(ep),
            }
        }
        if !via.is_valid() {
            return None;
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let _ = tokio::time::timeout(deadline - now, listener).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState {
            session_map: Vec::new(),
            advertise_map: Vec::new(),
            discover_map: Vec::new(),
            name_map: Vec::new(),
            adv_alias_map: HashMap::new(),
            name_map_generation: 0,
        }
    }

    fn reservation(binder: &str, port: u16) -> SessionEntry {
        SessionEntry {
            endpoint_name: binder.to_string(),
            id: 0,
            session_host: Some(binder.to_string()),
            session_port: port,
            opts: SessionOpts::messages_point_to_point(),
            member_names: Vec::new(),
            fd: None,
            is_initializing: false,
            is_raw_ready: false,
        }
    }

    #[test]
    fn minted_ids_avoid_live_sessions() {
        let mut state = state();
        let mut entry = reservation(":t.2", 42);
        entry.id = 7;
        state.session_map.push(entry);
        for _ in 0..64 {
            let id = state.mint_session_id();
            assert_ne!(id, 0);
            assert_ne!(id, 7);
        }
    }

    #[test]
    fn alive_count_includes_host() {
        let mut entry = reservation(":t.2", 42);
        entry.id = 9;
        entry.member_names.push(":t.3".to_string());
        assert_eq!(entry.alive_count(), 2);
        entry.session_host = None;
        assert_eq!(entry.alive_count(), 1);
    }

    #[test]
    fn reason_codes_map_from_disconnects() {
        assert_eq!(
            SessionLostReason::from_disconnect(DisconnectReason::Clean),
            SessionLostReason::RemoteEndLeft
        );
        assert_eq!(
            SessionLostReason::from_disconnect(DisconnectReason::Abrupt),
            SessionLostReason::RemoteEndAbrupt
        );
        assert_eq!(
            SessionLostReason::from_disconnect(DisconnectReason::Timeout),
            SessionLostReason::LinkTimeout
        );
        assert_eq!(SessionLostReason::from_code(99), SessionLostReason::Other);
    }
}
