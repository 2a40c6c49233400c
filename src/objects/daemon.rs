//! The `org.alljoyn.Daemon` surface: the methods and signals routers use
//! among themselves.

use std::sync::Arc;

use tracing::{debug, warn};

use super::msg_sender;
use crate::{
    bus::BusState,
    codec::{Arg, Message},
    endpoint::Endpoint,
    guid::Guid,
    propagation,
    sessions::{JoinReply, RawSplice, SessionLostReason},
};

/// The bus-to-bus endpoint a daemon message physically arrived on.
fn rcv_b2b(bus: &Arc<BusState>, msg: &Message) -> Option<Endpoint> {
    let name = msg.rcv_endpoint.as_deref()?;
    bus.router()
        .find_endpoint(name)
        .filter(Endpoint::is_bus_to_bus)
}

pub(super) async fn handle_call(bus: &Arc<BusState>, msg: &Message) -> Option<Message> {
    match msg.member.as_deref() {
        Some("AttachSession") => {
            spawn_attach_session(bus, msg);
            None
        }
        Some("GetSessionInfo") => Some(get_session_info(bus, msg)),
        _ => super::unknown_method(msg),
    }
}

/// AttachSession blocks on accept callbacks and onward connects, so it runs
/// as its own task — and its reply is pushed straight over the calling
/// bus-to-bus link, never the default routing path, so a raw-session
/// shutdown cannot race it.
fn spawn_attach_session(bus: &Arc<BusState>, msg: &Message) {
    let Some(from_b2b) = rcv_b2b(bus, msg) else {
        debug!("AttachSession from a non-router endpoint; dropping");
        return;
    };
    let bus = bus.clone();
    let msg = msg.clone();
    tokio::spawn(async move {
        let _permit = match bus.acquire_setup_permit().await {
            Some(permit) => permit,
            None => return,
        };
        let reply = attach_session(&bus, &from_b2b, &msg).await;
        let mut reply = match reply {
            Ok((reply, post)) => {
                run_post_splice(&bus, &from_b2b, reply, post).await;
                return;
            }
            Err(reply) => reply,
        };
        reply.sender = Some(bus.controller_name());
        bus.send_over(&from_b2b, reply).await;
    });
}

async fn attach_session(
    bus: &Arc<BusState>,
    from_b2b: &Endpoint,
    msg: &Message,
) -> Result<(Message, Option<RawSplice>), Message> {
    let (Ok(port), Ok(joiner), Ok(host), Ok(dest), Ok(_joiner_b2b), Ok(host_bus_addr), Ok(opts)) = (
        msg.arg_u16(0),
        msg.arg_str(1),
        msg.arg_str(2),
        msg.arg_str(3),
        msg.arg_str(4),
        msg.arg_str(5),
        msg.arg_session_opts(6),
    ) else {
        return Err(Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (port, joiner, host, dest, joinerB2B, hostBusAddr, opts)",
        ));
    };

    let outcome = bus
        .sessions()
        .attach_session(bus, from_b2b, port, joiner, host, dest, host_bus_addr, opts)
        .await;
    if outcome.reply != JoinReply::Success {
        debug!(
            "AttachSession({joiner} -> {dest}) failed: {:?}",
            outcome.reply
        );
    }
    let reply = Message::method_return(
        msg,
        vec![
            Arg::U32(outcome.reply as u32),
            Arg::U32(outcome.id),
            Arg::SessionOpts(outcome.opts),
            Arg::StrArray(outcome.members),
        ],
    );
    Ok((reply, outcome.post))
}

/// Send the attach reply over the calling link, then run any deferred raw
/// splice: the reply must be on the wire before the link's stream is torn
/// down for its socket.
async fn run_post_splice(
    bus: &Arc<BusState>,
    from_b2b: &Endpoint,
    mut reply: Message,
    post: Option<RawSplice>,
) {
    reply.sender = Some(bus.controller_name());
    bus.send_over(from_b2b, reply).await;
    let Some(post) = post else { return };
    match post {
        RawSplice::ToBinder(pump_fd) => {
            let stream = match bus.shutdown_endpoint_for_raw(from_b2b).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("raw splice: failed to recover link socket: {e:#}");
                    return;
                }
            };
            let pump_end = std::os::unix::net::UnixStream::from(pump_fd);
            if pump_end.set_nonblocking(true).is_err() {
                return;
            }
            match tokio::net::UnixStream::from_std(pump_end) {
                Ok(unix) => {
                    tokio::spawn(crate::sessions::raw::stream_pump(unix, stream));
                }
                Err(e) => warn!("raw splice: {e}"),
            }
        }
        RawSplice::Forward(out_b2b) => {
            // Both hops shut down in sequence to recover their sockets.
            let a = match bus.shutdown_endpoint_for_raw(from_b2b).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("raw splice: failed to recover inbound socket: {e:#}");
                    return;
                }
            };
            let b = match bus.shutdown_endpoint_for_raw(&out_b2b).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("raw splice: failed to recover onward socket: {e:#}");
                    return;
                }
            };
            tokio::spawn(crate::sessions::raw::stream_pump(a, b));
        }
    }
}

fn get_session_info(bus: &Arc<BusState>, msg: &Message) -> Message {
    let (Ok(creator), Ok(port)) = (msg.arg_str(0), msg.arg_u16(1)) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (creator, port)",
        );
    };
    let addrs = bus.sessions().get_session_info(bus, creator, port);
    if addrs.is_empty() {
        Message::error(msg, "org.alljoyn.Bus.NoSession", "No such session port")
    } else {
        Message::method_return(msg, vec![Arg::StrArray(addrs)])
    }
}

/// Daemon signals delivered to the controller.
pub async fn handle_signal(bus: &Arc<BusState>, msg: Arc<Message>) {
    if msg.interface.as_deref() != Some(super::DAEMON_IFACE) {
        return;
    }
    match msg.member.as_deref() {
        Some("ExchangeNames") => {
            if let Some(from_b2b) = rcv_b2b(bus, &msg) {
                propagation::handle_exchange_names(bus, &from_b2b, &msg).await;
            }
        }
        Some("NameChanged") => {
            if let Some(from_b2b) = rcv_b2b(bus, &msg) {
                propagation::handle_name_changed(bus, &from_b2b, &msg).await;
            }
        }
        Some("DetachSession") => {
            let (Ok(id), Ok(member)) = (msg.arg_u32(0), msg.arg_str(1)) else {
                warn!("malformed DetachSession signal");
                return;
            };
            // Our own detach broadcast comes back through the rule table;
            // a guid match says so.
            if let Some(sender) = msg.sender.as_deref() {
                if Guid::short_from_unique_name(sender) == Some(bus.guid().short()) {
                    return;
                }
            }
            let reason = rcv_b2b(bus, &msg)
                .and_then(|b2b| b2b.disconnect_reason())
                .map_or(SessionLostReason::RemoteEndLeft, SessionLostReason::from_disconnect);
            bus.sessions()
                .handle_detach_session(bus, id, member, reason)
                .await;
        }
        // Probe traffic is consumed by the endpoint RX pump.
        Some("ProbeReq") | Some("ProbeAck") => {}
        other => debug!("unhandled daemon signal {other:?} from {}", msg_sender(&msg)),
    }
}
