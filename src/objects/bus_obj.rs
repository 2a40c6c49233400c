//! The `org.alljoyn.Bus` surface: session lifecycle and advertise/find
//! methods available to local attachments.

use std::sync::Arc;

use enumflags2::BitFlags;
use tracing::warn;

use super::msg_sender;
use crate::{
    bus::BusState,
    codec::{transport_any, Arg, Message, TransportMask},
    sessions::{GetHostInfoReply, JoinReply},
};

pub(super) async fn handle_call(bus: &Arc<BusState>, msg: &Message) -> Option<Message> {
    match msg.member.as_deref() {
        Some("BindSessionPort") => Some(bind_session_port(bus, msg)),
        Some("UnbindSessionPort") => Some(unbind_session_port(bus, msg)),
        Some("JoinSession") => {
            spawn_join_session(bus, msg);
            None
        }
        Some("LeaveSession") => Some(leave_session(bus, msg).await),
        Some("RemoveSessionMember") => Some(remove_session_member(bus, msg).await),
        Some("GetSessionFd") => Some(get_session_fd(bus, msg)),
        Some("SetLinkTimeout") => Some(set_link_timeout(bus, msg)),
        Some("GetHostInfo") => Some(get_host_info(bus, msg)),
        Some("AdvertiseName") => Some(advertise_name(bus, msg).await),
        Some("CancelAdvertiseName") => Some(cancel_advertise_name(bus, msg).await),
        Some("FindAdvertisedName") => Some(find_advertised_name(bus, msg, true).await),
        Some("FindAdvertisedNameByTransport") => {
            Some(find_advertised_name(bus, msg, false).await)
        }
        Some("CancelFindAdvertisedName") => Some(cancel_find_advertised_name(bus, msg).await),
        Some("CancelFindAdvertisedNameByTransport") => {
            Some(cancel_find_advertised_name(bus, msg).await)
        }
        _ => super::unknown_method(msg),
    }
}

fn bind_session_port(bus: &Arc<BusState>, msg: &Message) -> Message {
    let (Ok(port), Ok(opts)) = (msg.arg_u16(0), msg.arg_session_opts(1)) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (port, opts)",
        );
    };
    let (reply, port) = bus
        .sessions()
        .bind_session_port(bus, msg_sender(msg), port, opts);
    Message::method_return(msg, vec![Arg::U32(reply as u32), Arg::U16(port)])
}

fn unbind_session_port(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(port) = msg.arg_u16(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (port)",
        );
    };
    let reply = bus
        .sessions()
        .unbind_session_port(bus, msg_sender(msg), port);
    Message::method_return(msg, vec![Arg::U32(reply as u32)])
}

/// JoinSession can block for the better part of a minute while remote
/// routers are contacted, so each request runs as its own task under the
/// session-setup concurrency bound.
fn spawn_join_session(bus: &Arc<BusState>, msg: &Message) {
    let bus = bus.clone();
    let msg = msg.clone();
    tokio::spawn(async move {
        let _permit = match bus.acquire_setup_permit().await {
            Some(permit) => permit,
            None => return,
        };
        let reply = join_session(&bus, &msg).await;
        if msg.reply_expected() {
            bus.send_from_controller(reply).await;
        }
    });
}

async fn join_session(bus: &Arc<BusState>, msg: &Message) -> Message {
    let (Ok(host), Ok(port), Ok(opts)) = (
        msg.arg_str(0),
        msg.arg_u16(1),
        msg.arg_session_opts(2),
    ) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (host, port, opts)",
        );
    };
    let (reply, id, opts_out) = bus
        .sessions()
        .join_session(bus, msg_sender(msg), host, port, opts)
        .await;
    if reply != JoinReply::Success {
        warn!("JoinSession({host}, {port}) by {} failed: {reply:?}", msg_sender(msg));
    }
    Message::method_return(
        msg,
        vec![
            Arg::U32(reply as u32),
            Arg::U32(id),
            Arg::SessionOpts(opts_out),
        ],
    )
}

async fn leave_session(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(id) = msg.arg_u32(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (id)",
        );
    };
    let reply = bus.sessions().leave_session(bus, msg_sender(msg), id).await;
    Message::method_return(msg, vec![Arg::U32(reply as u32)])
}

async fn remove_session_member(bus: &Arc<BusState>, msg: &Message) -> Message {
    let (Ok(id), Ok(member)) = (msg.arg_u32(0), msg.arg_str(1)) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (id, member)",
        );
    };
    let reply = bus
        .sessions()
        .remove_session_member(bus, msg_sender(msg), id, member)
        .await;
    Message::method_return(msg, vec![Arg::U32(reply as u32)])
}

/// The descriptor itself cannot ride a TCP frame; in-process attachments
/// claim it through `Attachment::take_session_fd`. This method only reports
/// whether a raw descriptor is (still) there to take.
fn get_session_fd(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(id) = msg.arg_u32(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (id)",
        );
    };
    match bus.sessions().take_session_fd(msg_sender(msg), id) {
        Some(fd) => {
            drop(fd);
            warn!("GetSessionFd over the wire discards the descriptor");
            Message::error(
                msg,
                "org.alljoyn.Bus.NotSupportedOnTransport",
                "Raw descriptors cannot be passed over this transport",
            )
        }
        None => Message::error(msg, "org.alljoyn.Bus.NoSession", "No raw session"),
    }
}

fn set_link_timeout(bus: &Arc<BusState>, msg: &Message) -> Message {
    let (Ok(id), Ok(req_secs)) = (msg.arg_u32(0), msg.arg_u32(1)) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (id, timeout)",
        );
    };
    let (reply, actual) = bus
        .sessions()
        .set_link_timeout(bus, msg_sender(msg), id, req_secs);
    Message::method_return(msg, vec![Arg::U32(reply as u32), Arg::U32(actual)])
}

fn get_host_info(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(id) = msg.arg_u32(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (id)",
        );
    };
    let (reply, addrs) = bus.sessions().get_host_info(bus, msg_sender(msg), id);
    let (local, remote) = addrs.unwrap_or_default();
    debug_assert!(reply != GetHostInfoReply::Success || !remote.is_empty());
    Message::method_return(
        msg,
        vec![Arg::U32(reply as u32), Arg::Str(local), Arg::Str(remote)],
    )
}

fn transports_arg(msg: &Message, index: usize) -> Option<BitFlags<TransportMask>> {
    let bits = msg.arg_u16(index).ok()?;
    Some(BitFlags::from_bits_truncate(bits))
}

async fn advertise_name(bus: &Arc<BusState>, msg: &Message) -> Message {
    let (Ok(name), Some(transports)) = (msg.arg_str(0), transports_arg(msg, 1)) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (name, transports)",
        );
    };
    let reply = bus
        .sessions()
        .advertise_name(bus, msg_sender(msg), name, transports)
        .await;
    Message::method_return(msg, vec![Arg::U32(reply as u32)])
}

async fn cancel_advertise_name(bus: &Arc<BusState>, msg: &Message) -> Message {
    let (Ok(name), Some(transports)) = (msg.arg_str(0), transports_arg(msg, 1)) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (name, transports)",
        );
    };
    let reply = bus
        .sessions()
        .cancel_advertise_name(bus, msg_sender(msg), name, transports)
        .await;
    Message::method_return(msg, vec![Arg::U32(reply as u32)])
}

async fn find_advertised_name(bus: &Arc<BusState>, msg: &Message, any_transport: bool) -> Message {
    let Ok(prefix) = msg.arg_str(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (prefix[, transports])",
        );
    };
    let transports = if any_transport {
        transport_any()
    } else {
        match transports_arg(msg, 1) {
            Some(transports) => transports,
            None => {
                return Message::error(
                    msg,
                    "org.freedesktop.DBus.Error.InvalidArgs",
                    "expected (prefix, transports)",
                )
            }
        }
    };
    let reply = bus
        .sessions()
        .find_advertised_name(bus, msg_sender(msg), prefix, transports)
        .await;
    Message::method_return(msg, vec![Arg::U32(reply as u32)])
}

async fn cancel_find_advertised_name(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(prefix) = msg.arg_str(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (prefix)",
        );
    };
    let reply = bus
        .sessions()
        .cancel_find_advertised_name(bus, msg_sender(msg), prefix)
        .await;
    Message::method_return(msg, vec![Arg::U32(reply as u32)])
}
