//! The daemon's well-known bus objects.

mod bus_obj;
mod daemon;
mod dbus;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    bus::BusState,
    codec::{Message, MessageType},
};

pub const DBUS_NAME: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_IFACE: &str = "org.freedesktop.DBus";

pub const BUS_NAME: &str = "org.alljoyn.Bus";
pub const BUS_PATH: &str = "/org/alljoyn/Bus";
pub const BUS_IFACE: &str = "org.alljoyn.Bus";

pub const DAEMON_NAME: &str = "org.alljoyn.Daemon";
pub const DAEMON_PATH: &str = "/org/alljoyn/Daemon";
pub const DAEMON_IFACE: &str = "org.alljoyn.Daemon";

/// Interface every attachment implements for session accept callbacks.
pub const PEER_SESSION_IFACE: &str = "org.alljoyn.Bus.Peer.Session";

/// Helper for getting the peer name from a message.
fn msg_sender(msg: &Message) -> &str {
    // The bus (that's us!) is supposed to ensure a valid sender on the message.
    msg.sender.as_deref().expect("Missing `sender` header")
}

/// Entry point for everything delivered to the local endpoint.
pub async fn dispatch(bus: &Arc<BusState>, msg: Arc<Message>) {
    match msg.ty {
        MessageType::MethodReturn | MessageType::Error => bus.dispatch_reply(msg),
        MessageType::Signal => daemon::handle_signal(bus, msg).await,
        MessageType::MethodCall => {
            let reply = match msg.interface.as_deref() {
                Some(DBUS_IFACE) => dbus::handle_call(bus, &msg).await,
                Some(BUS_IFACE) => bus_obj::handle_call(bus, &msg).await,
                Some(DAEMON_IFACE) => daemon::handle_call(bus, &msg).await,
                other => {
                    debug!("method call for unhandled interface {other:?}");
                    Some(Message::error(
                        &msg,
                        "org.freedesktop.DBus.Error.UnknownInterface",
                        &format!("Unknown interface: {other:?}"),
                    ))
                }
            };
            if let Some(reply) = reply {
                if msg.reply_expected() {
                    bus.send_from_controller(reply).await;
                }
            }
        }
    }
}

/// Reply builder for a method the object does not implement.
fn unknown_method(msg: &Message) -> Option<Message> {
    warn!(
        "unknown method {:?} on {:?}",
        msg.member, msg.interface
    );
    Some(Message::error(
        msg,
        "org.freedesktop.DBus.Error.UnknownMethod",
        &format!("Unknown method: {:?}", msg.member),
    ))
}
