//! The `org.freedesktop.DBus` surface.

use std::sync::Arc;

use enumflags2::BitFlags;

use super::msg_sender;
use crate::{
    bus::BusState,
    codec::{Arg, Message},
    match_rules::MatchRule,
    name_table::{NameFlag, ReleaseNameReply, RequestNameReply},
};

fn request_name_code(reply: RequestNameReply) -> u32 {
    match reply {
        RequestNameReply::PrimaryOwner => 1,
        RequestNameReply::InQueue => 2,
        RequestNameReply::Exists => 3,
        RequestNameReply::AlreadyOwner => 4,
    }
}

fn release_name_code(reply: ReleaseNameReply) -> u32 {
    match reply {
        ReleaseNameReply::Released => 1,
        ReleaseNameReply::NonExistent => 2,
        ReleaseNameReply::NotOwner => 3,
    }
}

pub(super) async fn handle_call(bus: &Arc<BusState>, msg: &Message) -> Option<Message> {
    match msg.member.as_deref() {
        // Already handled during the welcome exchange; answering it again
        // keeps vanilla D-Bus clients happy.
        Some("Hello") => Some(Message::method_return(
            msg,
            vec![Arg::Str(msg_sender(msg).to_string())],
        )),
        Some("RequestName") => Some(request_name(bus, msg)),
        Some("ReleaseName") => Some(release_name(bus, msg)),
        Some("GetNameOwner") => Some(get_name_owner(bus, msg)),
        Some("NameHasOwner") => Some(name_has_owner(bus, msg)),
        Some("ListNames") => Some(list_names(bus, msg)),
        Some("ListQueuedOwners") => Some(list_queued_owners(bus, msg)),
        Some("AddMatch") => Some(add_match(bus, msg)),
        Some("RemoveMatch") => Some(remove_match(bus, msg)),
        Some("GetId") => Some(Message::method_return(
            msg,
            vec![Arg::Str(bus.guid().to_string())],
        )),
        _ => super::unknown_method(msg),
    }
}

/// Ask the message bus to assign the given name to the method caller.
fn request_name(bus: &Arc<BusState>, msg: &Message) -> Message {
    let (Ok(name), Ok(flag_bits)) = (msg.arg_str(0), msg.arg_u32(1)) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (name, flags)",
        );
    };
    if name.starts_with(':') || name.is_empty() {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            &format!("Cannot acquire the name `{name}`"),
        );
    }
    let flags = BitFlags::<NameFlag>::from_bits_truncate(flag_bits as u8);
    let reply = bus
        .router()
        .names()
        .request_name(name, msg_sender(msg), flags);
    Message::method_return(msg, vec![Arg::U32(request_name_code(reply))])
}

/// Ask the message bus to release the method caller's claim to the name.
fn release_name(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(name) = msg.arg_str(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (name)",
        );
    };
    let reply = bus.router().names().release_name(name, msg_sender(msg));
    Message::method_return(msg, vec![Arg::U32(release_name_code(reply))])
}

/// Returns the unique connection name of the primary owner of the name.
fn get_name_owner(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(name) = msg.arg_str(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (name)",
        );
    };
    let owner = if name.starts_with(':') {
        bus.router()
            .names()
            .unique_name_exists(name)
            .then(|| name.to_string())
    } else {
        bus.router().names().lookup(name)
    };
    match owner {
        Some(owner) => Message::method_return(msg, vec![Arg::Str(owner)]),
        None => Message::error(
            msg,
            "org.freedesktop.DBus.Error.NameHasNoOwner",
            "Name is not owned by anyone. Take it!",
        ),
    }
}

fn name_has_owner(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(name) = msg.arg_str(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (name)",
        );
    };
    let has = if name.starts_with(':') {
        bus.router().names().unique_name_exists(name)
    } else {
        bus.router().names().lookup(name).is_some()
    };
    Message::method_return(msg, vec![Arg::Bool(has)])
}

/// Returns a list of all currently-owned names on the bus.
fn list_names(bus: &Arc<BusState>, msg: &Message) -> Message {
    let mut names = bus.router().names().unique_names();
    names.extend(bus.router().names().alias_names());
    Message::method_return(msg, vec![Arg::StrArray(names)])
}

/// List the connections currently queued for a bus name.
fn list_queued_owners(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(name) = msg.arg_str(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (name)",
        );
    };
    match bus.router().names().queued_owners(name) {
        Some(owners) => Message::method_return(msg, vec![Arg::StrArray(owners)]),
        None => Message::error(
            msg,
            "org.freedesktop.DBus.Error.NameHasNoOwner",
            "Name is not owned by anyone. Take it!",
        ),
    }
}

/// Adds a match rule to match messages going through the message bus.
fn add_match(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(rule_text) = msg.arg_str(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (rule)",
        );
    };
    let rule: MatchRule = match rule_text.parse() {
        Ok(rule) => rule,
        Err(e) => {
            return Message::error(
                msg,
                "org.freedesktop.DBus.Error.MatchRuleInvalid",
                &e.to_string(),
            )
        }
    };
    match bus.router().find_endpoint(msg_sender(msg)) {
        Some(ep) => {
            bus.router().rules().add(ep.id(), rule);
            Message::method_return(msg, vec![])
        }
        None => Message::error(
            msg,
            "org.freedesktop.DBus.Error.NameHasNoOwner",
            &format!("No such peer: {}", msg_sender(msg)),
        ),
    }
}

/// Removes the first rule that matches.
fn remove_match(bus: &Arc<BusState>, msg: &Message) -> Message {
    let Ok(rule_text) = msg.arg_str(0) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected (rule)",
        );
    };
    let rule: MatchRule = match rule_text.parse() {
        Ok(rule) => rule,
        Err(e) => {
            return Message::error(
                msg,
                "org.freedesktop.DBus.Error.MatchRuleInvalid",
                &e.to_string(),
            )
        }
    };
    let Some(ep) = bus.router().find_endpoint(msg_sender(msg)) else {
        return Message::error(
            msg,
            "org.freedesktop.DBus.Error.NameHasNoOwner",
            &format!("No such peer: {}", msg_sender(msg)),
        );
    };
    match bus.router().rules().remove(ep.id(), &rule) {
        Ok(()) => Message::method_return(msg, vec![]),
        Err(_) => Message::error(
            msg,
            "org.freedesktop.DBus.Error.MatchRuleNotFound",
            "No such match rule",
        ),
    }
}
