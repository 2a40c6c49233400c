//! Federated name propagation: ExchangeNames on new bus-to-bus links,
//! incremental NameChanged mirroring, and the virtual endpoints both
//! install.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    bus::BusState,
    codec::{Arg, Message, NameSetEntry, NameTransfer},
    endpoint::{Endpoint, EndpointType},
    guid::Guid,
    name_table::NameOwnerChanged,
    objects,
    sessions::SessionLostReason,
};

/// How long an installer waits out a virtual endpoint stuck in `Stopping`.
const STOPPING_WAIT: Duration = Duration::from_secs(10);

/// Share our view of the bus with a freshly attached peer router.
///
/// `AllNames` links get every unique name in the table (except those the
/// peer itself owns); restrictive links only learn the controller.
pub async fn exchange_names_with(bus: &Arc<BusState>, b2b: &Endpoint) {
    let name_transfer = b2b.name_transfer().unwrap_or(NameTransfer::AllNames);
    let peer_short = b2b.remote_guid().map(|guid| guid.short().to_string());

    let uniques: Vec<String> = match name_transfer {
        NameTransfer::AllNames => bus
            .router()
            .names()
            .unique_names()
            .into_iter()
            .filter(|name| {
                Guid::short_from_unique_name(name)
                    .map_or(true, |short| Some(short) != peer_short.as_deref())
            })
            .collect(),
        NameTransfer::ControllerOnly => vec![bus.controller_name()],
    };

    let entries: Vec<NameSetEntry> = uniques
        .into_iter()
        .map(|unique| {
            let aliases = bus.router().names().aliases_of(&unique);
            NameSetEntry { unique, aliases }
        })
        .collect();
    if entries.is_empty() {
        return;
    }

    let msg = Message::signal(
        objects::DAEMON_PATH,
        objects::DAEMON_IFACE,
        "ExchangeNames",
        vec![Arg::NameSet(entries)],
    );
    bus.send_over(b2b, msg).await;
}

/// Peer router shared its names: install virtual endpoints and aliases,
/// then pass the word along to every other all-names link.
pub async fn handle_exchange_names(bus: &Arc<BusState>, from_b2b: &Endpoint, msg: &Message) {
    let Some(entries) = msg.args.first().and_then(Arg::as_name_set) else {
        warn!("malformed ExchangeNames from {}", from_b2b.unique_name());
        return;
    };
    let own_short = bus.guid().short().to_string();

    let mut installed = Vec::new();
    for entry in entries {
        // Loop break: never re-install names this router minted.
        if Guid::short_from_unique_name(&entry.unique) == Some(own_short.as_str()) {
            continue;
        }
        if add_virtual_endpoint(bus, &entry.unique, from_b2b).await.is_none() {
            continue;
        }
        for alias in &entry.aliases {
            bus.router()
                .names()
                .set_virtual_alias(alias, Some(&entry.unique));
        }
        installed.push(entry.clone());
    }
    if installed.is_empty() {
        return;
    }

    // Re-forward to the other all-names links, skipping any link leading
    // back to the router the names came from.
    let sender_guid = from_b2b.remote_guid().cloned();
    for link in bus.router().b2b_endpoints() {
        if link.id() == from_b2b.id() {
            continue;
        }
        if link.name_transfer() != Some(NameTransfer::AllNames) {
            continue;
        }
        if link.remote_guid().is_some() && link.remote_guid() == sender_guid.as_ref() {
            continue;
        }
        let link_short = link.remote_guid().map(|guid| guid.short().to_string());
        let onward: Vec<NameSetEntry> = installed
            .iter()
            .filter(|entry| {
                Guid::short_from_unique_name(&entry.unique)
                    .map_or(true, |short| Some(short) != link_short.as_deref())
            })
            .cloned()
            .collect();
        if onward.is_empty() {
            continue;
        }
        let msg = Message::signal(
            objects::DAEMON_PATH,
            objects::DAEMON_IFACE,
            "ExchangeNames",
            vec![Arg::NameSet(onward)],
        );
        bus.send_over(&link, msg).await;
    }
}

/// Incremental NameChanged from a peer router.
pub async fn handle_name_changed(bus: &Arc<BusState>, from_b2b: &Endpoint, msg: &Message) {
    let (Ok(alias), Ok(old_owner), Ok(new_owner)) =
        (msg.arg_str(0), msg.arg_str(1), msg.arg_str(2))
    else {
        warn!("malformed NameChanged from {}", from_b2b.unique_name());
        return;
    };
    let own_short = bus.guid().short();

    if alias.starts_with(':') {
        // A unique name appearing or vanishing on the peer's side.
        if Guid::short_from_unique_name(alias) == Some(own_short) {
            debug!("rejecting NameChanged for our own name {alias}");
            return;
        }
        if new_owner.is_empty() {
            remove_virtual_name(bus, alias).await;
        } else {
            add_virtual_endpoint(bus, alias, from_b2b).await;
        }
        return;
    }

    let owner_guid = Guid::short_from_unique_name(if new_owner.is_empty() {
        old_owner
    } else {
        new_owner
    });
    if owner_guid == Some(own_short) {
        debug!("rejecting NameChanged for alias {alias} owned by our own attachment");
        return;
    }
    if new_owner.is_empty() {
        bus.router().names().set_virtual_alias(alias, None);
    } else {
        add_virtual_endpoint(bus, new_owner, from_b2b).await;
        bus.router().names().set_virtual_alias(alias, Some(new_owner));
    }
}

/// Mirror a local name-table change out to the federation. The link back to
/// the name's owning router is skipped, which is what keeps A → B → A
/// echoes from happening.
pub async fn forward_name_change(bus: &Arc<BusState>, change: &NameOwnerChanged) {
    let owner = change
        .new_owner
        .as_deref()
        .or(change.old_owner.as_deref())
        .unwrap_or(&change.name);
    let owner_short = if change.name.starts_with(':') {
        Guid::short_from_unique_name(&change.name)
    } else {
        Guid::short_from_unique_name(owner)
    };

    let msg = Message::signal(
        objects::DAEMON_PATH,
        objects::DAEMON_IFACE,
        "NameChanged",
        vec![
            Arg::Str(change.name.clone()),
            Arg::Str(change.old_owner.clone().unwrap_or_default()),
            Arg::Str(change.new_owner.clone().unwrap_or_default()),
        ],
    );
    for link in bus.router().b2b_endpoints() {
        if link.name_transfer() != Some(NameTransfer::AllNames) {
            continue;
        }
        if let (Some(remote), Some(owner_short)) = (link.remote_guid(), owner_short) {
            if remote.short() == owner_short {
                continue;
            }
        }
        bus.send_over(&link, msg.clone()).await;
    }
}

/// Install (or extend) the virtual endpoint standing in for `unique`,
/// routed through `via`.
///
/// A virtual endpoint caught mid-teardown is waited out, never revived; the
/// replacement is a fresh endpoint created once removal completes.
pub async fn add_virtual_endpoint(
    bus: &BusState,
    unique: &str,
    via: &Endpoint,
) -> Option<Endpoint> {
    let deadline = Instant::now() + STOPPING_WAIT;
    loop {
        let listener = bus.router().registry().changed();
        match bus.router().find_endpoint(unique) {
            Some(ep) if ep.ep_type() == EndpointType::Virtual => {
                if !ep.is_stopping() {
                    if ep.add_session_route(0, via) {
                        bus.router().registry().notify_changed();
                    }
                    return Some(ep);
                }
                // Fall through to wait for the teardown to finish.
            }
            Some(_) => {
                // A local endpoint already answers to this name.
                return None;
            }
            None => {
                let ep = Endpoint::new_virtual(bus.router().registry().mint_id(), unique);
                ep.add_session_route(0, via);
                bus.router().register_endpoint(&ep);
                debug!("virtual endpoint for {unique} via {}", via.unique_name());
                return Some(ep);
            }
        }
        let now = Instant::now();
        if now >= deadline {
            warn!("virtual endpoint {unique} stuck in teardown");
            return None;
        }
        let _ = tokio::time::timeout(deadline - now, listener).await;
    }
}

/// The peer told us an attachment is gone: drop its virtual endpoint and
/// detach it from every session.
async fn remove_virtual_name(bus: &Arc<BusState>, unique: &str) {
    let Some(ep) = bus.router().find_endpoint(unique) else {
        return;
    };
    if ep.ep_type() != EndpointType::Virtual {
        return;
    }
    ep.set_stopping();
    bus.router().unregister_endpoint(&ep);

    let ids = bus.sessions().session_ids_with_member(unique);
    for id in ids {
        bus.sessions()
            .handle_detach_session(bus, id, unique, SessionLostReason::RemoteEndLeft)
            .await;
    }
}
