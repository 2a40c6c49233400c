//! Advertise/find registries and the TTL'd map of received advertisements.

use std::{sync::Arc, time::Duration};

use enumflags2::BitFlags;
use tracing::debug;

use super::SessionManager;
use crate::{bus::BusState, codec::TransportMask};

/// Prefix marking an advertisement that answers probes but is never
/// announced unsolicited.
pub const QUIET_PREFIX: &str = "quiet@";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AdvertiseReply {
    Success = 1,
    AlreadyAdvertising = 2,
    Failed = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FindReply {
    Success = 1,
    AlreadyDiscovering = 2,
    Failed = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CancelReply {
    Success = 1,
    Failed = 2,
}

pub(crate) struct AdvertiseEntry {
    pub name: String,
    pub owner: String,
    pub transports: BitFlags<TransportMask>,
    pub quiet: bool,
}

pub(crate) struct DiscoverEntry {
    pub prefix: String,
    pub owner: String,
    pub transports: BitFlags<TransportMask>,
}

/// A received advertisement. Rows are a multimap: the same name may be
/// reachable at several bus addresses.
#[derive(Clone, Debug)]
pub struct NameMapEntry {
    pub name: String,
    pub bus_addr: String,
    pub guid: String,
    pub transports: BitFlags<TransportMask>,
    pub ttl: Duration,
    /// Bumped on refresh so a stale expiry timer falls through.
    pub generation: u64,
}

impl SessionManager {
    pub async fn advertise_name(
        &self,
        bus: &Arc<BusState>,
        sender: &str,
        name: &str,
        transports: BitFlags<TransportMask>,
    ) -> AdvertiseReply {
        let (bare_name, quiet) = split_quiet(name);
        if bare_name.is_empty() || transports.is_empty() {
            return AdvertiseReply::Failed;
        }

        let newly_enabled = {
            let mut state = self.state.lock();
            let aggregate_before = aggregate_transports(&state.advertise_map, bare_name);
            match state
                .advertise_map
                .iter_mut()
                .find(|e| e.name == bare_name && e.owner == sender)
            {
                Some(entry) => {
                    if transports & !entry.transports == BitFlags::empty() {
                        return AdvertiseReply::AlreadyAdvertising;
                    }
                    entry.transports |= transports;
                    entry.quiet = quiet;
                }
                None => state.advertise_map.push(AdvertiseEntry {
                    name: bare_name.to_string(),
                    owner: sender.to_string(),
                    transports,
                    quiet,
                }),
            }
            aggregate_transports(&state.advertise_map, bare_name) & !aggregate_before
        };

        // Only freshly enabled transport bits reach the transport layer.
        if !newly_enabled.is_empty() {
            bus.listen().enable_advertise(bare_name, quiet).await;
        }
        AdvertiseReply::Success
    }

    pub async fn cancel_advertise_name(
        &self,
        bus: &Arc<BusState>,
        sender: &str,
        name: &str,
        transports: BitFlags<TransportMask>,
    ) -> CancelReply {
        let (bare_name, _) = split_quiet(name);
        let disabled = {
            let mut state = self.state.lock();
            let aggregate_before = aggregate_transports(&state.advertise_map, bare_name);
            let Some(index) = state
                .advertise_map
                .iter()
                .position(|e| e.name == bare_name && e.owner == sender)
            else {
                return CancelReply::Failed;
            };
            let entry = &mut state.advertise_map[index];
            entry.transports &= !transports;
            if entry.transports.is_empty() {
                state.advertise_map.remove(index);
            }
            aggregate_before & !aggregate_transports(&state.advertise_map, bare_name)
        };

        if !disabled.is_empty() {
            bus.listen().disable_advertise(bare_name).await;
        }
        CancelReply::Success
    }

    pub async fn find_advertised_name(
        &self,
        bus: &Arc<BusState>,
        sender: &str,
        prefix: &str,
        transports: BitFlags<TransportMask>,
    ) -> FindReply {
        if prefix.is_empty() || transports.is_empty() {
            return FindReply::Failed;
        }
        {
            let mut state = self.state.lock();
            if state
                .discover_map
                .iter()
                .any(|e| e.prefix == prefix && e.owner == sender)
            {
                return FindReply::AlreadyDiscovering;
            }
            state.discover_map.push(DiscoverEntry {
                prefix: prefix.to_string(),
                owner: sender.to_string(),
                transports,
            });
        }
        bus.listen().enable_discover(prefix).await;

        // Replay the advertisements already known so a late finder does not
        // miss currently-live services.
        let replay: Vec<(String, BitFlags<TransportMask>)> = {
            let state = self.state.lock();
            let mut seen: Vec<(String, BitFlags<TransportMask>)> = Vec::new();
            for entry in state.name_map.iter().filter(|e| {
                e.name.starts_with(prefix) && e.transports.intersects(transports)
            }) {
                let row = (entry.name.clone(), entry.transports & transports);
                if !seen.contains(&row) {
                    seen.push(row);
                }
            }
            seen
        };
        for (name, mask) in replay {
            bus.send_found_advertised_name(sender, &name, mask, prefix, true)
                .await;
        }
        FindReply::Success
    }

    pub async fn cancel_find_advertised_name(
        &self,
        bus: &Arc<BusState>,
        sender: &str,
        prefix: &str,
    ) -> CancelReply {
        let last = {
            let mut state = self.state.lock();
            let Some(index) = state
                .discover_map
                .iter()
                .position(|e| e.prefix == prefix && e.owner == sender)
            else {
                return CancelReply::Failed;
            };
            state.discover_map.remove(index);
            !state.discover_map.iter().any(|e| e.prefix == prefix)
        };
        if last {
            bus.listen().disable_discover(prefix).await;
        }
        CancelReply::Success
    }

    /// Drop everything a departing attachment advertised or looked for.
    pub(crate) async fn cancel_all_for_owner(&self, bus: &Arc<BusState>, owner: &str) {
        let (names, prefixes) = {
            let state = self.state.lock();
            let names: Vec<String> = state
                .advertise_map
                .iter()
                .filter(|e| e.owner == owner)
                .map(|e| e.name.clone())
                .collect();
            let prefixes: Vec<String> = state
                .discover_map
                .iter()
                .filter(|e| e.owner == owner)
                .map(|e| e.prefix.clone())
                .collect();
            (names, prefixes)
        };
        for name in names {
            let _ = self
                .cancel_advertise_name(bus, owner, &name, BitFlags::all())
                .await;
        }
        for prefix in prefixes {
            let _ = self.cancel_find_advertised_name(bus, owner, &prefix).await;
        }
    }

    /// Ingest a found/lost-names event from the name service.
    ///
    /// `ttl = 0` withdraws. A known `(name, bus address)` pair only has its
    /// timer refreshed; a known name at a new address becomes another row.
    pub async fn found_names(
        &self,
        bus: &Arc<BusState>,
        bus_addr: &str,
        guid: &str,
        transports: BitFlags<TransportMask>,
        names: &[String],
        ttl: Duration,
    ) {
        for name in names {
            if ttl.is_zero() {
                let removed = {
                    let mut state = self.state.lock();
                    let before = state.name_map.len();
                    state
                        .name_map
                        .retain(|e| !(e.name == *name && e.guid == guid));
                    clean_adv_alias(&mut state.adv_alias_map, guid, name);
                    state.name_map.len() < before
                };
                if removed {
                    self.notify_finders(bus, name, transports, false).await;
                }
                continue;
            }

            let (is_new, generation) = {
                let mut state = self.state.lock();
                state.name_map_generation += 1;
                let generation = state.name_map_generation;
                match state
                    .name_map
                    .iter_mut()
                    .find(|e| e.name == *name && e.bus_addr == bus_addr)
                {
                    Some(entry) => {
                        entry.ttl = ttl;
                        entry.transports |= transports;
                        entry.generation = generation;
                        (false, generation)
                    }
                    None => {
                        state.name_map.push(NameMapEntry {
                            name: name.clone(),
                            bus_addr: bus_addr.to_string(),
                            guid: guid.to_string(),
                            transports,
                            ttl,
                            generation,
                        });
                        if let Some(short) = guid.get(..8) {
                            let aliases = state.adv_alias_map.entry(short.to_string()).or_default();
                            if !aliases.iter().any(|(n, _)| n == name) {
                                aliases.push((name.clone(), transports));
                            }
                        }
                        (true, generation)
                    }
                }
            };

            // Arm (or re-arm, via the generation bump) the expiry timer.
            let manager_bus = bus.clone();
            let timer_name = name.clone();
            let timer_addr = bus_addr.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                manager_bus
                    .sessions()
                    .expire_name(&manager_bus, &timer_name, &timer_addr, generation)
                    .await;
            });

            if is_new {
                debug!("advertisement gained: {name} at {bus_addr} (ttl {ttl:?})");
                self.notify_finders(bus, name, transports, true).await;
            }
        }
    }

    async fn expire_name(&self, bus: &Arc<BusState>, name: &str, bus_addr: &str, generation: u64) {
        let expired = {
            let mut state = self.state.lock();
            let Some(index) = state
                .name_map
                .iter()
                .position(|e| e.name == name && e.bus_addr == bus_addr)
            else {
                return;
            };
            if state.name_map[index].generation != generation {
                // Refreshed since this timer was armed.
                return;
            }
            let entry = state.name_map.remove(index);
            let guid = entry.guid.clone();
            clean_adv_alias(&mut state.adv_alias_map, &guid, name);
            entry
        };
        debug!("advertisement expired: {name} at {bus_addr}");
        self.notify_finders(bus, name, expired.transports, false)
            .await;
    }

    async fn notify_finders(
        &self,
        bus: &Arc<BusState>,
        name: &str,
        transports: BitFlags<TransportMask>,
        found: bool,
    ) {
        let finders: Vec<(String, String, BitFlags<TransportMask>)> = {
            let state = self.state.lock();
            state
                .discover_map
                .iter()
                .filter(|e| name.starts_with(&e.prefix) && e.transports.intersects(transports))
                .map(|e| (e.owner.clone(), e.prefix.clone(), e.transports & transports))
                .collect()
        };
        for (owner, prefix, mask) in finders {
            bus.send_found_advertised_name(&owner, name, mask, &prefix, found)
                .await;
        }
    }

    /// Advertised names currently aggregated for `name`, any owner.
    pub fn is_advertised(&self, name: &str) -> bool {
        let (bare_name, _) = split_quiet(name);
        self.state
            .lock()
            .advertise_map
            .iter()
            .any(|e| e.name == bare_name)
    }
}

fn split_quiet(name: &str) -> (&str, bool) {
    match name.strip_prefix(QUIET_PREFIX) {
        Some(bare) => (bare, true),
        None => (name, false),
    }
}

fn aggregate_transports(
    advertise_map: &[AdvertiseEntry],
    name: &str,
) -> BitFlags<TransportMask> {
    advertise_map
        .iter()
        .filter(|e| e.name == name)
        .fold(BitFlags::empty(), |acc, e| acc | e.transports)
}

fn clean_adv_alias(
    adv_alias_map: &mut std::collections::HashMap<String, Vec<(String, BitFlags<TransportMask>)>>,
    guid: &str,
    name: &str,
) {
    if let Some(short) = guid.get(..8) {
        if let Some(aliases) = adv_alias_map.get_mut(short) {
            aliases.retain(|(n, _)| n != name);
            if aliases.is_empty() {
                adv_alias_map.remove(short);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_prefix_splits() {
        assert_eq!(split_quiet("quiet@org.acme.router"), ("org.acme.router", true));
        assert_eq!(split_quiet("org.acme.router"), ("org.acme.router", false));
    }

    #[test]
    fn aggregation_unions_owners() {
        let map = vec![
            AdvertiseEntry {
                name: "org.acme.svc".into(),
                owner: ":t.2".into(),
                transports: TransportMask::Tcp.into(),
                quiet: false,
            },
            AdvertiseEntry {
                name: "org.acme.svc".into(),
                owner: ":t.3".into(),
                transports: TransportMask::Local.into(),
                quiet: false,
            },
        ];
        assert_eq!(
            aggregate_transports(&map, "org.acme.svc"),
            TransportMask::Tcp | TransportMask::Local
        );
        assert!(aggregate_transports(&map, "org.other").is_empty());
    }
}
