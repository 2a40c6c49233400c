//! The name table: unique and well-known names to owning endpoints.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use enumflags2::{bitflags, BitFlags};
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::endpoint::{Endpoint, EndpointId, Registry};

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameFlag {
    AllowReplacement = 0x01,
    ReplaceExisting = 0x02,
    DoNotQueue = 0x04,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

/// `(name, old owner, new owner)`; a lost owner with no standby yields
/// `new_owner = None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameOwnerChanged {
    pub name: String,
    pub old_owner: Option<String>,
    pub new_owner: Option<String>,
}

#[derive(Clone, Debug)]
struct NameOwner {
    unique_name: String,
    allow_replacement: bool,
}

#[derive(Clone, Debug)]
struct NameEntry {
    owner: NameOwner,
    waiting_list: VecDeque<NameOwner>,
    /// Owned by a remote attachment reached through a virtual endpoint.
    is_virtual: bool,
}

struct Tables {
    unique: HashMap<String, EndpointId>,
    aliases: HashMap<String, NameEntry>,
}

/// Every unique name resolves to exactly one endpoint; each well-known name
/// has at most one primary owner plus an ordered standby queue.
#[derive(Clone)]
pub struct NameTable {
    inner: Arc<Inner>,
}

struct Inner {
    tables: RwLock<Tables>,
    registry: Registry,
    changes_tx: UnboundedSender<NameOwnerChanged>,
}

impl NameTable {
    pub fn new(registry: Registry) -> (Self, UnboundedReceiver<NameOwnerChanged>) {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Inner {
                    tables: RwLock::new(Tables {
                        unique: HashMap::new(),
                        aliases: HashMap::new(),
                    }),
                    registry,
                    changes_tx,
                }),
            },
            changes_rx,
        )
    }

    fn notify(&self, change: NameOwnerChanged) {
        if self.inner.changes_tx.send(change).is_err() {
            warn!("name change listener gone");
        }
    }

    pub fn add_unique_name(&self, endpoint: &Endpoint) {
        let unique_name = endpoint.unique_name().to_string();
        {
            let mut tables = self.inner.tables.write();
            if tables.unique.contains_key(&unique_name) {
                panic!("Unique name `{unique_name}` re-used. We're in deep trouble if this happens");
            }
            tables.unique.insert(unique_name.clone(), endpoint.id());
        }
        self.notify(NameOwnerChanged {
            name: unique_name.clone(),
            old_owner: None,
            new_owner: Some(unique_name),
        });
    }

    /// Remove a unique name, cascading ownership of every alias it held.
    pub fn remove_unique_name(&self, unique_name: &str) {
        let mut changes = Vec::new();
        {
            let mut tables = self.inner.tables.write();
            if tables.unique.remove(unique_name).is_none() {
                return;
            }
            tables.aliases.retain(|name, entry| {
                if entry.owner.unique_name != unique_name {
                    entry
                        .waiting_list
                        .retain(|waiting| waiting.unique_name != unique_name);
                    return true;
                }
                match entry.waiting_list.pop_front() {
                    Some(next) => {
                        changes.push(NameOwnerChanged {
                            name: name.clone(),
                            old_owner: Some(unique_name.to_string()),
                            new_owner: Some(next.unique_name.clone()),
                        });
                        entry.owner = next;
                        true
                    }
                    None => {
                        changes.push(NameOwnerChanged {
                            name: name.clone(),
                            old_owner: Some(unique_name.to_string()),
                            new_owner: None,
                        });
                        false
                    }
                }
            });
        }
        changes.push(NameOwnerChanged {
            name: unique_name.to_string(),
            old_owner: Some(unique_name.to_string()),
            new_owner: None,
        });
        for change in changes {
            self.notify(change);
        }
    }

    pub fn request_name(
        &self,
        name: &str,
        unique_name: &str,
        flags: BitFlags<NameFlag>,
    ) -> RequestNameReply {
        let owner = NameOwner {
            unique_name: unique_name.to_string(),
            allow_replacement: flags.contains(NameFlag::AllowReplacement),
        };
        let (reply, change) = {
            let mut tables = self.inner.tables.write();
            match tables.aliases.get_mut(name) {
                Some(entry) => {
                    if entry.owner.unique_name == owner.unique_name {
                        (RequestNameReply::AlreadyOwner, None)
                    } else if flags.contains(NameFlag::ReplaceExisting)
                        && entry.owner.allow_replacement
                    {
                        let old = std::mem::replace(&mut entry.owner, owner);
                        entry.is_virtual = false;
                        (
                            RequestNameReply::PrimaryOwner,
                            Some(NameOwnerChanged {
                                name: name.to_string(),
                                old_owner: Some(old.unique_name),
                                new_owner: Some(unique_name.to_string()),
                            }),
                        )
                    } else if !flags.contains(NameFlag::DoNotQueue) {
                        entry.waiting_list.push_back(owner);
                        (RequestNameReply::InQueue, None)
                    } else {
                        (RequestNameReply::Exists, None)
                    }
                }
                None => {
                    tables.aliases.insert(
                        name.to_string(),
                        NameEntry {
                            owner,
                            waiting_list: VecDeque::new(),
                            is_virtual: false,
                        },
                    );
                    (
                        RequestNameReply::PrimaryOwner,
                        Some(NameOwnerChanged {
                            name: name.to_string(),
                            old_owner: None,
                            new_owner: Some(unique_name.to_string()),
                        }),
                    )
                }
            }
        };
        if let Some(change) = change {
            self.notify(change);
        }
        reply
    }

    pub fn release_name(&self, name: &str, owner: &str) -> ReleaseNameReply {
        let (reply, change) = {
            let mut tables = self.inner.tables.write();
            match tables.aliases.get_mut(name) {
                Some(entry) => {
                    if entry.owner.unique_name == owner {
                        match entry.waiting_list.pop_front() {
                            Some(next) => {
                                let change = NameOwnerChanged {
                                    name: name.to_string(),
                                    old_owner: Some(owner.to_string()),
                                    new_owner: Some(next.unique_name.clone()),
                                };
                                entry.owner = next;
                                (ReleaseNameReply::Released, Some(change))
                            }
                            None => {
                                tables.aliases.remove(name);
                                (
                                    ReleaseNameReply::Released,
                                    Some(NameOwnerChanged {
                                        name: name.to_string(),
                                        old_owner: Some(owner.to_string()),
                                        new_owner: None,
                                    }),
                                )
                            }
                        }
                    } else {
                        let len_before = entry.waiting_list.len();
                        entry
                            .waiting_list
                            .retain(|waiting| waiting.unique_name != owner);
                        if entry.waiting_list.len() < len_before {
                            (ReleaseNameReply::Released, None)
                        } else {
                            (ReleaseNameReply::NotOwner, None)
                        }
                    }
                }
                None => (ReleaseNameReply::NonExistent, None),
            }
        };
        if let Some(change) = change {
            self.notify(change);
        }
        reply
    }

    /// Install, move or clear a well-known alias owned behind a virtual
    /// endpoint. Returns whether anything changed.
    pub fn set_virtual_alias(&self, name: &str, new_owner: Option<&str>) -> bool {
        let (changed, change) = {
            let mut tables = self.inner.tables.write();
            match (tables.aliases.get_mut(name), new_owner) {
                (Some(entry), Some(new_owner)) => {
                    if !entry.is_virtual || entry.owner.unique_name == new_owner {
                        (false, None)
                    } else {
                        let old = std::mem::replace(
                            &mut entry.owner,
                            NameOwner {
                                unique_name: new_owner.to_string(),
                                allow_replacement: false,
                            },
                        );
                        (
                            true,
                            Some(NameOwnerChanged {
                                name: name.to_string(),
                                old_owner: Some(old.unique_name),
                                new_owner: Some(new_owner.to_string()),
                            }),
                        )
                    }
                }
                (Some(entry), None) => {
                    if !entry.is_virtual {
                        (false, None)
                    } else {
                        let old = entry.owner.unique_name.clone();
                        tables.aliases.remove(name);
                        (
                            true,
                            Some(NameOwnerChanged {
                                name: name.to_string(),
                                old_owner: Some(old),
                                new_owner: None,
                            }),
                        )
                    }
                }
                (None, Some(new_owner)) => {
                    tables.aliases.insert(
                        name.to_string(),
                        NameEntry {
                            owner: NameOwner {
                                unique_name: new_owner.to_string(),
                                allow_replacement: false,
                            },
                            waiting_list: VecDeque::new(),
                            is_virtual: true,
                        },
                    );
                    (
                        true,
                        Some(NameOwnerChanged {
                            name: name.to_string(),
                            old_owner: None,
                            new_owner: Some(new_owner.to_string()),
                        }),
                    )
                }
                (None, None) => (false, None),
            }
        };
        if let Some(change) = change {
            self.notify(change);
        }
        changed
    }

    /// Primary owner of a well-known name.
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.inner
            .tables
            .read()
            .aliases
            .get(name)
            .map(|entry| entry.owner.unique_name.clone())
    }

    /// Resolve a unique or well-known name to its endpoint.
    pub fn find_endpoint(&self, name: &str) -> Option<Endpoint> {
        let id = {
            let tables = self.inner.tables.read();
            let unique = if name.starts_with(':') {
                name
            } else {
                tables.aliases.get(name)?.owner.unique_name.as_str()
            };
            *tables.unique.get(unique)?
        };
        self.inner.registry.get(id)
    }

    pub fn unique_name_exists(&self, name: &str) -> bool {
        self.inner.tables.read().unique.contains_key(name)
    }

    pub fn unique_names(&self) -> Vec<String> {
        self.inner.tables.read().unique.keys().cloned().collect()
    }

    pub fn alias_names(&self) -> Vec<String> {
        self.inner.tables.read().aliases.keys().cloned().collect()
    }

    /// Aliases owned by the given unique name (primary ownership only).
    pub fn aliases_of(&self, unique_name: &str) -> Vec<String> {
        self.inner
            .tables
            .read()
            .aliases
            .iter()
            .filter(|(_, entry)| entry.owner.unique_name == unique_name)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn queued_owners(&self, name: &str) -> Option<Vec<String>> {
        self.inner.tables.read().aliases.get(name).map(|entry| {
            entry
                .waiting_list
                .iter()
                .map(|owner| owner.unique_name.clone())
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;

    fn table() -> (NameTable, Registry, UnboundedReceiver<NameOwnerChanged>) {
        let registry = Registry::new();
        let (table, rx) = NameTable::new(registry.clone());
        (table, registry, rx)
    }

    fn attach(table: &NameTable, registry: &Registry, name: &str) -> Endpoint {
        let ep = Endpoint::new_null(registry.mint_id(), name, true);
        registry.insert(ep.clone());
        table.add_unique_name(&ep);
        ep
    }

    #[test]
    fn request_release_dispositions() {
        let (table, registry, _rx) = table();
        attach(&table, &registry, ":t.2");
        attach(&table, &registry, ":t.3");

        assert_eq!(
            table.request_name("org.acme.svc", ":t.2", BitFlags::empty()),
            RequestNameReply::PrimaryOwner
        );
        assert_eq!(
            table.request_name("org.acme.svc", ":t.2", BitFlags::empty()),
            RequestNameReply::AlreadyOwner
        );
        assert_eq!(
            table.request_name("org.acme.svc", ":t.3", BitFlags::empty()),
            RequestNameReply::InQueue
        );
        assert_eq!(
            table.request_name("org.acme.svc", ":t.3", NameFlag::DoNotQueue.into()),
            RequestNameReply::Exists
        );

        assert_eq!(
            table.release_name("org.acme.svc", ":t.2"),
            ReleaseNameReply::Released
        );
        // Ownership transferred to the queued owner.
        assert_eq!(table.lookup("org.acme.svc").as_deref(), Some(":t.3"));
        assert_eq!(
            table.release_name("org.acme.svc", ":t.2"),
            ReleaseNameReply::NotOwner
        );
        assert_eq!(
            table.release_name("org.acme.none", ":t.2"),
            ReleaseNameReply::NonExistent
        );
    }

    #[test]
    fn disconnect_cascades_ownership() {
        let (table, registry, mut rx) = table();
        attach(&table, &registry, ":t.2");
        attach(&table, &registry, ":t.3");
        table.request_name("org.acme.svc", ":t.2", BitFlags::empty());
        table.request_name("org.acme.svc", ":t.3", BitFlags::empty());
        table.request_name("org.acme.solo", ":t.2", BitFlags::empty());

        while rx.try_recv().is_ok() {}
        table.remove_unique_name(":t.2");

        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(change);
        }
        assert!(changes.iter().any(|c| {
            c.name == "org.acme.svc"
                && c.old_owner.as_deref() == Some(":t.2")
                && c.new_owner.as_deref() == Some(":t.3")
        }));
        assert!(changes
            .iter()
            .any(|c| c.name == "org.acme.solo" && c.new_owner.is_none()));
        assert!(changes
            .iter()
            .any(|c| c.name == ":t.2" && c.new_owner.is_none()));
        assert!(table.lookup("org.acme.solo").is_none());
    }

    #[test]
    fn virtual_alias_lifecycle() {
        let (table, _registry, _rx) = table();
        assert!(table.set_virtual_alias("org.remote.svc", Some(":remote.2")));
        assert_eq!(table.lookup("org.remote.svc").as_deref(), Some(":remote.2"));
        // Idempotent for the same owner.
        assert!(!table.set_virtual_alias("org.remote.svc", Some(":remote.2")));
        assert!(table.set_virtual_alias("org.remote.svc", Some(":remote.3")));
        assert!(table.set_virtual_alias("org.remote.svc", None));
        assert!(table.lookup("org.remote.svc").is_none());
    }
}
