//! The discovery facade.
//!
//! The router only ever talks to [`IpNameService`]; the wire protocol behind
//! it is someone else's problem. [`InProcessNetwork`] is the bundled
//! implementation: a process-local segment connecting every router in the
//! process, with IS-AT/WHO-HAS semantics faithful enough for quiet
//! advertisements to behave correctly.

use std::{sync::Arc, time::Duration};

use enumflags2::BitFlags;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::codec::TransportMask;

/// Advertisement lifetime granted when the underlying protocol does not say
/// otherwise.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// A found/lost-names event. `ttl = 0` withdraws the names.
#[derive(Clone, Debug)]
pub struct FoundNames {
    pub bus_addr: String,
    pub guid: String,
    pub transports: BitFlags<TransportMask>,
    pub names: Vec<String>,
    pub ttl: Duration,
}

pub trait IpNameService: Send + Sync {
    /// Install the sink for found/lost-name events.
    fn set_callback(&self, events: UnboundedSender<FoundNames>);
    /// Bring the service up. `listen_spec` is the connect address carried in
    /// this router's advertisements.
    fn enable(&self, guid: &str, listen_spec: &str);
    fn disable(&self);
    /// Advertise `name`; quiet advertisements answer probes but are never
    /// announced unsolicited.
    fn advertise(&self, name: &str, quiet: bool);
    fn cancel_advertise(&self, name: &str);
    fn find(&self, prefix: &str);
    fn cancel_find(&self, prefix: &str);
}

#[derive(Default)]
struct Node {
    guid: String,
    listen_spec: String,
    enabled: bool,
    advertised: Vec<(String, bool)>,
    finds: Vec<String>,
    events: Option<UnboundedSender<FoundNames>>,
}

impl Node {
    fn deliver(&self, event: FoundNames) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// A process-local discovery segment. Every router handed a node from the
/// same network sees the others' advertisements.
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    nodes: Arc<Mutex<Vec<Arc<Mutex<Node>>>>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self) -> Arc<InProcessNameService> {
        let node = Arc::new(Mutex::new(Node::default()));
        self.nodes.lock().push(node.clone());
        Arc::new(InProcessNameService {
            network: self.clone(),
            node,
        })
    }

    fn others(&self, node: &Arc<Mutex<Node>>) -> Vec<Arc<Mutex<Node>>> {
        self.nodes
            .lock()
            .iter()
            .filter(|other| !Arc::ptr_eq(other, node))
            .cloned()
            .collect()
    }
}

pub struct InProcessNameService {
    network: InProcessNetwork,
    node: Arc<Mutex<Node>>,
}

impl IpNameService for InProcessNameService {
    fn set_callback(&self, events: UnboundedSender<FoundNames>) {
        self.node.lock().events = Some(events);
    }

    fn enable(&self, guid: &str, listen_spec: &str) {
        let mut node = self.node.lock();
        node.guid = guid.to_string();
        node.listen_spec = listen_spec.to_string();
        node.enabled = true;
        trace!("name service enabled at {listen_spec}");
    }

    fn disable(&self) {
        let mut node = self.node.lock();
        node.enabled = false;
        node.advertised.clear();
        node.finds.clear();
    }

    fn advertise(&self, name: &str, quiet: bool) {
        let (guid, listen_spec, enabled) = {
            let mut node = self.node.lock();
            node.advertised.retain(|(n, _)| n != name);
            node.advertised.push((name.to_string(), quiet));
            (node.guid.clone(), node.listen_spec.clone(), node.enabled)
        };
        if !enabled || quiet {
            // Quiet advertisements wait for a WHO-HAS.
            return;
        }
        let event = FoundNames {
            bus_addr: listen_spec,
            guid,
            transports: TransportMask::Tcp.into(),
            names: vec![name.to_string()],
            ttl: DEFAULT_TTL,
        };
        for other in self.network.others(&self.node) {
            let other = other.lock();
            if other.enabled && other.finds.iter().any(|p| name.starts_with(p.as_str())) {
                other.deliver(event.clone());
            }
        }
    }

    fn cancel_advertise(&self, name: &str) {
        let (guid, listen_spec) = {
            let mut node = self.node.lock();
            node.advertised.retain(|(n, _)| n != name);
            (node.guid.clone(), node.listen_spec.clone())
        };
        let event = FoundNames {
            bus_addr: listen_spec,
            guid,
            transports: TransportMask::Tcp.into(),
            names: vec![name.to_string()],
            ttl: Duration::ZERO,
        };
        for other in self.network.others(&self.node) {
            let other = other.lock();
            if other.enabled && other.finds.iter().any(|p| name.starts_with(p.as_str())) {
                other.deliver(event.clone());
            }
        }
    }

    fn find(&self, prefix: &str) {
        {
            let mut node = self.node.lock();
            if !node.finds.iter().any(|p| p == prefix) {
                node.finds.push(prefix.to_string());
            }
        }
        // WHO-HAS: every node answers for matching names, quiet ones
        // included. The probing node's lock is not held while the answers
        // are collected.
        let events = self.node.lock().events.clone();
        let Some(events) = events else { return };
        for other in self.network.others(&self.node) {
            let response = {
                let other = other.lock();
                if !other.enabled {
                    continue;
                }
                let names: Vec<String> = other
                    .advertised
                    .iter()
                    .filter(|(name, _)| name.starts_with(prefix))
                    .map(|(name, _)| name.clone())
                    .collect();
                if names.is_empty() {
                    continue;
                }
                FoundNames {
                    bus_addr: other.listen_spec.clone(),
                    guid: other.guid.clone(),
                    transports: TransportMask::Tcp.into(),
                    names,
                    ttl: DEFAULT_TTL,
                }
            };
            let _ = events.send(response);
        }
    }

    fn cancel_find(&self, prefix: &str) {
        self.node.lock().finds.retain(|p| p != prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn enabled_node(
        network: &InProcessNetwork,
        guid: &str,
        spec: &str,
    ) -> (Arc<InProcessNameService>, mpsc::UnboundedReceiver<FoundNames>) {
        let ns = network.node();
        let (tx, rx) = mpsc::unbounded_channel();
        ns.set_callback(tx);
        ns.enable(guid, spec);
        (ns, rx)
    }

    #[test]
    fn gratuitous_advertisement_reaches_existing_finder() {
        let network = InProcessNetwork::new();
        let (advertiser, _rx_a) = enabled_node(&network, "a".repeat(32).as_str(), "tcp:r4addr=10.0.0.1,r4port=1");
        let (finder, mut rx_f) = enabled_node(&network, "b".repeat(32).as_str(), "tcp:r4addr=10.0.0.2,r4port=2");

        finder.find("org.acme.");
        advertiser.advertise("org.acme.svc", false);
        let event = rx_f.try_recv().unwrap();
        assert_eq!(event.names, vec!["org.acme.svc".to_string()]);
        assert_eq!(event.ttl, DEFAULT_TTL);
    }

    #[test]
    fn quiet_advertisement_only_answers_probes() {
        let network = InProcessNetwork::new();
        let (advertiser, _rx_a) = enabled_node(&network, "a".repeat(32).as_str(), "tcp:r4addr=10.0.0.1,r4port=1");
        let (finder, mut rx_f) = enabled_node(&network, "b".repeat(32).as_str(), "tcp:r4addr=10.0.0.2,r4port=2");

        finder.find("org.acme.");
        advertiser.advertise("org.acme.router", true);
        // No gratuitous IS-AT.
        assert!(rx_f.try_recv().is_err());

        // A WHO-HAS probe elicits the response.
        finder.cancel_find("org.acme.");
        finder.find("org.acme.");
        let event = rx_f.try_recv().unwrap();
        assert_eq!(event.names, vec!["org.acme.router".to_string()]);

        // Cancelling produces a lost event at the finder.
        advertiser.cancel_advertise("org.acme.router");
        let event = rx_f.try_recv().unwrap();
        assert!(event.ttl.is_zero());
    }
}
