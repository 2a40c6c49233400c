//! Match rules and the per-endpoint rule table driving broadcast delivery.

use std::str::FromStr;

use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    codec::{Message, MessageType},
    endpoint::EndpointId,
    name_table::NameTable,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("unknown match key `{0}`")]
    UnknownKey(String),
    #[error("malformed match rule near `{0}`")]
    Malformed(String),
    #[error("no such match rule")]
    NotFound,
}

/// A parsed match filter in the D-Bus `key='value'` syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub msg_type: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub destination: Option<String>,
    pub arg0: Option<String>,
    pub sessionless: Option<bool>,
}

impl MatchRule {
    /// Match the given message against this rule.
    ///
    /// Senders and destinations given as well-known names are resolved to
    /// their current owner through the name table before comparing.
    pub fn matches(&self, msg: &Message, names: &NameTable) -> bool {
        if let Some(msg_type) = self.msg_type {
            if msg.ty != msg_type {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if msg.interface.as_deref() != Some(interface) {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if msg.member.as_deref() != Some(member) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if msg.path.as_deref() != Some(path) {
                return false;
            }
        }
        if let Some(sessionless) = self.sessionless {
            if msg.is_sessionless() != sessionless {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            let resolved = if sender.starts_with(':') {
                Some(sender.clone())
            } else {
                names.lookup(sender)
            };
            if resolved.as_deref() != msg.sender.as_deref() {
                return false;
            }
        }
        if let Some(destination) = &self.destination {
            match &msg.destination {
                Some(dest) if dest.starts_with(':') => {
                    if dest != destination {
                        return false;
                    }
                }
                Some(dest) => match names.lookup(dest) {
                    Some(owner) if owner == *destination => (),
                    _ => return false,
                },
                None => return false,
            }
        }
        if let Some(arg0) = &self.arg0 {
            match msg.args.first().and_then(|arg| arg.as_str()) {
                Some(value) if value == arg0 => (),
                _ => return false,
            }
        }
        true
    }
}

impl FromStr for MatchRule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rule = MatchRule::default();
        for part in s.split(',').filter(|part| !part.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| RuleError::Malformed(part.to_string()))?;
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(|| RuleError::Malformed(part.to_string()))?;
            match key.trim() {
                "type" => {
                    rule.msg_type = Some(match value {
                        "method_call" => MessageType::MethodCall,
                        "method_return" => MessageType::MethodReturn,
                        "error" => MessageType::Error,
                        "signal" => MessageType::Signal,
                        other => return Err(RuleError::Malformed(other.to_string())),
                    })
                }
                "sender" => rule.sender = Some(value.to_string()),
                "interface" => rule.interface = Some(value.to_string()),
                "member" => rule.member = Some(value.to_string()),
                "path" => rule.path = Some(value.to_string()),
                "destination" => rule.destination = Some(value.to_string()),
                "arg0" => rule.arg0 = Some(value.to_string()),
                "sessionless" => rule.sessionless = Some(value == "t" || value == "true"),
                other => return Err(RuleError::UnknownKey(other.to_string())),
            }
        }
        Ok(rule)
    }
}

/// All endpoints' match rules, evaluated in insertion order.
pub struct RuleTable {
    rules: Mutex<Vec<(EndpointId, MatchRule)>>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, endpoint: EndpointId, rule: MatchRule) {
        self.rules.lock().push((endpoint, rule));
    }

    /// Remove the first rule of `endpoint` equal to `rule`.
    pub fn remove(&self, endpoint: EndpointId, rule: &MatchRule) -> Result<(), RuleError> {
        let mut rules = self.rules.lock();
        match rules
            .iter()
            .position(|(ep, r)| *ep == endpoint && r == rule)
        {
            Some(index) => {
                rules.remove(index);
                Ok(())
            }
            None => Err(RuleError::NotFound),
        }
    }

    pub fn remove_all(&self, endpoint: EndpointId) {
        self.rules.lock().retain(|(ep, _)| *ep != endpoint);
    }

    /// Endpoints with at least one rule matching `msg`, in first-match
    /// order. Once an endpoint matches, its remaining rules are skipped, so
    /// a broadcast is delivered at most once per endpoint.
    pub fn matching_endpoints(&self, msg: &Message, names: &NameTable) -> Vec<EndpointId> {
        let rules = self.rules.lock();
        let mut matched = Vec::new();
        for (endpoint, rule) in rules.iter() {
            if matched.contains(endpoint) {
                continue;
            }
            if rule.matches(msg, names) {
                matched.push(*endpoint);
            }
        }
        matched
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Registry;

    fn names() -> NameTable {
        NameTable::new(Registry::new()).0
    }

    fn signal(interface: &str, member: &str) -> Message {
        let mut msg = Message::signal("/", interface, member, vec![]);
        msg.sender = Some(":t.2".to_string());
        msg
    }

    #[test]
    fn parse_and_match() {
        let rule: MatchRule = "type='signal',interface='org.acme.Iface',member='Ping'"
            .parse()
            .unwrap();
        let names = names();
        assert!(rule.matches(&signal("org.acme.Iface", "Ping"), &names));
        assert!(!rule.matches(&signal("org.acme.Iface", "Pong"), &names));
        assert!(!rule.matches(&signal("org.acme.Other", "Ping"), &names));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("frob='x'".parse::<MatchRule>().is_err());
        assert!("interface=unquoted".parse::<MatchRule>().is_err());
        assert!("type='nonsense'".parse::<MatchRule>().is_err());
    }

    #[test]
    fn broadcast_hits_each_endpoint_once() {
        let table = RuleTable::new();
        let registry = Registry::new();
        let a = registry.mint_id();
        let b = registry.mint_id();
        // Two rules for `a` both match; `a` must still appear once, and
        // before `b` (insertion order).
        table.add(a, "interface='org.acme.Iface'".parse().unwrap());
        table.add(b, "member='Ping'".parse().unwrap());
        table.add(a, "type='signal'".parse().unwrap());

        let names = names();
        let matched = table.matching_endpoints(&signal("org.acme.Iface", "Ping"), &names);
        assert_eq!(matched, vec![a, b]);
    }

    #[test]
    fn remove_unknown_rule_fails() {
        let table = RuleTable::new();
        let registry = Registry::new();
        let a = registry.mint_id();
        let rule: MatchRule = "member='Ping'".parse().unwrap();
        table.add(a, rule.clone());
        assert!(table.remove(a, &rule).is_ok());
        assert_eq!(table.remove(a, &rule), Err(RuleError::NotFound));
    }
}
