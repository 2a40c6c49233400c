use std::fmt;

use serde::{Deserialize, Serialize};

/// A router identity: 32 lowercase hex characters, minted at startup.
///
/// The first eight characters form the "short" GUID that prefixes every
/// unique name minted by this router (`:<short>.<index>`).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid(String);

impl Guid {
    pub fn generate() -> Self {
        let mut s = String::with_capacity(32);
        for _ in 0..32 {
            s.push(char::from_digit(fastrand::u32(0..16), 16).unwrap());
        }
        Self(s)
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The short GUID embedded in a unique name, if `name` is one.
    pub fn short_from_unique_name(name: &str) -> Option<&str> {
        let rest = name.strip_prefix(':')?;
        let (short, _) = rest.split_once('.')?;
        Some(short)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_is_prefix() {
        let guid = Guid::generate();
        assert_eq!(guid.as_str().len(), 32);
        assert!(guid.as_str().starts_with(guid.short()));
    }

    #[test]
    fn short_from_unique_name() {
        assert_eq!(
            Guid::short_from_unique_name(":deadbeef.4"),
            Some("deadbeef")
        );
        assert_eq!(Guid::short_from_unique_name("org.acme.svc"), None);
        assert_eq!(Guid::short_from_unique_name(":noindex"), None);
    }
}
