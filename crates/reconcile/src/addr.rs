//! Resource identities and instance addresses.
//!
//! A declaration is identified by `type.name`. Cardinality expansion turns a
//! declaration into concrete instances addressed as `type.name` (singleton),
//! `type.name[0]` (count), or `type.name["key"]` (for_each). Addresses key
//! the state document, the plan, and every report, so they serialize as
//! plain strings.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Identity of one declaration: resource type plus local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Parse a `type.name` string. Both segments must be identifiers
    /// (letter or underscore, then letters, digits, underscores) so that
    /// every declared resource stays referenceable from expressions.
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, name) = s.split_once('.')?;
        if is_ident(kind) && is_ident(name) {
            Some(Self::new(kind, name))
        } else {
            None
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Which instance of a declaration an address names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceKey {
    /// The declaration has no count or for_each
    None,
    /// `count` instance, zero-based
    Index(i64),
    /// `for_each` instance, keyed by map key
    Key(String),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::None => Ok(()),
            InstanceKey::Index(i) => write!(f, "[{i}]"),
            InstanceKey::Key(k) => write!(f, "[{k:?}]"),
        }
    }
}

/// Address of one concrete resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub id: ResourceId,
    pub key: InstanceKey,
}

impl Address {
    pub fn single(id: ResourceId) -> Self {
        Self {
            id,
            key: InstanceKey::None,
        }
    }

    pub fn indexed(id: ResourceId, index: i64) -> Self {
        Self {
            id,
            key: InstanceKey::Index(index),
        }
    }

    pub fn keyed(id: ResourceId, key: impl Into<String>) -> Self {
        Self {
            id,
            key: InstanceKey::Key(key.into()),
        }
    }

    /// Parse an address string as produced by [`Address`]'s `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        let Some(open) = s.find('[') else {
            return ResourceId::parse(s).map(Self::single);
        };
        let id = ResourceId::parse(&s[..open])?;
        let rest = &s[open..];
        let inner = rest.strip_prefix('[')?.strip_suffix(']')?;
        if let Some(quoted) = inner.strip_prefix('"') {
            let key = quoted.strip_suffix('"')?;
            // Display escapes with {:?}; expansion restricts keys so that
            // no escape sequences can appear here.
            if key.contains('"') || key.contains('\\') {
                return None;
            }
            Some(Self::keyed(id, key))
        } else {
            let index: i64 = inner.parse().ok()?;
            Some(Self::indexed(id, index))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.id, self.key)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).ok_or_else(|| D::Error::custom(format!("invalid address: {s:?}")))
    }
}
