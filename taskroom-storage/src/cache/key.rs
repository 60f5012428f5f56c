//! Namespaced key system for the local store.
//!
//! Every key this engine writes starts with its namespace, so `clear_all`
//! can remove exactly the engine's data with one prefix delete and nothing
//! else sharing the backend is touched.

/// Separator byte between the namespace and the rest of the key.
///
/// `0xFF` never appears in UTF-8, so it cannot collide with namespace text.
const SEPARATOR: u8 = 0xFF;

/// Which family of data a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Single cached value.
    Entry,
    /// Typed collection store.
    Collection,
    /// Pending operation queue slot.
    Queue,
}

impl KeyKind {
    fn to_byte(self) -> u8 {
        match self {
            KeyKind::Entry => 0,
            KeyKind::Collection => 1,
            KeyKind::Queue => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(KeyKind::Entry),
            1 => Some(KeyKind::Collection),
            2 => Some(KeyKind::Queue),
            _ => None,
        }
    }
}

/// A backend key scoped to one engine namespace.
///
/// # Binary Format
///
/// `[namespace bytes][0xFF][kind byte][name bytes]`
///
/// Keys sort by namespace, then kind, then name, so prefix scans over a
/// namespace or a kind within it are contiguous ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedKey {
    namespace: String,
    kind: KeyKind,
    name: String,
}

impl NamespacedKey {
    pub fn new(namespace: impl Into<String>, kind: KeyKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Self::kind_prefix(&self.namespace, self.kind);
        bytes.extend_from_slice(self.name.as_bytes());
        bytes
    }

    /// Decode a key from bytes.
    ///
    /// Returns `None` if the separator is missing, the kind byte is unknown,
    /// or either text part is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let sep = bytes.iter().position(|b| *b == SEPARATOR)?;
        let namespace = std::str::from_utf8(&bytes[..sep]).ok()?;
        let kind = KeyKind::from_byte(*bytes.get(sep + 1)?)?;
        let name = std::str::from_utf8(&bytes[sep + 2..]).ok()?;
        Some(Self::new(namespace, kind, name))
    }

    /// Prefix covering every key of a namespace.
    pub fn namespace_prefix(namespace: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(namespace.len() + 1);
        prefix.extend_from_slice(namespace.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }

    /// Prefix covering every key of one kind within a namespace.
    pub fn kind_prefix(namespace: &str, kind: KeyKind) -> Vec<u8> {
        let mut prefix = Self::namespace_prefix(namespace);
        prefix.push(kind.to_byte());
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_decode_inverts_encode() {
        let key = NamespacedKey::new("taskroom", KeyKind::Collection, "tasks:s1");
        let decoded = NamespacedKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_namespaces_do_not_share_prefixes() {
        let a = NamespacedKey::new("task", KeyKind::Entry, "x").encode();
        let b = NamespacedKey::new("taskroom", KeyKind::Entry, "x").encode();
        assert!(a.starts_with(&NamespacedKey::namespace_prefix("task")));
        assert!(!b.starts_with(&NamespacedKey::namespace_prefix("task")));
    }

    #[test]
    fn test_kind_prefix_is_within_namespace_prefix() {
        let ns = NamespacedKey::namespace_prefix("taskroom");
        let queue = NamespacedKey::kind_prefix("taskroom", KeyKind::Queue);
        assert!(queue.starts_with(&ns));
        assert_eq!(queue.len(), ns.len() + 1);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(NamespacedKey::decode(b"no-separator").is_none());
        assert!(NamespacedKey::decode(&[b'a', SEPARATOR, 9, b'x']).is_none());
    }
}
