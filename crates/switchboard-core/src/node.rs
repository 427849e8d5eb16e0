//! Node identity.
//!
//! Every gateway process mints one [`NodeId`] at startup and keeps it for
//! its whole lifetime. The presence directory stores this value to record
//! which process owns a user's live connection.

use std::fmt;
use uuid::Uuid;

/// Length of the random suffix appended to every node id.
const SUFFIX_LEN: usize = 8;

/// Identifier of one running gateway process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an existing id, e.g. one read back from the presence directory.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh id of the form `{hostname}-{port}-{suffix}`.
    ///
    /// Without a hostname the id falls back to `server-{suffix}`. The random
    /// suffix keeps two processes on the same host and port (a restart, for
    /// instance) from ever sharing an id.
    #[must_use]
    pub fn generate(hostname: Option<&str>, port: u16) -> Self {
        let suffix = random_suffix();
        match hostname.map(str::trim).filter(|h| !h.is_empty()) {
            Some(host) => Self(format!("{host}-{port}-{suffix}")),
            None => Self(format!("server-{suffix}")),
        }
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn random_suffix() -> String {
    let mut simple = Uuid::new_v4().simple().to_string();
    simple.truncate(SUFFIX_LEN);
    simple
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_format() {
        let id = NodeId::generate(Some("chat-1"), 8081);
        let parts: Vec<&str> = id.as_str().rsplitn(2, '-').collect();
        assert_eq!(parts[1], "chat-1-8081");
        assert_eq!(parts[0].len(), SUFFIX_LEN);
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_node_id_fallback() {
        assert!(NodeId::generate(None, 8081).as_str().starts_with("server-"));
        assert!(NodeId::generate(Some("  "), 8081).as_str().starts_with("server-"));
    }

    #[test]
    fn test_node_ids_unique() {
        let a = NodeId::generate(Some("host"), 8081);
        let b = NodeId::generate(Some("host"), 8081);
        assert_ne!(a, b);
    }
}
