use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque identifier of a peer, stable across all of its connections.
///
/// Peer ids are compared lexicographically; the ordering decides which
/// channel survives when both peers build one at the same level.
///
/// # Examples
///
/// ```rust
/// use peerlift::PeerId;
///
/// let alice = PeerId::from("alice@example.org/app");
/// let bob: PeerId = "bob@example.org/app".into();
/// assert!(alice < bob);
/// assert_eq!(alice.as_str(), "alice@example.org/app");
/// ```
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// Returns the id as a string slice.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peerlift::PeerId;
    ///
    /// let id = PeerId::from("carol");
    /// assert_eq!(id.as_str(), "carol");
    /// ```
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks if this id is empty, which never names a real peer.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId(Arc::from(value))
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        PeerId(Arc::from(value))
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_plain_string() {
        let id = PeerId::from("alice@example.org/app");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""alice@example.org/app""#);
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
