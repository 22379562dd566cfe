use crate::protocol::peer_id::PeerId;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Hex encoded SHA-256 of a certificate.
pub fn fingerprint(cert: &str) -> String {
    let digest = Sha256::digest(cert.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        _ = write!(out, "{b:02x}");
    }
    out
}

/// Own certificate plus the certificates learned from peers.
///
/// Certificates are opaque (PEM) text; validating them is the job of the
/// secure layer.
#[derive(Default)]
pub struct Authentication {
    certificate: RwLock<Option<String>>,
    peers: DashMap<PeerId, String>,
}

impl Authentication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_certificate(cert: impl Into<String>) -> Self {
        let auth = Self::default();
        auth.set_certificate(cert);
        auth
    }

    pub fn set_certificate(&self, cert: impl Into<String>) {
        self.certificate.write().replace(cert.into());
    }

    pub fn certificate(&self) -> Option<String> {
        self.certificate.read().clone()
    }

    pub fn own_fingerprint(&self) -> Option<String> {
        self.certificate.read().as_deref().map(fingerprint)
    }

    pub fn update(&self, peer: PeerId, cert: String) {
        log::debug!("certificate of {peer} updated");
        self.peers.insert(peer, cert);
    }

    pub fn get(&self, peer: &PeerId) -> Option<String> {
        self.peers.get(peer).map(|c| c.value().clone())
    }

    pub fn fingerprint_of(&self, peer: &PeerId) -> Option<String> {
        self.peers.get(peer).map(|c| fingerprint(c.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn cache_by_peer() {
        let auth = Authentication::with_certificate("mine");
        assert_eq!(auth.own_fingerprint(), Some(fingerprint("mine")));
        let bob = PeerId::from("bob");
        assert_eq!(auth.fingerprint_of(&bob), None);
        auth.update(bob.clone(), "bobs".into());
        assert_eq!(auth.get(&bob).as_deref(), Some("bobs"));
        assert_eq!(auth.fingerprint_of(&bob), Some(fingerprint("bobs")));
    }
}
