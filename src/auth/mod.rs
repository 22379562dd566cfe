use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::command::{
    ChannelAccept, ChannelFail, Command, CreateChannel, CreateChannelAccept,
};
use crate::protocol::datagram::{Datagram, DatagramReader};
use crate::protocol::peer_id::PeerId;
use std::sync::Arc;
use std::time::Duration;

mod certs;

pub use certs::{fingerprint, Authentication};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    SentCreateChannel,
    WaitForCreateChannel,
    SentCreateChannelAccept,
    Finished,
    Timeout,
    AuthError,
}

/// Identity confirmation over a freshly built channel.
///
/// ```text
/// connecting                         passive
///   createChannel{from,to}      -->
///                               <--  createChannelAccept{from,to}
///   channelAccept{from,to}      -->
/// ```
///
/// When the channel is authenticated and encrypted, certificate
/// fingerprints ride along and a full certificate is only sent when the
/// fingerprint the other side holds for us is stale.
pub struct AuthHandshake<'a> {
    channel: &'a dyn Channel,
    me: PeerId,
    auth: Option<Arc<Authentication>>,
    reader: DatagramReader,
    state: AuthState,
}

impl<'a> AuthHandshake<'a> {
    pub fn new(channel: &'a dyn Channel, me: PeerId) -> Self {
        Self {
            channel,
            me,
            auth: None,
            reader: DatagramReader::new(),
            state: AuthState::Idle,
        }
    }

    pub fn with_authentication(mut self, auth: Option<Arc<Authentication>>) -> Self {
        self.auth = auth;
        self
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Active side: proves to `other` that we are who we claim.
    pub async fn connect(&mut self, other: &PeerId, timeout: Duration) -> Result<()> {
        let result = tokio::time::timeout(timeout, self.run_connect(other)).await;
        self.finish(result.map_err(Error::from).and_then(|r| r))
    }

    /// Passive side: waits for `createChannel` and returns the peer that
    /// sent it. With `expected` set, any other sender is rejected.
    pub async fn passive(&mut self, expected: Option<&PeerId>, timeout: Duration) -> Result<PeerId> {
        let result = tokio::time::timeout(timeout, self.run_passive(expected)).await;
        self.finish(result.map_err(Error::from).and_then(|r| r))
    }

    async fn run_connect(&mut self, other: &PeerId) -> Result<()> {
        let auth = self.cert_exchange();
        let create = CreateChannel {
            from: self.me.clone(),
            to: other.clone(),
            version: VERSION.to_string(),
            to_cert_fp: auth.as_ref().and_then(|a| a.fingerprint_of(other)),
        };
        self.send(&create)?;
        self.state = AuthState::SentCreateChannel;

        let accept: CreateChannelAccept = self.expect().await?;
        if accept.from != *other || accept.to != self.me {
            return Err(self.reject(format!(
                "createChannelAccept from {} to {}",
                accept.from, accept.to
            )));
        }
        let mut cert = None;
        if let Some(auth) = auth {
            if let Some(their) = accept.cert {
                auth.update(other.clone(), their);
            }
            if accept.to_cert_fp != auth.own_fingerprint() {
                cert = auth.certificate();
            }
        }
        self.send(&ChannelAccept {
            from: self.me.clone(),
            to: other.clone(),
            cert,
        })
    }

    async fn run_passive(&mut self, expected: Option<&PeerId>) -> Result<PeerId> {
        let auth = self.cert_exchange();
        self.state = AuthState::WaitForCreateChannel;
        let create: CreateChannel = self.expect().await?;
        if expected.is_some_and(|e| *e != create.from) || create.to != self.me {
            return Err(self.reject(format!(
                "createChannel from {} to {}",
                create.from, create.to
            )));
        }
        let other = create.from;
        let mut accept = CreateChannelAccept {
            from: self.me.clone(),
            to: other.clone(),
            version: VERSION.to_string(),
            cert: None,
            to_cert_fp: None,
        };
        if let Some(auth) = &auth {
            if create.to_cert_fp != auth.own_fingerprint() {
                accept.cert = auth.certificate();
            }
            accept.to_cert_fp = auth.fingerprint_of(&other);
        }
        self.send(&accept)?;
        self.state = AuthState::SentCreateChannelAccept;

        let done: ChannelAccept = self.expect().await?;
        if done.from != other || done.to != self.me {
            return Err(self.reject(format!("channelAccept from {} to {}", done.from, done.to)));
        }
        if let (Some(auth), Some(cert)) = (auth, done.cert) {
            auth.update(other.clone(), cert);
        }
        Ok(other)
    }

    fn cert_exchange(&self) -> Option<Arc<Authentication>> {
        let info = self.channel.info();
        if info.authenticated && info.encrypted {
            self.auth.clone()
        } else {
            None
        }
    }

    fn send<C: Command>(&self, cmd: &C) -> Result<()> {
        let buf = Datagram::from_cmd(cmd)?.encode()?;
        self.channel.write(buf).map_err(|e| {
            log::debug!("auth send {} {e:?}", C::NAME);
            Error::ConnectionError
        })
    }

    /// Waits for `C`; `channelFail` ends the handshake with the transmitted error.
    async fn expect<C: Command>(&mut self) -> Result<C> {
        let datagram = self.next().await?;
        let (name, fields) = match datagram.command() {
            Ok(command) => command,
            Err(e) => return Err(self.reject(format!("{e}"))),
        };
        if name == ChannelFail::NAME {
            let fail: ChannelFail = serde_json::from_value(fields)
                .map_err(|e| Error::BadProtocol(e.to_string()))?;
            log::debug!("remote failed handshake: {} {}", fail.error, fail.msg);
            return Err(Error::from_name(&fail.error));
        }
        if name != C::NAME {
            return Err(self.reject(format!("expected {}, got {name}", C::NAME)));
        }
        serde_json::from_value(fields).map_err(|e| self.reject(e.to_string()))
    }

    async fn next(&mut self) -> Result<Datagram> {
        let notify = self.channel.changed();
        loop {
            match self.reader.read(self.channel) {
                Ok(datagram) => return Ok(datagram),
                Err(Error::NotEnough) => {}
                Err(e) => return Err(Error::BadProtocol(e.to_string())),
            }
            if let Some(e) = self.channel.error() {
                return Err(e);
            }
            notify.notified().await;
        }
    }

    /// Tells the other side about a protocol violation.
    fn reject(&self, msg: String) -> Error {
        let error = Error::BadProtocol(msg.clone());
        let fail = ChannelFail {
            error: error.name().to_string(),
            msg,
        };
        if let Err(e) = self.send(&fail) {
            log::debug!("could not send channelFail {e:?}");
        }
        error
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(v) => {
                self.state = AuthState::Finished;
                Ok(v)
            }
            Err(Error::Timeout) => {
                self.state = AuthState::Timeout;
                Err(Error::Timeout)
            }
            Err(e) => {
                self.state = AuthState::AuthError;
                let e = self.channel.error().unwrap_or(e);
                log::debug!("auth handshake with channel failed {e:?}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local::{pair, pair_with, LocalChannel};
    use crate::channel::ChannelInfo;

    fn secure_pair() -> (LocalChannel, LocalChannel) {
        pair_with(ChannelInfo {
            stack: vec!["local", "tls"],
            authenticated: true,
            encrypted: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn both_sides_finish() {
        let (a, b) = pair();
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");
        let mut active = AuthHandshake::new(&a, alice.clone());
        let mut passive = AuthHandshake::new(&b, bob.clone());
        let timeout = Duration::from_secs(1);
        let (r1, r2) = tokio::join!(active.connect(&bob, timeout), passive.passive(None, timeout));
        r1.unwrap();
        assert_eq!(r2.unwrap(), alice);
        assert_eq!(active.state(), AuthState::Finished);
        assert_eq!(passive.state(), AuthState::Finished);
    }

    #[tokio::test]
    async fn wrong_target_is_rejected() {
        let (a, b) = pair();
        let mut active = AuthHandshake::new(&a, "alice".into());
        let mut passive = AuthHandshake::new(&b, "bob".into());
        let timeout = Duration::from_secs(1);
        let carol = PeerId::from("carol");
        let (r1, r2) = tokio::join!(active.connect(&carol, timeout), passive.passive(None, timeout));
        assert!(matches!(r2, Err(Error::BadProtocol(_))));
        assert!(matches!(r1, Err(Error::BadProtocol(_))));
        assert_eq!(active.state(), AuthState::AuthError);
    }

    #[tokio::test]
    async fn unexpected_sender_is_rejected() {
        let (a, b) = pair();
        let mut active = AuthHandshake::new(&a, "mallory".into());
        let mut passive = AuthHandshake::new(&b, "bob".into());
        let timeout = Duration::from_secs(1);
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");
        let (r1, r2) = tokio::join!(
            active.connect(&bob, timeout),
            passive.passive(Some(&alice), timeout)
        );
        assert!(r1.is_err());
        assert!(r2.is_err());
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (a, _b) = pair();
        let mut active = AuthHandshake::new(&a, "alice".into());
        let r = active.connect(&"bob".into(), Duration::from_millis(30)).await;
        assert!(matches!(r, Err(Error::Timeout)));
        assert_eq!(active.state(), AuthState::Timeout);
    }

    #[tokio::test]
    async fn certificates_are_exchanged_once() {
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");
        let alice_auth = Arc::new(Authentication::with_certificate("alice-cert"));
        let bob_auth = Arc::new(Authentication::with_certificate("bob-cert"));
        let timeout = Duration::from_secs(1);

        for _ in 0..2 {
            let (a, b) = secure_pair();
            let mut active =
                AuthHandshake::new(&a, alice.clone()).with_authentication(Some(alice_auth.clone()));
            let mut passive =
                AuthHandshake::new(&b, bob.clone()).with_authentication(Some(bob_auth.clone()));
            let (r1, r2) =
                tokio::join!(active.connect(&bob, timeout), passive.passive(None, timeout));
            r1.unwrap();
            r2.unwrap();
        }
        assert_eq!(alice_auth.get(&bob).as_deref(), Some("bob-cert"));
        assert_eq!(bob_auth.get(&alice).as_deref(), Some("alice-cert"));
    }

    #[tokio::test]
    async fn plain_channels_skip_certificates() {
        let (a, b) = pair();
        let alice_auth = Arc::new(Authentication::with_certificate("alice-cert"));
        let bob_auth = Arc::new(Authentication::with_certificate("bob-cert"));
        let mut active = AuthHandshake::new(&a, "alice".into()).with_authentication(Some(alice_auth.clone()));
        let mut passive = AuthHandshake::new(&b, "bob".into()).with_authentication(Some(bob_auth.clone()));
        let timeout = Duration::from_secs(1);
        let bob = PeerId::from("bob");
        let (r1, r2) = tokio::join!(active.connect(&bob, timeout), passive.passive(None, timeout));
        r1.unwrap();
        r2.unwrap();
        assert!(alice_auth.get(&"bob".into()).is_none());
        assert!(bob_auth.get(&"alice".into()).is_none());
    }

    #[tokio::test]
    async fn remote_fail_is_propagated() {
        let (a, b) = pair();
        let fail = ChannelFail {
            error: Error::AuthError.name().to_string(),
            msg: "no".into(),
        };
        b.write(Datagram::from_cmd(&fail).unwrap().encode().unwrap()).unwrap();
        let mut active = AuthHandshake::new(&a, "alice".into());
        let r = active.connect(&"bob".into(), Duration::from_secs(1)).await;
        assert!(matches!(r, Err(Error::AuthError)));
    }
}
