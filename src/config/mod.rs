use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const CHANNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub(crate) const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const PING_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const LIFT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub close_timeout: Duration,
    pub channel_idle_timeout: Duration,
    pub idle_check_interval: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub lift_timeout: Duration,
    pub enable_ping: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            close_timeout: CLOSE_TIMEOUT,
            channel_idle_timeout: CHANNEL_IDLE_TIMEOUT,
            idle_check_interval: IDLE_CHECK_INTERVAL,
            ping_interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            lift_timeout: LIFT_TIMEOUT,
            enable_ping: true,
        }
    }
}

impl ManagerConfig {
    pub fn set_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }
    pub fn set_channel_idle_timeout(mut self, channel_idle_timeout: Duration) -> Self {
        self.channel_idle_timeout = channel_idle_timeout;
        self
    }
    pub fn set_idle_check_interval(mut self, idle_check_interval: Duration) -> Self {
        self.idle_check_interval = idle_check_interval;
        self
    }
    pub fn set_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }
    pub fn set_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }
    pub fn set_lift_timeout(mut self, lift_timeout: Duration) -> Self {
        self.lift_timeout = lift_timeout;
        self
    }
    pub fn set_enable_ping(mut self, enable_ping: bool) -> Self {
        self.enable_ping = enable_ping;
        self
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub passive_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            passive_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    pub fn set_passive_timeout(mut self, passive_timeout: Duration) -> Self {
        self.passive_timeout = passive_timeout;
        self
    }
}

#[derive(Clone, Debug)]
pub struct TcpConfig {
    pub bind_addr: SocketAddr,
    /// Addresses announced to peers. Empty means the local IPv4 interfaces.
    pub advertised: Vec<IpAddr>,
    pub timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            advertised: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl TcpConfig {
    pub fn set_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }
    pub fn set_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }
    pub fn set_advertised(mut self, advertised: Vec<IpAddr>) -> Self {
        self.advertised = advertised;
        self
    }
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Clone, Debug)]
pub struct NatConfig {
    pub echo_server: Option<String>,
    pub max_punch_tries: usize,
    pub punch_retry_interval: Duration,
    pub remote_timeout: Duration,
    /// A channel with unacknowledged data and nothing heard from the peer
    /// for this long is considered dead.
    pub link_timeout: Duration,
    /// Internal candidates announced to peers. Empty means the local IPv4 interfaces.
    pub advertised: Vec<IpAddr>,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            echo_server: None,
            max_punch_tries: 5,
            punch_retry_interval: Duration::from_secs(1),
            remote_timeout: Duration::from_secs(10),
            link_timeout: Duration::from_secs(15),
            advertised: Vec::new(),
        }
    }
}

impl NatConfig {
    pub fn set_echo_server(mut self, echo_server: impl Into<String>) -> Self {
        self.echo_server.replace(echo_server.into());
        self
    }
    pub fn set_max_punch_tries(mut self, max_punch_tries: usize) -> Self {
        self.max_punch_tries = max_punch_tries;
        self
    }
    pub fn set_punch_retry_interval(mut self, punch_retry_interval: Duration) -> Self {
        self.punch_retry_interval = punch_retry_interval;
        self
    }
    pub fn set_remote_timeout(mut self, remote_timeout: Duration) -> Self {
        self.remote_timeout = remote_timeout;
        self
    }
    pub fn set_link_timeout(mut self, link_timeout: Duration) -> Self {
        self.link_timeout = link_timeout;
        self
    }
    pub fn set_advertised(mut self, advertised: Vec<IpAddr>) -> Self {
        self.advertised = advertised;
        self
    }
}
