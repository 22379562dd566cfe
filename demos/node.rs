use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use peerlift::channel::secure::PlainLayer;
use peerlift::multiplex::Component;
use peerlift::protocol::command::Command;
use peerlift::protocol::datagram::Datagram;
use peerlift::provider::nat::{echo, NatProvider};
use peerlift::provider::relay::RelayProvider;
use peerlift::provider::tcp::TcpProvider;
use peerlift::registry::Incoming;
use peerlift::relay::memory::RelayHub;
use peerlift::{ConnectionManager, ManagerConfig, NatConfig, PeerId, RelayConfig, TcpConfig};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Providers to register on top of the relay.
    /// example: --provider tcp --provider udt
    #[arg(short, long)]
    provider: Vec<String>,
    /// Seconds allowed for the lift.
    #[arg(short, long)]
    timeout: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug)]
struct Say {
    text: String,
}

impl Command for Say {
    const NAME: &'static str = "say";
}

struct Printer;

impl Component for Printer {
    fn name(&self) -> &'static str {
        "printer"
    }

    fn commands(&self) -> Vec<&'static str> {
        vec![Say::NAME]
    }

    fn handle(&self, incoming: &Incoming) -> peerlift::Result<()> {
        let say: Say = serde_json::from_value(incoming.fields.clone())?;
        log::info!("{} says {:?}", incoming.from, say.text);
        Ok(())
    }
}

async fn node(
    hub: &RelayHub,
    id: &str,
    providers: &[String],
    echo_server: &str,
) -> anyhow::Result<ConnectionManager> {
    let loopback = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    let manager = ConnectionManager::new(ManagerConfig::default());
    manager.set_host_id(id.into());
    let (transport, events) = hub.join(id.into());
    let relay = RelayProvider::new(Arc::new(transport), events, RelayConfig::default());
    manager.add_provider(Arc::new(relay), 1)?;
    for provider in providers {
        match provider.as_str() {
            "tcp" => {
                let config = TcpConfig::default()
                    .set_bind_addr("127.0.0.1:0".parse()?)
                    .set_advertised(loopback.clone());
                let tcp = TcpProvider::new(config, Arc::new(PlainLayer), None);
                let addr = tcp.start().await?;
                log::info!("{id} listens on tcp {addr}");
                manager.add_provider(Arc::new(tcp), 11)?;
            }
            "udt" => {
                let config = NatConfig::default()
                    .set_echo_server(echo_server)
                    .set_advertised(loopback.clone());
                let nat = NatProvider::new(config, Arc::new(PlainLayer), None);
                manager.add_provider(Arc::new(nat), 10)?;
            }
            other => anyhow::bail!("unknown provider {other}"),
        }
    }
    manager.add_component(Arc::new(Printer))?;
    Ok(manager)
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Args { provider, timeout } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let providers = if provider.is_empty() {
        vec!["tcp".to_string(), "udt".to_string()]
    } else {
        provider
    };

    let echo_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let echo_addr = echo_socket.local_addr()?.to_string();
    tokio::spawn(async move {
        if let Err(e) = echo::serve(echo_socket).await {
            log::warn!("echo server {e:?}");
        }
    });

    let hub = RelayHub::new();
    let alice = node(&hub, "alice", &providers, &echo_addr).await?;
    let bob = node(&hub, "bob", &providers, &echo_addr).await?;
    let bob_id = PeerId::from("bob");

    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or(alice.config().lift_timeout);
    let level = alice.lift(&bob_id, timeout).await?;
    log::info!("alice reached bob on level {level}");

    let hello = Datagram::from_cmd(&Say {
        text: "hello".into(),
    })?;
    alice.send(&bob_id, &hello)?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    for manager in [&alice, &bob] {
        for c in manager.connections() {
            log::info!(
                "{:?} -> {} level={} stack={:?} requested={} delay={:?}",
                manager.host_id(),
                c.peer,
                c.level,
                c.info.stack,
                c.requested,
                c.delay
            );
        }
    }
    Ok(())
}
