use crate::error::{Error, Result};
use crate::protocol::peer_id::PeerId;
use crate::registry::Incoming;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A protocol handler owning a set of command names.
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn commands(&self) -> Vec<&'static str>;
    fn handle(&self, incoming: &Incoming) -> Result<()>;
    /// The channel set to `peer` changed.
    fn on_channel_change(&self, _peer: &PeerId) {}
}

#[derive(Default)]
struct Routes {
    owners: HashMap<&'static str, Arc<dyn Component>>,
    components: Vec<Arc<dyn Component>>,
}

/// Routes commands to the single component that registered them.
#[derive(Default)]
pub struct CommandMultiplexer {
    routes: RwLock<Routes>,
}

impl CommandMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_component(&self, component: Arc<dyn Component>) -> Result<()> {
        let mut routes = self.routes.write();
        let commands = component.commands();
        if let Some(taken) = commands.iter().find(|c| routes.owners.contains_key(*c)) {
            log::warn!(
                "{} wants command {taken} owned by {}",
                component.name(),
                routes.owners[taken].name()
            );
            return Err(Error::ExistsAlready);
        }
        if routes.components.iter().any(|c| c.name() == component.name()) {
            return Err(Error::ExistsAlready);
        }
        for command in commands {
            routes.owners.insert(command, component.clone());
        }
        routes.components.push(component);
        Ok(())
    }

    pub fn remove_component(&self, name: &str) -> Result<()> {
        let mut routes = self.routes.write();
        let before = routes.components.len();
        routes.components.retain(|c| c.name() != name);
        if routes.components.len() == before {
            return Err(Error::NotFound);
        }
        routes.owners.retain(|_, c| c.name() != name);
        Ok(())
    }

    pub fn owner(&self, command: &str) -> Option<&'static str> {
        self.routes.read().owners.get(command).map(|c| c.name())
    }

    pub fn dispatch(&self, incoming: &Incoming) -> Result<()> {
        let owner = self.routes.read().owners.get(incoming.cmd.as_str()).cloned();
        match owner {
            Some(component) => component.handle(incoming),
            None => {
                log::debug!("no owner for {} from {}", incoming.cmd, incoming.from);
                Err(Error::NotFound)
            }
        }
    }

    pub fn dist_channel_change(&self, peer: &PeerId) {
        let components = self.routes.read().components.clone();
        for component in components {
            component.on_channel_change(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelId;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        commands: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl Component for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
        fn commands(&self) -> Vec<&'static str> {
            self.commands.clone()
        }
        fn handle(&self, incoming: &Incoming) -> Result<()> {
            self.seen.lock().push(incoming.cmd.clone());
            Ok(())
        }
        fn on_channel_change(&self, peer: &PeerId) {
            self.seen.lock().push(format!("changed {peer}"));
        }
    }

    fn recorder(name: &'static str, commands: Vec<&'static str>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            commands,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn incoming(cmd: &str) -> Incoming {
        Incoming {
            from: "peer".into(),
            channel: ChannelId(1),
            cmd: cmd.to_string(),
            fields: serde_json::Value::Null,
            content: Bytes::new(),
        }
    }

    #[test]
    fn commands_have_one_owner() {
        let mux = CommandMultiplexer::new();
        let chat = recorder("chat", vec!["say", "leave"]);
        mux.add_component(chat.clone()).unwrap();
        let clash = recorder("other", vec!["join", "say"]);
        assert!(matches!(mux.add_component(clash), Err(Error::ExistsAlready)));
        assert_eq!(mux.owner("join"), None);
        mux.dispatch(&incoming("say")).unwrap();
        assert!(matches!(
            mux.dispatch(&incoming("join")),
            Err(Error::NotFound)
        ));
        assert_eq!(*chat.seen.lock(), vec!["say"]);
    }

    #[test]
    fn removal_frees_commands() {
        let mux = CommandMultiplexer::new();
        mux.add_component(recorder("chat", vec!["say"])).unwrap();
        mux.remove_component("chat").unwrap();
        assert!(matches!(mux.remove_component("chat"), Err(Error::NotFound)));
        let again = recorder("chat2", vec!["say"]);
        mux.add_component(again.clone()).unwrap();
        mux.dist_channel_change(&"bob".into());
        assert_eq!(*again.seen.lock(), vec!["changed bob"]);
    }
}
