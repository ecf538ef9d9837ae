//! The serializing actor around [DependencyManager].
//!
//! All upstream events and all downstream requests funnel into one tokio
//! task, so every state transition in the manager runs on a single logical
//! executor with no locks. [XdsDependencyManager] is the handle the rest of
//! the process holds on to.

use tokio::sync::mpsc;
use tracing::debug;

use crate::manager::{DependencyManager, ManagerOptions};
use crate::xds::{DnsResolverFactory, Event, EventSender, XdsClient, XdsConfigWatcher};

enum Command {
    Subscribe(String),
    Release(String),
    UpdateResolution,
    Shutdown,
}

/// A running dependency manager.
///
/// Dropping the handle shuts the manager down: every watch and resolver is
/// cancelled and no further snapshots are emitted.
pub struct XdsDependencyManager {
    commands: mpsc::UnboundedSender<Command>,
}

impl XdsDependencyManager {
    /// Build a manager and spawn its event loop on the current tokio
    /// runtime.
    ///
    /// The client and resolver factory are built through closures that
    /// receive the [EventSender] they should deliver their events on.
    pub fn spawn<C, R, W>(client: C, resolvers: R, watcher: W, options: ManagerOptions) -> Self
    where
        C: FnOnce(EventSender) -> Box<dyn XdsClient>,
        R: FnOnce(EventSender) -> Box<dyn DnsResolverFactory>,
        W: XdsConfigWatcher,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let events = EventSender::new(event_tx);
        let client = client(events.clone());
        let resolvers = resolvers(events);

        let manager = DependencyManager::new(client, resolvers, Box::new(watcher), options);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(manager, event_rx, command_rx));

        Self {
            commands: command_tx,
        }
    }

    /// Pin a cluster into the config independently of the current routes.
    ///
    /// The returned guard releases the subscription when dropped or when
    /// [release](ClusterSubscription::release) is called, whichever happens
    /// first.
    pub fn subscribe_to_cluster(&self, name: impl Into<String>) -> ClusterSubscription {
        let name = name.into();
        let _ = self.commands.send(Command::Subscribe(name.clone()));
        ClusterSubscription {
            name: Some(name),
            commands: self.commands.clone(),
        }
    }

    /// Hint every LOGICAL_DNS resolver to re-resolve.
    pub fn update_resolution(&self) {
        let _ = self.commands.send(Command::UpdateResolution);
    }

    /// Shut the manager down. Equivalent to dropping the handle.
    pub fn shutdown(self) {}
}

impl Drop for XdsDependencyManager {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// A pinned cluster subscription. Releasing is one-shot: the first of an
/// explicit [release](Self::release) or the drop wins, anything after is a
/// no-op.
pub struct ClusterSubscription {
    name: Option<String>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ClusterSubscription {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(name) = self.name.take() {
            let _ = self.commands.send(Command::Release(name));
        }
    }
}

impl Drop for ClusterSubscription {
    fn drop(&mut self) {
        self.release_inner();
    }
}

async fn run(
    mut manager: DependencyManager,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Subscribe(name)) => manager.add_cluster_subscription(&name),
                Some(Command::Release(name)) => manager.release_cluster_subscription(&name),
                Some(Command::UpdateResolution) => manager.update_resolution(),
                Some(Command::Shutdown) | None => break,
            },
            event = events.recv() => match event {
                Some(event) => manager.handle_event(event),
                None => break,
            },
        }
    }

    debug!("dependency manager loop exiting");
    manager.destroy();
}
