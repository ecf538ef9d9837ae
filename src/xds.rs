//! The collaborator surface of the dependency manager: the xDS transport
//! client, the DNS resolver factory, and the downstream config watcher.
//!
//! Upstream callbacks are modeled as values on a single [Event] enum and
//! delivered to one consumer, so every state transition in the manager runs
//! serialized on one logical executor. Each watch registration gets a
//! [WatchId] (and each resolver a [ResolverId]) allocated by the manager;
//! events are tagged with the id of the watch that produced them, which lets
//! the manager drop late deliveries from watches it has already cancelled
//! instead of guarding every transition by hand.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tonic::Status;
use xds_api::pb::envoy::config::{
    endpoint::v3 as xds_endpoint, listener::v3 as xds_listener, route::v3 as xds_route,
};

use crate::config::XdsConfig;
use crate::resources::CdsUpdate;

/// The kinds of xDS resources the manager watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Listener,
    RouteConfiguration,
    Cluster,
    Endpoints,
}

/// Identity of a single watch registration.
///
/// A `WatchId` is allocated by the manager, passed to
/// [XdsClient::start_watch], and echoed back on every event the watch
/// produces. Ids are never reused within a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub(crate) u64);

/// Identity of a single DNS resolver, with the same role as [WatchId].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolverId(pub(crate) u64);

/// One delivery from an xDS watch.
///
/// `Changed` may be delivered any number of times with the latest value.
/// `Error` signals a transient control-plane failure and may be followed by
/// later successes. `DoesNotExist` is an authoritative negative.
#[derive(Debug)]
pub enum WatchEvent<T> {
    Changed(T),
    Error(Status),
    DoesNotExist,
}

/// An input to the dependency manager, from any of its upstream sources.
#[derive(Debug)]
pub enum Event {
    Listener(WatchId, WatchEvent<xds_listener::Listener>),
    RouteConfig(WatchId, WatchEvent<xds_route::RouteConfiguration>),
    Cluster(WatchId, WatchEvent<CdsUpdate>),
    Endpoints(WatchId, WatchEvent<xds_endpoint::ClusterLoadAssignment>),
    Resolved(ResolverId, Result<Vec<SocketAddr>, Status>),
}

/// A handle for delivering [Event]s to a running manager.
///
/// Cheap to clone. Sending to a manager that has shut down is a no-op.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<Event>);

impl EventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self(tx)
    }

    pub fn send(&self, event: Event) {
        if self.0.send(event).is_err() {
            tracing::trace!("dropping event for shut down manager");
        }
    }
}

/// The xDS transport client, by contract.
///
/// `start_watch` registers interest in a resource; the transport delivers
/// [WatchEvent]s tagged with `watch` until `cancel_watch` is called with the
/// same id. The manager never starts two watches with the same id, and never
/// cancels an id it did not start.
pub trait XdsClient: Send + 'static {
    fn start_watch(&mut self, kind: ResourceKind, name: &str, watch: WatchId);
    fn cancel_watch(&mut self, kind: ResourceKind, name: &str, watch: WatchId);
}

/// Creates DNS resolvers for LOGICAL_DNS clusters.
///
/// `hostname` is the cluster's `dns_hostname` verbatim, which may carry a
/// port (`"svc:443"`). The resolver delivers [Event::Resolved] values tagged
/// with `resolver` until its handle is dropped.
pub trait DnsResolverFactory: Send + 'static {
    fn create(&mut self, hostname: &str, resolver: ResolverId) -> Box<dyn DnsResolver>;
}

/// A live DNS resolution, destroyed by dropping the handle.
pub trait DnsResolver: Send + 'static {
    /// Hint that a re-resolution would be welcome. Purely advisory.
    fn update_resolution(&mut self);
}

/// The downstream consumer of reconciled configuration.
///
/// `on_error` and `on_resource_does_not_exist` fire only for listener- and
/// route-configuration-level failures that prevent any snapshot from
/// forming; per-cluster failures travel inside the snapshot's cluster map.
/// The `context` strings are `"Listener <name>"` and
/// `"RouteConfiguration <name>"`.
pub trait XdsConfigWatcher: Send + 'static {
    fn on_update(&mut self, config: XdsConfig);
    fn on_error(&mut self, context: String, status: Status);
    fn on_resource_does_not_exist(&mut self, context: String);
}
