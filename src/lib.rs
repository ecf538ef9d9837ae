//! An xDS dependency manager.
//!
//! An xDS control plane hands out configuration as a tree of resources: a
//! Listener names a RouteConfiguration (or inlines one), the matching
//! virtual host's routes name Clusters, and each cluster discovers its
//! endpoints over EDS or DNS - with aggregate clusters fanning out into
//! more clusters along the way. The pieces arrive independently, in any
//! order, and can change or fail at any time.
//!
//! This crate subscribes to the right resources in the right order, follows
//! references as they change, prunes clusters nothing points at anymore,
//! and hands a single downstream watcher one complete [XdsConfig] snapshot
//! exactly when the whole tree has settled. Transport, resource decoding,
//! and DNS resolution stay behind the traits in [xds]; the reconciliation
//! itself is sans-io and runs serialized on a single task.

mod config;
pub use config::{ClusterChildren, ClusterConfig, XdsConfig};

mod endpoints;
pub use endpoints::{
    DropCategory, Endpoint, EndpointAddress, EndpointNormalizer, EndpointResource, Locality,
    LocalityEntry, PriorityEntry, WeightedEndpoint,
};

mod forest;

mod manager;
pub use manager::{DependencyManager, ManagerOptions};

mod resources;
pub use resources::{CdsUpdate, ClusterDiscovery, ResourceError};

mod task;
pub use task::{ClusterSubscription, XdsDependencyManager};

mod vhost;
pub use vhost::find_virtual_host;

mod xds;
pub use xds::{
    DnsResolver, DnsResolverFactory, Event, EventSender, ResolverId, ResourceKind, WatchEvent,
    WatchId, XdsClient, XdsConfigWatcher,
};

#[cfg(test)]
pub(crate) mod test;
