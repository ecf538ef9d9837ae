//! The snapshot handed to the downstream watcher.

use std::collections::BTreeMap;

use tonic::Status;
use xds_api::pb::envoy::config::{listener::v3 as xds_listener, route::v3 as xds_route};

use crate::endpoints::EndpointResource;
use crate::resources::CdsUpdate;

/// One complete, coherent view of the resource tree: the latest listener,
/// the route configuration it selected, the virtual host serving the
/// data-plane authority, and every cluster currently in the forest.
///
/// A snapshot is only emitted once every reachable cluster has produced an
/// outcome, so consumers never see a half-assembled tree.
#[derive(Clone, Debug)]
pub struct XdsConfig {
    pub listener: xds_listener::Listener,
    pub route_config: xds_route::RouteConfiguration,
    pub virtual_host: xds_route::VirtualHost,
    /// All clusters in the forest, not just the route-referenced roots.
    /// Per-cluster failures land here as `Err` instead of failing the
    /// snapshot.
    pub clusters: BTreeMap<String, Result<ClusterConfig, Status>>,
}

/// A successfully discovered cluster and whatever hangs below it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    pub cluster: CdsUpdate,
    pub children: ClusterChildren,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterChildren {
    /// The direct children of an aggregate cluster, in the order the
    /// aggregate listed them. Each name has its own entry in the cluster
    /// map.
    Aggregate { leaf_clusters: Vec<String> },
    /// Endpoint data for an EDS or LOGICAL_DNS cluster. `endpoints` is
    /// `None` until (or unless) discovery produced an assignment;
    /// `resolution_note` explains why endpoints are missing without being a
    /// hard error.
    Endpoints {
        endpoints: Option<EndpointResource>,
        resolution_note: Option<String>,
    },
}
