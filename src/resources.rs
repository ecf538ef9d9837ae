//! Decoded views of the raw xDS resources the manager consumes.

use std::borrow::Cow;
use std::collections::BTreeSet;

use xds_api::pb::envoy::config::{listener::v3 as xds_listener, route::v3 as xds_route};
use xds_api::pb::envoy::extensions::filters::network::http_connection_manager::v3 as xds_http;

#[derive(Clone, Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("invalid xDS: {resource_name}: {message}")]
    InvalidXds {
        resource_name: String,
        message: Cow<'static, str>,
    },
}

impl ResourceError {
    fn for_xds(resource_name: String, message: String) -> Self {
        Self::InvalidXds {
            resource_name,
            message: message.into(),
        }
    }

    fn for_xds_static(resource_name: String, message: &'static str) -> Self {
        Self::InvalidXds {
            resource_name,
            message: message.into(),
        }
    }
}

/// A decoded CDS update: the cluster's discovery mode plus its
/// mode-dependent fields. This is the output of the (external) CDS decoder
/// and the value carried through to snapshot consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CdsUpdate {
    pub discovery: ClusterDiscovery,
}

/// How a cluster finds its members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterDiscovery {
    /// The cluster's members are other clusters.
    Aggregate { children: Vec<String> },
    /// Endpoints come from an EDS watch, on `eds_service_name` if set and
    /// the cluster's own name otherwise.
    Eds { eds_service_name: Option<String> },
    /// Endpoints come from resolving `dns_hostname`.
    LogicalDns { dns_hostname: String },
}

impl CdsUpdate {
    pub fn aggregate<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            discovery: ClusterDiscovery::Aggregate {
                children: children.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn eds(eds_service_name: Option<String>) -> Self {
        Self {
            discovery: ClusterDiscovery::Eds { eds_service_name },
        }
    }

    pub fn logical_dns(dns_hostname: impl Into<String>) -> Self {
        Self {
            discovery: ClusterDiscovery::LogicalDns {
                dns_hostname: dns_hostname.into(),
            },
        }
    }
}

/// How a Listener names its routes: by RDS reference or inline.
#[derive(Clone, Debug)]
pub(crate) enum ListenerRoutes {
    Rds(String),
    Inline(xds_route::RouteConfiguration),
}

/// Pull the route specifier out of a Listener's HTTP connection manager.
pub(crate) fn listener_routes(
    listener: &xds_listener::Listener,
) -> Result<ListenerRoutes, ResourceError> {
    use xds_http::http_connection_manager::RouteSpecifier;

    let conn_manager = http_connection_manager(listener)?;
    match conn_manager.route_specifier {
        Some(RouteSpecifier::Rds(rds)) => Ok(ListenerRoutes::Rds(rds.route_config_name)),
        Some(RouteSpecifier::RouteConfig(route_config)) => {
            Ok(ListenerRoutes::Inline(route_config))
        }
        _ => Err(ResourceError::for_xds_static(
            listener.name.clone(),
            "api_listener has no routes configured",
        )),
    }
}

fn http_connection_manager(
    listener: &xds_listener::Listener,
) -> Result<xds_http::HttpConnectionManager, ResourceError> {
    let api_listener = listener
        .api_listener
        .as_ref()
        .and_then(|l| l.api_listener.as_ref())
        .ok_or_else(|| {
            ResourceError::for_xds_static(listener.name.clone(), "Listener has no api_listener")
        })?;

    api_listener.to_msg().map_err(|e: prost::DecodeError| {
        ResourceError::for_xds(listener.name.clone(), format!("invalid api_listener: {e}"))
    })
}

/// The clusters a virtual host's routes statically depend on.
///
/// `cluster_header` actions select a cluster per request and carry no static
/// dependency, so they contribute nothing here.
pub(crate) fn route_clusters(vhost: &xds_route::VirtualHost) -> BTreeSet<String> {
    let mut clusters = BTreeSet::new();
    for route in &vhost.routes {
        let Some(xds_route::route::Action::Route(route_action)) = &route.action else {
            continue;
        };

        match &route_action.cluster_specifier {
            Some(xds_route::route_action::ClusterSpecifier::Cluster(cluster)) => {
                clusters.insert(cluster.clone());
            }
            Some(xds_route::route_action::ClusterSpecifier::WeightedClusters(
                weighted_clusters,
            )) => {
                for w in &weighted_clusters.clusters {
                    clusters.insert(w.name.clone());
                }
            }
            _ => continue,
        }
    }
    clusters
}
