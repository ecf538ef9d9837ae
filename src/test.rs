//! Test constructors for xDS resources, plus fake collaborators.
//!
//! Use the macros as a shorthand for writing out full xDS resource structs.

use std::sync::{Arc, Mutex};

use tonic::Status;
use xds_api::pb::envoy::config::{
    core::v3 as xds_core, endpoint::v3 as xds_endpoint, listener::v3 as xds_listener,
    route::v3 as xds_route,
};
use xds_api::pb::envoy::extensions::filters::network::http_connection_manager::v3 as xds_http;
use xds_api::pb::envoy::r#type::v3::fractional_percent::DenominatorType;
use xds_api::pb::envoy::r#type::v3::FractionalPercent;
use xds_api::pb::google::protobuf;

use crate::config::XdsConfig;
use crate::xds::{
    DnsResolver, DnsResolverFactory, ResolverId, ResourceKind, WatchId, XdsClient,
    XdsConfigWatcher,
};

macro_rules! vhost {
    ($name:expr, $domains:expr, [$($route:expr),*$(,)?]$(,)?) => {
        crate::test::virtual_host($name, $domains, vec![$($route,)*])
    };
}

pub(crate) use vhost;

macro_rules! route {
    (cluster $cluster:expr) => {
        crate::test::route_to_cluster($cluster)
    };
    (weighted [$(($cluster:expr, $weight:expr)),*$(,)?]) => {
        crate::test::route_weighted(vec![$(($cluster, $weight),)*])
    };
    (cluster_header $header:expr) => {
        crate::test::route_cluster_header($header)
    };
}

pub(crate) use route;

macro_rules! cla {
    ($name:expr => { $($region:expr => [$($addr:expr),*$(,)?]),*$(,)? }) => {
        crate::test::cluster_load_assignment($name, vec![$(
            crate::test::locality_lb_endpoints($region, Some(1), 0, vec![$(
                crate::test::lb_endpoint(
                    $addr,
                    xds_api::pb::envoy::config::core::v3::HealthStatus::Healthy,
                    None,
                ),
            )*]),
        )*])
    };
}

pub(crate) use cla;

pub(crate) fn api_listener_rds(name: &str, route_name: &str) -> xds_listener::Listener {
    let conn_manager = xds_http::HttpConnectionManager {
        route_specifier: Some(xds_http::http_connection_manager::RouteSpecifier::Rds(
            xds_http::Rds {
                route_config_name: route_name.to_string(),
                ..Default::default()
            },
        )),
        ..Default::default()
    };
    api_listener(name, conn_manager)
}

pub(crate) fn api_listener_inline(
    name: &str,
    virtual_hosts: Vec<xds_route::VirtualHost>,
) -> xds_listener::Listener {
    let conn_manager = xds_http::HttpConnectionManager {
        route_specifier: Some(
            xds_http::http_connection_manager::RouteSpecifier::RouteConfig(
                route_config(name, virtual_hosts),
            ),
        ),
        ..Default::default()
    };
    api_listener(name, conn_manager)
}

fn api_listener(
    name: &str,
    conn_manager: xds_http::HttpConnectionManager,
) -> xds_listener::Listener {
    xds_listener::Listener {
        name: name.to_string(),
        api_listener: Some(xds_listener::ApiListener {
            api_listener: Some(
                protobuf::Any::from_msg(&conn_manager).expect("generated invalid xds"),
            ),
        }),
        ..Default::default()
    }
}

pub(crate) fn route_config(
    name: &str,
    virtual_hosts: Vec<xds_route::VirtualHost>,
) -> xds_route::RouteConfiguration {
    xds_route::RouteConfiguration {
        name: name.to_string(),
        virtual_hosts,
        ..Default::default()
    }
}

pub(crate) fn virtual_host<'a>(
    name: &str,
    domains: impl IntoIterator<Item = &'a str>,
    routes: Vec<xds_route::Route>,
) -> xds_route::VirtualHost {
    xds_route::VirtualHost {
        name: name.to_string(),
        domains: domains.into_iter().map(|d| d.to_string()).collect(),
        routes,
        ..Default::default()
    }
}

pub(crate) fn route_to_cluster(cluster: &str) -> xds_route::Route {
    route_with_action(xds_route::route_action::ClusterSpecifier::Cluster(
        cluster.to_string(),
    ))
}

pub(crate) fn route_weighted(clusters: Vec<(&str, u32)>) -> xds_route::Route {
    let clusters = clusters
        .into_iter()
        .map(|(name, weight)| xds_route::weighted_cluster::ClusterWeight {
            name: name.to_string(),
            weight: Some(xds_api::pb::google::protobuf::UInt32Value { value: weight }),
            ..Default::default()
        })
        .collect();

    route_with_action(xds_route::route_action::ClusterSpecifier::WeightedClusters(
        xds_route::WeightedCluster {
            clusters,
            ..Default::default()
        },
    ))
}

pub(crate) fn route_cluster_header(header: &str) -> xds_route::Route {
    route_with_action(xds_route::route_action::ClusterSpecifier::ClusterHeader(
        header.to_string(),
    ))
}

fn route_with_action(cluster_specifier: xds_route::route_action::ClusterSpecifier) -> xds_route::Route {
    xds_route::Route {
        r#match: Some(xds_route::RouteMatch {
            path_specifier: Some(xds_route::route_match::PathSpecifier::Prefix(
                "/".to_string(),
            )),
            ..Default::default()
        }),
        action: Some(xds_route::route::Action::Route(xds_route::RouteAction {
            cluster_specifier: Some(cluster_specifier),
            ..Default::default()
        })),
        ..Default::default()
    }
}

pub(crate) fn cluster_load_assignment(
    name: &str,
    endpoints: Vec<xds_endpoint::LocalityLbEndpoints>,
) -> xds_endpoint::ClusterLoadAssignment {
    xds_endpoint::ClusterLoadAssignment {
        cluster_name: name.to_string(),
        endpoints,
        ..Default::default()
    }
}

pub(crate) fn locality_lb_endpoints(
    region: &str,
    weight: Option<u32>,
    priority: u32,
    lb_endpoints: Vec<xds_endpoint::LbEndpoint>,
) -> xds_endpoint::LocalityLbEndpoints {
    xds_endpoint::LocalityLbEndpoints {
        locality: Some(xds_core::Locality {
            region: region.to_string(),
            ..Default::default()
        }),
        lb_endpoints,
        load_balancing_weight: weight.map(|value| xds_api::pb::google::protobuf::UInt32Value { value }),
        priority,
        ..Default::default()
    }
}

pub(crate) fn lb_endpoint(
    addr: &str,
    health: xds_core::HealthStatus,
    weight: Option<u32>,
) -> xds_endpoint::LbEndpoint {
    let (host, port) = parse_addr(addr);
    xds_endpoint::LbEndpoint {
        health_status: health as i32,
        load_balancing_weight: weight.map(|value| xds_api::pb::google::protobuf::UInt32Value { value }),
        host_identifier: Some(xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(
            xds_endpoint::Endpoint {
                address: Some(socket_address(&host, port)),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

pub(crate) fn lb_endpoint_with_additional(
    addr: &str,
    additional: &[&str],
) -> xds_endpoint::LbEndpoint {
    let mut endpoint = lb_endpoint(addr, xds_core::HealthStatus::Healthy, None);
    let Some(xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(e)) =
        &mut endpoint.host_identifier
    else {
        unreachable!();
    };
    e.additional_addresses = additional
        .iter()
        .map(|addr| {
            let (host, port) = parse_addr(addr);
            xds_endpoint::endpoint::AdditionalAddress {
                address: Some(socket_address(&host, port)),
                ..Default::default()
            }
        })
        .collect();
    endpoint
}

pub(crate) fn drop_overload(
    category: &str,
    percentage: Option<(u32, DenominatorType)>,
) -> xds_endpoint::cluster_load_assignment::policy::DropOverload {
    xds_endpoint::cluster_load_assignment::policy::DropOverload {
        category: category.to_string(),
        drop_percentage: percentage.map(|(numerator, denominator)| FractionalPercent {
            numerator,
            denominator: denominator as i32,
        }),
    }
}

fn socket_address(host: &str, port: u32) -> xds_core::Address {
    xds_core::Address {
        address: Some(xds_core::address::Address::SocketAddress(
            xds_core::SocketAddress {
                address: host.to_string(),
                port_specifier: Some(xds_core::socket_address::PortSpecifier::PortValue(port)),
                ..Default::default()
            },
        )),
    }
}

fn parse_addr(addr: &str) -> (String, u32) {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").expect("invalid test address");
        (host.to_string(), port.parse().expect("invalid test port"))
    } else if let Some((host, port)) = addr.rsplit_once(':') {
        (host.to_string(), port.parse().expect("invalid test port"))
    } else {
        (addr.to_string(), 80)
    }
}

// ---- fake collaborators

/// An [XdsClient] that records watch calls instead of talking to a server.
#[derive(Clone, Default)]
pub(crate) struct FakeXdsClient {
    pub(crate) state: Arc<Mutex<FakeXdsState>>,
}

#[derive(Default)]
pub(crate) struct FakeXdsState {
    pub(crate) started: Vec<(ResourceKind, String, WatchId)>,
    pub(crate) cancelled: Vec<(ResourceKind, String, WatchId)>,
}

impl XdsClient for FakeXdsClient {
    fn start_watch(&mut self, kind: ResourceKind, name: &str, watch: WatchId) {
        self.state
            .lock()
            .unwrap()
            .started
            .push((kind, name.to_string(), watch));
    }

    fn cancel_watch(&mut self, kind: ResourceKind, name: &str, watch: WatchId) {
        self.state
            .lock()
            .unwrap()
            .cancelled
            .push((kind, name.to_string(), watch));
    }
}

impl FakeXdsClient {
    /// The live watch for a resource. Panics if there isn't exactly an
    /// active one.
    pub(crate) fn watch(&self, kind: ResourceKind, name: &str) -> WatchId {
        self.try_watch(kind, name)
            .unwrap_or_else(|| panic!("no active {kind:?} watch for {name}"))
    }

    pub(crate) fn try_watch(&self, kind: ResourceKind, name: &str) -> Option<WatchId> {
        let state = self.state.lock().unwrap();
        state
            .started
            .iter()
            .rev()
            .find(|(k, n, watch)| {
                *k == kind && n == name && !state.cancelled.iter().any(|(_, _, c)| c == watch)
            })
            .map(|(_, _, watch)| *watch)
    }

    /// Every watch that has been started and not cancelled, sorted for
    /// stable assertions.
    pub(crate) fn active(&self) -> Vec<(ResourceKind, String)> {
        let state = self.state.lock().unwrap();
        let mut active: Vec<_> = state
            .started
            .iter()
            .filter(|(_, _, watch)| !state.cancelled.iter().any(|(_, _, c)| c == watch))
            .map(|(kind, name, _)| (*kind, name.clone()))
            .collect();
        active.sort_by(|a, b| (format!("{:?}", a.0), &a.1).cmp(&(format!("{:?}", b.0), &b.1)));
        active
    }
}

/// A [DnsResolverFactory] that records resolver lifecycles.
#[derive(Clone, Default)]
pub(crate) struct FakeResolverFactory {
    pub(crate) state: Arc<Mutex<FakeResolverState>>,
}

#[derive(Default)]
pub(crate) struct FakeResolverState {
    pub(crate) created: Vec<(String, ResolverId)>,
    pub(crate) destroyed: Vec<ResolverId>,
    pub(crate) refreshed: Vec<ResolverId>,
}

impl DnsResolverFactory for FakeResolverFactory {
    fn create(&mut self, hostname: &str, resolver: ResolverId) -> Box<dyn DnsResolver> {
        self.state
            .lock()
            .unwrap()
            .created
            .push((hostname.to_string(), resolver));
        Box::new(FakeResolver {
            id: resolver,
            state: self.state.clone(),
        })
    }
}

impl FakeResolverFactory {
    /// The live resolver for a hostname. Panics if there isn't one.
    pub(crate) fn resolver(&self, hostname: &str) -> ResolverId {
        let state = self.state.lock().unwrap();
        state
            .created
            .iter()
            .rev()
            .find(|(h, id)| h == hostname && !state.destroyed.contains(id))
            .map(|(_, id)| *id)
            .unwrap_or_else(|| panic!("no live resolver for {hostname}"))
    }

    pub(crate) fn live_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.created.len() - state.destroyed.len()
    }
}

struct FakeResolver {
    id: ResolverId,
    state: Arc<Mutex<FakeResolverState>>,
}

impl DnsResolver for FakeResolver {
    fn update_resolution(&mut self) {
        self.state.lock().unwrap().refreshed.push(self.id);
    }
}

impl Drop for FakeResolver {
    fn drop(&mut self) {
        self.state.lock().unwrap().destroyed.push(self.id);
    }
}

/// An [XdsConfigWatcher] that records everything it is handed.
#[derive(Clone, Default)]
pub(crate) struct RecordingWatcher {
    pub(crate) outputs: Arc<Mutex<Vec<WatcherOutput>>>,
}

#[derive(Debug)]
pub(crate) enum WatcherOutput {
    Update(XdsConfig),
    Error(String, Status),
    DoesNotExist(String),
}

impl XdsConfigWatcher for RecordingWatcher {
    fn on_update(&mut self, config: XdsConfig) {
        self.outputs
            .lock()
            .unwrap()
            .push(WatcherOutput::Update(config));
    }

    fn on_error(&mut self, context: String, status: Status) {
        self.outputs
            .lock()
            .unwrap()
            .push(WatcherOutput::Error(context, status));
    }

    fn on_resource_does_not_exist(&mut self, context: String) {
        self.outputs
            .lock()
            .unwrap()
            .push(WatcherOutput::DoesNotExist(context));
    }
}

impl RecordingWatcher {
    pub(crate) fn take(&self) -> Vec<WatcherOutput> {
        std::mem::take(&mut *self.outputs.lock().unwrap())
    }

    pub(crate) fn updates(&self) -> Vec<XdsConfig> {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|output| match output {
                WatcherOutput::Update(config) => Some(config.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn last_update(&self) -> Option<XdsConfig> {
        self.updates().pop()
    }
}
