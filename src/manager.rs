//! The reconciler at the center of the crate.
//!
//! [DependencyManager] receives every upstream event (listener, route
//! config, per-cluster CDS, per-cluster EDS, DNS answers), mutates the
//! cluster forest to match, and emits one complete [XdsConfig] snapshot
//! whenever the tree settles. It is written sans-io and single-writer: the
//! caller is responsible for delivering events one at a time, which the
//! [task](crate::task) module does by running the manager on a single tokio
//! task.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use tonic::Status;
use tracing::{debug, trace};
use xds_api::pb::envoy::config::{
    endpoint::v3 as xds_endpoint, listener::v3 as xds_listener, route::v3 as xds_route,
};

use crate::config::{ClusterChildren, ClusterConfig, XdsConfig};
use crate::endpoints::EndpointNormalizer;
use crate::forest::{ClusterInfo, ClusterNode, Forest};
use crate::resources::{self, CdsUpdate, ClusterDiscovery, ListenerRoutes};
use crate::vhost;
use crate::xds::{
    DnsResolverFactory, Event, ResolverId, ResourceKind, WatchEvent, WatchId, XdsClient,
    XdsConfigWatcher,
};

/// Construction-time options for a [DependencyManager].
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// The LDS resource to watch.
    pub listener: String,
    /// The fully qualified host name used to pick a virtual host.
    pub authority: String,
    /// Keep endpoints' additional addresses alongside the primary.
    pub dual_stack: bool,
}

impl ManagerOptions {
    pub fn new(listener: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            authority: authority.into(),
            dual_stack: false,
        }
    }
}

struct RdsWatch {
    name: String,
    watch: WatchId,
}

/// Reconciles the xDS resource tree into [XdsConfig] snapshots.
///
/// The manager subscribes to the listener named at construction and follows
/// its references: the listener names a route configuration, the matching
/// virtual host's routes name clusters, aggregate clusters name more
/// clusters, and leaf clusters watch endpoints or resolve DNS. Clusters stay
/// in the forest exactly as long as something reachable references them.
pub struct DependencyManager {
    client: Box<dyn XdsClient>,
    resolvers: Box<dyn DnsResolverFactory>,
    watcher: Box<dyn XdsConfigWatcher>,
    normalizer: EndpointNormalizer,
    listener_name: String,
    authority: String,

    next_id: u64,
    listener_watch: WatchId,
    listener: Option<xds_listener::Listener>,
    rds: Option<RdsWatch>,
    route_config: Option<xds_route::RouteConfiguration>,
    cluster_roots: Vec<String>,
    subscriptions: HashMap<String, u32>,
    forest: Forest,
    shutdown: bool,
}

impl DependencyManager {
    pub fn new(
        client: Box<dyn XdsClient>,
        resolvers: Box<dyn DnsResolverFactory>,
        watcher: Box<dyn XdsConfigWatcher>,
        options: ManagerOptions,
    ) -> Self {
        let mut manager = Self {
            client,
            resolvers,
            watcher,
            normalizer: EndpointNormalizer::new(options.dual_stack),
            listener_name: options.listener,
            authority: options.authority,
            next_id: 0,
            listener_watch: WatchId(0),
            listener: None,
            rds: None,
            route_config: None,
            cluster_roots: Vec::new(),
            subscriptions: HashMap::new(),
            forest: Forest::default(),
            shutdown: false,
        };

        manager.listener_watch = manager.next_watch_id();
        debug!(listener = %manager.listener_name, "starting listener watch");
        manager.client.start_watch(
            ResourceKind::Listener,
            &manager.listener_name,
            manager.listener_watch,
        );
        manager
    }

    /// Apply one upstream event. Events from watches that have since been
    /// cancelled are dropped here, which makes delivery races harmless.
    pub fn handle_event(&mut self, event: Event) {
        if self.shutdown {
            return;
        }
        match event {
            Event::Listener(watch, event) => self.on_listener_event(watch, event),
            Event::RouteConfig(watch, event) => self.on_route_config_event(watch, event),
            Event::Cluster(watch, event) => self.on_cluster_event(watch, event),
            Event::Endpoints(watch, event) => self.on_endpoints_event(watch, event),
            Event::Resolved(resolver, result) => self.on_resolved(resolver, result),
        }
    }

    /// Pin `name` into the forest independently of the route configuration.
    ///
    /// Pinned clusters count as roots for reachability, so they survive
    /// route changes until every subscription is released.
    pub fn add_cluster_subscription(&mut self, name: &str) {
        debug!(cluster = %name, "adding cluster subscription");
        *self.subscriptions.entry(name.to_string()).or_insert(0) += 1;
        self.ensure_cluster(name);
    }

    pub fn release_cluster_subscription(&mut self, name: &str) {
        let Some(count) = self.subscriptions.get_mut(name) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            debug!(cluster = %name, "releasing cluster subscription");
            self.subscriptions.remove(name);
            self.prune();
            self.maybe_send_update();
        }
    }

    /// Ask every LOGICAL_DNS resolver to re-resolve. EDS clusters are
    /// unaffected.
    pub fn update_resolution(&mut self) {
        for node in self.forest.nodes_mut() {
            if let Some(Ok(ClusterInfo::LogicalDns { handle, .. })) = &mut node.update {
                handle.update_resolution();
            }
        }
    }

    /// Cancel every watch and resolver and stop emitting snapshots.
    pub fn destroy(&mut self) {
        if self.shutdown {
            return;
        }
        debug!("destroying dependency manager");
        self.shutdown = true;
        self.cancel_rds_watch();
        self.client.cancel_watch(
            ResourceKind::Listener,
            &self.listener_name,
            self.listener_watch,
        );
        let names: Vec<String> = self.forest.names().cloned().collect();
        for name in names {
            self.remove_cluster(&name);
        }
        self.subscriptions.clear();
        self.cluster_roots.clear();
    }

    fn next_watch_id(&mut self) -> WatchId {
        self.next_id += 1;
        WatchId(self.next_id)
    }

    fn next_resolver_id(&mut self) -> ResolverId {
        self.next_id += 1;
        ResolverId(self.next_id)
    }

    // ---- LDS

    fn on_listener_event(
        &mut self,
        watch: WatchId,
        event: WatchEvent<xds_listener::Listener>,
    ) {
        if watch != self.listener_watch {
            trace!(?watch, "dropping event from a cancelled listener watch");
            return;
        }
        match event {
            WatchEvent::Changed(listener) => self.on_listener_changed(listener),
            WatchEvent::Error(status) => {
                // transient errors must not clobber a working config
                if self.listener.is_none() {
                    self.watcher
                        .on_error(format!("Listener {}", self.listener_name), status);
                }
            }
            WatchEvent::DoesNotExist => {
                debug!(listener = %self.listener_name, "listener does not exist");
                self.cancel_rds_watch();
                self.listener = None;
                self.route_config = None;
                self.cluster_roots.clear();
                self.prune();
                self.watcher
                    .on_resource_does_not_exist(format!("Listener {}", self.listener_name));
            }
        }
    }

    fn on_listener_changed(&mut self, listener: xds_listener::Listener) {
        let routes = match resources::listener_routes(&listener) {
            Ok(routes) => routes,
            Err(err) => {
                debug!(listener = %self.listener_name, %err, "ignoring undecodable listener");
                if self.listener.is_none() {
                    self.watcher.on_error(
                        format!("Listener {}", self.listener_name),
                        Status::unavailable(err.to_string()),
                    );
                }
                return;
            }
        };

        self.listener = Some(listener);
        match routes {
            ListenerRoutes::Rds(name) => {
                if self.rds.as_ref().is_some_and(|rds| rds.name == name) {
                    return;
                }
                self.cancel_rds_watch();
                self.route_config = None;
                self.cluster_roots.clear();
                self.prune();

                let watch = self.next_watch_id();
                debug!(route_config = %name, "starting route config watch");
                self.client
                    .start_watch(ResourceKind::RouteConfiguration, &name, watch);
                self.rds = Some(RdsWatch { name, watch });
            }
            ListenerRoutes::Inline(route_config) => {
                self.cancel_rds_watch();
                self.apply_route_config(route_config);
            }
        }
    }

    fn cancel_rds_watch(&mut self) {
        if let Some(rds) = self.rds.take() {
            debug!(route_config = %rds.name, "cancelling route config watch");
            self.client
                .cancel_watch(ResourceKind::RouteConfiguration, &rds.name, rds.watch);
        }
    }

    // ---- RDS

    fn on_route_config_event(
        &mut self,
        watch: WatchId,
        event: WatchEvent<xds_route::RouteConfiguration>,
    ) {
        let Some(rds) = &self.rds else {
            trace!(?watch, "dropping event from a cancelled route config watch");
            return;
        };
        if rds.watch != watch {
            trace!(?watch, "dropping event from a cancelled route config watch");
            return;
        }
        let name = rds.name.clone();

        match event {
            WatchEvent::Changed(route_config) => self.apply_route_config(route_config),
            WatchEvent::Error(status) => {
                if self.route_config.is_none() {
                    self.watcher
                        .on_error(format!("RouteConfiguration {name}"), status);
                }
            }
            WatchEvent::DoesNotExist => {
                debug!(route_config = %name, "route config does not exist");
                self.route_config = None;
                self.cluster_roots.clear();
                self.prune();
                self.watcher
                    .on_resource_does_not_exist(format!("RouteConfiguration {name}"));
            }
        }
    }

    /// Install a route configuration, whether it arrived over RDS or inline
    /// in the listener, and re-root the forest at its clusters.
    fn apply_route_config(&mut self, route_config: xds_route::RouteConfiguration) {
        let roots = match vhost::find_virtual_host(&route_config.virtual_hosts, &self.authority)
        {
            Some(vhost) => resources::route_clusters(vhost),
            None => {
                let name = route_config.name.clone();
                self.route_config = Some(route_config);
                self.cluster_roots.clear();
                self.prune();
                self.watcher.on_error(
                    format!("RouteConfiguration {name}"),
                    Status::unavailable(format!(
                        "No matching route found for {}",
                        self.authority
                    )),
                );
                return;
            }
        };

        self.route_config = Some(route_config);
        self.cluster_roots = roots.into_iter().collect();
        self.prune();
        for root in self.cluster_roots.clone() {
            self.ensure_cluster(&root);
        }
        self.maybe_send_update();
    }

    // ---- CDS

    fn on_cluster_event(&mut self, watch: WatchId, event: WatchEvent<CdsUpdate>) {
        let Some(name) = self.forest.cluster_for_watch(watch) else {
            trace!(?watch, "dropping event from a cancelled cluster watch");
            return;
        };
        match event {
            WatchEvent::Changed(update) => self.on_cluster_changed(name, update),
            WatchEvent::Error(status) => self.on_cluster_error(name, status),
            WatchEvent::DoesNotExist => self.on_cluster_missing(name),
        }
    }

    fn on_cluster_changed(&mut self, name: String, update: CdsUpdate) {
        trace!(cluster = %name, discovery = ?update.discovery, "cluster changed");

        let (previous, had_subtree) = {
            let Some(node) = self.forest.get_mut(&name) else {
                return;
            };
            let previous = match node.update.take() {
                Some(Ok(info)) => Some(info),
                _ => None,
            };
            let had_subtree = !node.children.is_empty();
            node.children = Vec::new();
            (previous, had_subtree)
        };

        match update.discovery.clone() {
            ClusterDiscovery::Aggregate { children } => {
                if let Some(info) = previous {
                    self.teardown(&name, info);
                }
                if let Some(node) = self.forest.get_mut(&name) {
                    node.children = children.clone();
                    node.update = Some(Ok(ClusterInfo::Aggregate { cds: update }));
                }
                for child in &children {
                    self.ensure_cluster(child);
                }
                // any children dropped by this update become unreachable now
                self.prune();
            }

            ClusterDiscovery::Eds { eds_service_name } => {
                let service_name = eds_service_name.unwrap_or_else(|| name.clone());

                let (watch, endpoints, resolution_note) = match previous {
                    // same service: the live watch and its results carry over
                    Some(ClusterInfo::Eds {
                        service_name: old_service,
                        watch,
                        endpoints,
                        resolution_note,
                        ..
                    }) if old_service == service_name => (watch, endpoints, resolution_note),
                    previous => {
                        if let Some(info) = previous {
                            self.teardown(&name, info);
                        }
                        let watch = self.next_watch_id();
                        debug!(cluster = %name, service = %service_name, "starting endpoint watch");
                        self.client
                            .start_watch(ResourceKind::Endpoints, &service_name, watch);
                        (watch, None, None)
                    }
                };

                if let Some(node) = self.forest.get_mut(&name) {
                    node.update = Some(Ok(ClusterInfo::Eds {
                        cds: update,
                        service_name,
                        watch,
                        endpoints,
                        resolution_note,
                    }));
                }
                if had_subtree {
                    self.prune();
                }
            }

            ClusterDiscovery::LogicalDns { dns_hostname } => {
                let (resolver, handle, endpoints, resolution_note) = match previous {
                    Some(ClusterInfo::LogicalDns {
                        hostname,
                        resolver,
                        handle,
                        endpoints,
                        resolution_note,
                        ..
                    }) if hostname == dns_hostname => {
                        (resolver, handle, endpoints, resolution_note)
                    }
                    previous => {
                        if let Some(info) = previous {
                            self.teardown(&name, info);
                        }
                        let resolver = self.next_resolver_id();
                        debug!(cluster = %name, hostname = %dns_hostname, "creating dns resolver");
                        let mut handle = self.resolvers.create(&dns_hostname, resolver);
                        handle.update_resolution();
                        (resolver, handle, None, None)
                    }
                };

                if let Some(node) = self.forest.get_mut(&name) {
                    node.update = Some(Ok(ClusterInfo::LogicalDns {
                        cds: update,
                        hostname: dns_hostname,
                        resolver,
                        handle,
                        endpoints,
                        resolution_note,
                    }));
                }
                if had_subtree {
                    self.prune();
                }
            }
        }

        self.maybe_send_update();
    }

    fn on_cluster_error(&mut self, name: String, status: Status) {
        let Some(node) = self.forest.get_mut(&name) else {
            return;
        };
        match &node.update {
            Some(Ok(_)) => {
                // transient; keep serving the last good update
                debug!(cluster = %name, code = ?status.code(), "ignoring error for healthy cluster");
            }
            _ => {
                node.update = Some(Err(status));
                self.maybe_send_update();
            }
        }
    }

    fn on_cluster_missing(&mut self, name: String) {
        debug!(cluster = %name, "cluster does not exist");
        let previous = {
            let Some(node) = self.forest.get_mut(&name) else {
                return;
            };
            let previous = node.update.take();
            node.children = Vec::new();
            node.update = Some(Err(Status::unavailable(format!(
                "Cluster resource {name} does not exist"
            ))));
            previous
        };
        if let Some(Ok(info)) = previous {
            self.teardown(&name, info);
        }
        self.prune();
        self.maybe_send_update();
    }

    /// Release whatever sub-resource a cluster's old info was holding.
    /// Dropping a LOGICAL_DNS handle destroys its resolver.
    fn teardown(&mut self, name: &str, info: ClusterInfo) {
        match info {
            ClusterInfo::Aggregate { .. } => {}
            ClusterInfo::Eds {
                service_name,
                watch,
                ..
            } => {
                debug!(cluster = %name, service = %service_name, "cancelling endpoint watch");
                self.client
                    .cancel_watch(ResourceKind::Endpoints, &service_name, watch);
            }
            ClusterInfo::LogicalDns { hostname, .. } => {
                debug!(cluster = %name, hostname = %hostname, "destroying dns resolver");
            }
        }
    }

    // ---- EDS and DNS

    fn on_endpoints_event(
        &mut self,
        watch: WatchId,
        event: WatchEvent<xds_endpoint::ClusterLoadAssignment>,
    ) {
        let Some(name) = self.forest.cluster_for_endpoint_watch(watch) else {
            trace!(?watch, "dropping event from a cancelled endpoint watch");
            return;
        };

        match event {
            WatchEvent::Changed(assignment) => {
                let normalized = self.normalizer.from_cluster_load_assignment(&assignment);
                if let Some(ClusterInfo::Eds {
                    endpoints,
                    resolution_note,
                    ..
                }) = self.forest.info_mut(&name)
                {
                    *endpoints = Some(normalized);
                    *resolution_note = None;
                }
                self.maybe_send_update();
            }
            WatchEvent::Error(status) => {
                let mut changed = false;
                if let Some(ClusterInfo::Eds {
                    endpoints,
                    resolution_note,
                    ..
                }) = self.forest.info_mut(&name)
                {
                    // only report the error if we never got endpoints;
                    // otherwise keep serving what we have
                    if endpoints.is_none() {
                        *resolution_note =
                            Some(format!("Control plane error: {}", status.message()));
                        changed = true;
                    }
                }
                if changed {
                    self.maybe_send_update();
                } else {
                    debug!(cluster = %name, "ignoring endpoint error, keeping last known endpoints");
                }
            }
            WatchEvent::DoesNotExist => {
                debug!(cluster = %name, "endpoint resource does not exist");
                if let Some(ClusterInfo::Eds {
                    endpoints,
                    resolution_note,
                    ..
                }) = self.forest.info_mut(&name)
                {
                    *endpoints = None;
                    *resolution_note = Some("Resource does not exist".to_string());
                }
                self.maybe_send_update();
            }
        }
    }

    fn on_resolved(&mut self, resolver: ResolverId, result: Result<Vec<SocketAddr>, Status>) {
        let Some(name) = self.forest.cluster_for_resolver(resolver) else {
            trace!(?resolver, "dropping answer from a destroyed resolver");
            return;
        };

        match result {
            Ok(addrs) => {
                let normalized = self.normalizer.from_dns(&addrs);
                if let Some(ClusterInfo::LogicalDns {
                    endpoints,
                    resolution_note,
                    ..
                }) = self.forest.info_mut(&name)
                {
                    *endpoints = Some(normalized);
                    *resolution_note = None;
                }
                self.maybe_send_update();
            }
            Err(status) => {
                let mut changed = false;
                if let Some(ClusterInfo::LogicalDns {
                    endpoints,
                    resolution_note,
                    ..
                }) = self.forest.info_mut(&name)
                {
                    if endpoints.is_none() {
                        *resolution_note =
                            Some(format!("DNS resolution error: {}", status.message()));
                        changed = true;
                    }
                }
                if changed {
                    self.maybe_send_update();
                } else {
                    debug!(cluster = %name, "ignoring dns error, keeping last known endpoints");
                }
            }
        }
    }

    // ---- forest maintenance

    fn ensure_cluster(&mut self, name: &str) {
        if self.forest.contains(name) {
            return;
        }
        let watch = self.next_watch_id();
        debug!(cluster = %name, "starting cluster watch");
        self.client.start_watch(ResourceKind::Cluster, name, watch);
        self.forest.insert(name.to_string(), ClusterNode::new(watch));
    }

    fn remove_cluster(&mut self, name: &str) {
        let Some(node) = self.forest.remove(name) else {
            return;
        };
        debug!(cluster = %name, "cancelling cluster watch");
        self.client
            .cancel_watch(ResourceKind::Cluster, name, node.watch);
        if let Some(Ok(info)) = node.update {
            self.teardown(name, info);
        }
    }

    /// Sweep every cluster that is no longer reachable from the route
    /// clusters or a pinned subscription.
    fn prune(&mut self) {
        let roots: Vec<String> = self
            .cluster_roots
            .iter()
            .chain(self.subscriptions.keys())
            .cloned()
            .collect();
        let reachable = self.forest.reachable(roots.iter());
        let orphans: Vec<String> = self
            .forest
            .names()
            .filter(|name| !reachable.contains(*name))
            .cloned()
            .collect();
        for name in orphans {
            debug!(cluster = %name, "pruning unreachable cluster");
            self.remove_cluster(&name);
        }
    }

    // ---- snapshot emission

    /// Emit a snapshot if the whole tree has settled: a listener and route
    /// config are in hand and every reachable cluster has an outcome.
    /// Repeated calls with unchanged state produce identical snapshots.
    fn maybe_send_update(&mut self) {
        if self.shutdown {
            return;
        }
        let Some(listener) = &self.listener else {
            return;
        };
        let Some(route_config) = &self.route_config else {
            return;
        };
        let Some(virtual_host) =
            vhost::find_virtual_host(&route_config.virtual_hosts, &self.authority)
        else {
            return;
        };

        let roots: Vec<String> = self
            .cluster_roots
            .iter()
            .chain(self.subscriptions.keys())
            .cloned()
            .collect();
        if !self.forest.fully_updated(roots.iter()) {
            trace!("skipping update, cluster forest not fully updated");
            return;
        }

        let mut clusters = BTreeMap::new();
        for (name, node) in self.forest.iter() {
            let entry = match &node.update {
                None => continue,
                Some(Err(status)) => Err(status.clone()),
                Some(Ok(info)) => Ok(cluster_config(info, node)),
            };
            clusters.insert(name.clone(), entry);
        }

        debug!(clusters = clusters.len(), "sending config update");
        self.watcher.on_update(XdsConfig {
            listener: listener.clone(),
            route_config: route_config.clone(),
            virtual_host: virtual_host.clone(),
            clusters,
        });
    }
}

fn cluster_config(info: &ClusterInfo, node: &ClusterNode) -> ClusterConfig {
    match info {
        ClusterInfo::Aggregate { cds } => ClusterConfig {
            cluster: cds.clone(),
            children: ClusterChildren::Aggregate {
                leaf_clusters: node.children.clone(),
            },
        },
        ClusterInfo::Eds {
            cds,
            endpoints,
            resolution_note,
            ..
        }
        | ClusterInfo::LogicalDns {
            cds,
            endpoints,
            resolution_note,
            ..
        } => ClusterConfig {
            cluster: cds.clone(),
            children: ClusterChildren::Endpoints {
                endpoints: endpoints.clone(),
                resolution_note: resolution_note.clone(),
            },
        },
    }
}
