//! Cluster nodes and the forest they form.
//!
//! Every cluster the manager currently cares about gets a [ClusterNode],
//! indexed by name. Aggregate clusters point at their children by name,
//! turning the node map into a forest rooted at the route-referenced and
//! externally-subscribed clusters. The manager is the only writer; this
//! module only holds state and answers reachability questions about it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use tonic::Status;

use crate::endpoints::EndpointResource;
use crate::resources::CdsUpdate;
use crate::xds::{DnsResolver, ResolverId, WatchId};

/// Per-cluster record: the CDS watch, the last update that arrived on it,
/// and the aggregate child list (empty for non-aggregates).
#[derive(Debug)]
pub(crate) struct ClusterNode {
    pub(crate) watch: WatchId,
    pub(crate) update: Option<Result<ClusterInfo, Status>>,
    pub(crate) children: Vec<String>,
}

impl ClusterNode {
    pub(crate) fn new(watch: WatchId) -> Self {
        Self {
            watch,
            update: None,
            children: Vec::new(),
        }
    }
}

/// The discovery-mode-specific half of a cluster's state. Leaf variants own
/// their sub-watch or resolver; dropping the variant tears it down (EDS
/// watches are cancelled by the manager before the drop).
pub(crate) enum ClusterInfo {
    Aggregate {
        cds: CdsUpdate,
    },
    Eds {
        cds: CdsUpdate,
        service_name: String,
        watch: WatchId,
        endpoints: Option<EndpointResource>,
        resolution_note: Option<String>,
    },
    LogicalDns {
        cds: CdsUpdate,
        hostname: String,
        resolver: ResolverId,
        handle: Box<dyn DnsResolver>,
        endpoints: Option<EndpointResource>,
        resolution_note: Option<String>,
    },
}

impl ClusterInfo {
    /// A leaf is ready once its sub-watch has produced any outcome, good or
    /// bad. Aggregates carry no sub-watch and are always ready.
    fn is_ready(&self) -> bool {
        match self {
            ClusterInfo::Aggregate { .. } => true,
            ClusterInfo::Eds {
                endpoints,
                resolution_note,
                ..
            }
            | ClusterInfo::LogicalDns {
                endpoints,
                resolution_note,
                ..
            } => endpoints.is_some() || resolution_note.is_some(),
        }
    }
}

impl fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterInfo::Aggregate { cds } => {
                f.debug_struct("Aggregate").field("cds", cds).finish()
            }
            ClusterInfo::Eds {
                cds,
                service_name,
                watch,
                endpoints,
                resolution_note,
            } => f
                .debug_struct("Eds")
                .field("cds", cds)
                .field("service_name", service_name)
                .field("watch", watch)
                .field("endpoints", endpoints)
                .field("resolution_note", resolution_note)
                .finish(),
            ClusterInfo::LogicalDns {
                cds,
                hostname,
                resolver,
                endpoints,
                resolution_note,
                ..
            } => f
                .debug_struct("LogicalDns")
                .field("cds", cds)
                .field("hostname", hostname)
                .field("resolver", resolver)
                .field("handle", &"<resolver>")
                .field("endpoints", endpoints)
                .field("resolution_note", resolution_note)
                .finish(),
        }
    }
}

/// The set of cluster nodes, indexed by name.
#[derive(Debug, Default)]
pub(crate) struct Forest {
    nodes: HashMap<String, ClusterNode>,
}

impl Forest {
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ClusterNode> {
        self.nodes.get_mut(name)
    }

    pub(crate) fn insert(&mut self, name: String, node: ClusterNode) {
        self.nodes.insert(name, node);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<ClusterNode> {
        self.nodes.remove(name)
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &ClusterNode)> {
        self.nodes.iter()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut ClusterNode> {
        self.nodes.values_mut()
    }

    /// The node's current Ok info, if it has one.
    pub(crate) fn info_mut(&mut self, name: &str) -> Option<&mut ClusterInfo> {
        match self.nodes.get_mut(name) {
            Some(ClusterNode {
                update: Some(Ok(info)),
                ..
            }) => Some(info),
            _ => None,
        }
    }

    pub(crate) fn cluster_for_watch(&self, watch: WatchId) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, node)| node.watch == watch)
            .map(|(name, _)| name.clone())
    }

    pub(crate) fn cluster_for_endpoint_watch(&self, watch: WatchId) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, node)| {
                matches!(
                    &node.update,
                    Some(Ok(ClusterInfo::Eds { watch: w, .. })) if *w == watch,
                )
            })
            .map(|(name, _)| name.clone())
    }

    pub(crate) fn cluster_for_resolver(&self, resolver: ResolverId) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, node)| {
                matches!(
                    &node.update,
                    Some(Ok(ClusterInfo::LogicalDns { resolver: r, .. })) if *r == resolver,
                )
            })
            .map(|(name, _)| name.clone())
    }

    /// Every name reachable from `roots` through aggregate children. The
    /// visited set makes this terminate even if a broken control plane
    /// serves a cyclic aggregate graph.
    pub(crate) fn reachable<'a>(
        &'a self,
        roots: impl IntoIterator<Item = &'a String>,
    ) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&String> = roots.into_iter().collect();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(name) {
                queue.extend(&node.children);
            }
        }
        seen
    }

    /// True when every node reachable from `roots` has an update and every
    /// Ok leaf has an outcome. This is the gate on snapshot emission.
    pub(crate) fn fully_updated<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a String>,
    ) -> bool {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = roots.into_iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get(&name) else {
                return false;
            };
            match &node.update {
                None => return false,
                Some(Err(_)) => {}
                Some(Ok(info)) => {
                    if !info.is_ready() {
                        return false;
                    }
                    queue.extend(node.children.iter().cloned());
                }
            }
        }
        true
    }
}
