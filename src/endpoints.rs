//! The normalized endpoint model and the conversions that produce it.
//!
//! Raw endpoint data reaches the manager in two shapes: EDS
//! `ClusterLoadAssignment`s and DNS answers. Both are flattened into the
//! same priority/locality/endpoint structure so that downstream consumers
//! never see the difference.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use xds_api::pb::envoy::config::core::v3 as xds_core;
use xds_api::pb::envoy::config::endpoint::v3 as xds_endpoint;
use xds_api::pb::envoy::r#type::v3::fractional_percent::DenominatorType;

/// A single network address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
}

/// One logical backend. The first address is the primary; any additional
/// addresses are alternates kept only when dual-stack support is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub addresses: Vec<EndpointAddress>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedEndpoint {
    pub endpoint: Endpoint,
    pub weight: u32,
}

/// Where a group of endpoints lives.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Locality {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

/// A weighted group of endpoints in one locality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalityEntry {
    pub locality: Locality,
    pub weight: u32,
    pub endpoints: Vec<WeightedEndpoint>,
}

/// The localities at one priority level. Priorities are dense: entry 0 is
/// the most preferred level, regardless of the priority numbers on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriorityEntry {
    pub localities: Vec<LocalityEntry>,
}

/// A named class of requests to drop, quantified per million.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DropCategory {
    pub category: String,
    pub requests_per_million: u32,
}

/// Normalized endpoint data for one cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointResource {
    pub priorities: Vec<PriorityEntry>,
    pub drop_categories: Vec<DropCategory>,
}

/// Converts raw EDS assignments and DNS answers into [EndpointResource]s.
///
/// Whether additional (dual-stack) addresses are kept is resolved once, at
/// construction.
#[derive(Clone, Copy, Debug)]
pub struct EndpointNormalizer {
    dual_stack: bool,
}

impl EndpointNormalizer {
    pub fn new(dual_stack: bool) -> Self {
        Self { dual_stack }
    }

    /// Normalize an EDS assignment.
    ///
    /// Localities with a missing or zero weight are dropped, as are
    /// endpoints that are neither `UNKNOWN` nor `HEALTHY` and localities
    /// left with no endpoints at all. Sparse wire priorities collapse into
    /// dense entries, preserving their relative order.
    pub fn from_cluster_load_assignment(
        &self,
        assignment: &xds_endpoint::ClusterLoadAssignment,
    ) -> EndpointResource {
        let drop_categories = assignment
            .policy
            .as_ref()
            .map(drop_categories)
            .unwrap_or_default();

        let mut priorities: BTreeMap<u32, Vec<LocalityEntry>> = BTreeMap::new();
        for group in &assignment.endpoints {
            let Some(weight) = group
                .load_balancing_weight
                .as_ref()
                .map(|w| w.value)
                .filter(|w| *w > 0)
            else {
                continue;
            };

            let endpoints: Vec<_> = group
                .lb_endpoints
                .iter()
                .filter_map(|e| self.weighted_endpoint(e))
                .collect();
            if endpoints.is_empty() {
                continue;
            }

            priorities
                .entry(group.priority)
                .or_default()
                .push(LocalityEntry {
                    locality: locality(&group.locality),
                    weight,
                    endpoints,
                });
        }

        EndpointResource {
            priorities: priorities
                .into_values()
                .map(|localities| PriorityEntry { localities })
                .collect(),
            drop_categories,
        }
    }

    /// Normalize a DNS answer: a single priority holding a single unnamed
    /// locality, everything weighted 1.
    pub fn from_dns(&self, addrs: &[SocketAddr]) -> EndpointResource {
        if addrs.is_empty() {
            return EndpointResource::default();
        }

        let endpoints = addrs
            .iter()
            .map(|addr| WeightedEndpoint {
                endpoint: Endpoint {
                    addresses: vec![EndpointAddress {
                        host: addr.ip().to_string(),
                        port: addr.port(),
                    }],
                },
                weight: 1,
            })
            .collect();

        EndpointResource {
            priorities: vec![PriorityEntry {
                localities: vec![LocalityEntry {
                    locality: Locality::default(),
                    weight: 1,
                    endpoints,
                }],
            }],
            drop_categories: Vec::new(),
        }
    }

    fn weighted_endpoint(&self, lb: &xds_endpoint::LbEndpoint) -> Option<WeightedEndpoint> {
        match xds_core::HealthStatus::try_from(lb.health_status) {
            Ok(xds_core::HealthStatus::Unknown | xds_core::HealthStatus::Healthy) => {}
            _ => return None,
        }

        let xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(endpoint) =
            lb.host_identifier.as_ref()?
        else {
            return None;
        };

        let mut addresses = vec![socket_address(endpoint.address.as_ref()?)?];
        if self.dual_stack {
            addresses.extend(
                endpoint
                    .additional_addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().and_then(socket_address)),
            );
        }

        Some(WeightedEndpoint {
            endpoint: Endpoint { addresses },
            weight: lb
                .load_balancing_weight
                .as_ref()
                .map(|w| w.value)
                .filter(|w| *w > 0)
                .unwrap_or(1),
        })
    }
}

fn locality(locality: &Option<xds_core::Locality>) -> Locality {
    let Some(locality) = locality.as_ref() else {
        return Locality::default();
    };

    Locality {
        region: locality.region.clone(),
        zone: locality.zone.clone(),
        sub_zone: locality.sub_zone.clone(),
    }
}

fn socket_address(address: &xds_core::Address) -> Option<EndpointAddress> {
    let xds_core::address::Address::SocketAddress(addr) = address.address.as_ref()? else {
        return None;
    };

    let port = match addr.port_specifier.as_ref()? {
        xds_core::socket_address::PortSpecifier::PortValue(p) => u16::try_from(*p).ok()?,
        _ => return None,
    };

    Some(EndpointAddress {
        host: addr.address.clone(),
        port,
    })
}

fn drop_categories(policy: &xds_endpoint::cluster_load_assignment::Policy) -> Vec<DropCategory> {
    policy
        .drop_overloads
        .iter()
        .filter_map(|overload| {
            let percent = overload.drop_percentage.as_ref()?;
            let per_million = match DenominatorType::try_from(percent.denominator).ok()? {
                DenominatorType::Hundred => percent.numerator.saturating_mul(10_000),
                DenominatorType::TenThousand => percent.numerator.saturating_mul(100),
                DenominatorType::Million => percent.numerator,
            };

            Some(DropCategory {
                category: overload.category.clone(),
                requests_per_million: per_million.min(1_000_000),
            })
        })
        .collect()
}
