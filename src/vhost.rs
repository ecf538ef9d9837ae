//! Virtual host selection by domain pattern.
//!
//! A route configuration carries any number of virtual hosts, each with a
//! list of domain patterns. Exactly one virtual host serves a data-plane
//! authority: the one holding the best-matching pattern. Exact patterns beat
//! suffix wildcards, which beat prefix wildcards, which beat the universe
//! pattern `*`; within a class, longer patterns win.

use xds_api::pb::envoy::config::route::v3 as xds_route;

// classes are ordered by preference: a smaller class always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PatternClass {
    Exact,
    Suffix,
    Prefix,
    Universe,
}

fn classify(pattern: &str) -> Option<PatternClass> {
    if pattern.is_empty() {
        return None;
    }
    if pattern == "*" {
        return Some(PatternClass::Universe);
    }

    match (pattern.starts_with('*'), pattern.ends_with('*')) {
        (false, false) => (!pattern.contains('*')).then_some(PatternClass::Exact),
        (true, false) => (!pattern[1..].contains('*')).then_some(PatternClass::Suffix),
        (false, true) => {
            (!pattern[..pattern.len() - 1].contains('*')).then_some(PatternClass::Prefix)
        }
        (true, true) => None,
    }
}

// callers lowercase both sides first.
fn pattern_matches(pattern: &str, class: PatternClass, authority: &str) -> bool {
    match class {
        PatternClass::Exact => authority == pattern,
        PatternClass::Suffix => authority.ends_with(&pattern[1..]),
        PatternClass::Prefix => authority.starts_with(&pattern[..pattern.len() - 1]),
        PatternClass::Universe => true,
    }
}

/// Select the virtual host whose domain patterns best match `authority`.
///
/// Among matching patterns the one with the most specific class wins, with
/// longer patterns breaking ties within a class and earlier virtual hosts
/// breaking ties on length. Returns `None` when nothing matches.
pub fn find_virtual_host<'a>(
    vhosts: &'a [xds_route::VirtualHost],
    authority: &str,
) -> Option<&'a xds_route::VirtualHost> {
    let authority = authority.to_ascii_lowercase();

    let mut best: Option<(PatternClass, usize, &xds_route::VirtualHost)> = None;
    for vhost in vhosts {
        for domain in &vhost.domains {
            let Some(class) = classify(domain) else {
                continue;
            };
            if !pattern_matches(&domain.to_ascii_lowercase(), class, &authority) {
                continue;
            }
            if class == PatternClass::Exact {
                return Some(vhost);
            }

            let better = match &best {
                None => true,
                Some((best_class, best_len, _)) => {
                    class < *best_class || (class == *best_class && domain.len() > *best_len)
                }
            };
            if better {
                best = Some((class, domain.len(), vhost));
            }
        }
    }

    best.map(|(_, _, vhost)| vhost)
}
