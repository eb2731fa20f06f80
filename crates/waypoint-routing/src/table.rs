//! The route table
//!
//! Longest-match selection over the pattern lattice: the most specific
//! matching pattern wins, ties broken by priority and then insertion
//! order. Routes whose next hop is an endpoint are resolved recursively,
//! bounded by `max_route_to_chain`.

use parking_lot::Mutex;
use tracing::debug;

use waypoint_core::EndpointId;

use crate::error::RoutingError;
use crate::route::{NextHop, ResolvedRoute, RouteEntry};

/// Hard cap on `add_ipn_range` expansion
const IPN_RANGE_LIMIT: u64 = 16_384;

/// The node's route table
pub struct RouteTable {
    entries: Mutex<Vec<RouteEntry>>,
    max_route_to_chain: usize,
}

impl RouteTable {
    /// Create an empty table with the given recursion bound
    pub fn new(max_route_to_chain: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_route_to_chain: max_route_to_chain.max(1),
        }
    }

    /// Append a route
    pub fn add(&self, entry: RouteEntry) {
        debug!(route = %entry, "adding route");
        self.entries.lock().push(entry);
    }

    /// Remove every route with the given pattern string; returns the count
    pub fn del(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.pattern.as_str() != pattern);
        before - entries.len()
    }

    /// Expand a contiguous ipn node range into per-node routes
    ///
    /// Each node in `start..=end` gets a `ipn:<node>.*` route to the given
    /// link. Ranges larger than the expansion cap are rejected.
    pub fn add_ipn_range(
        &self,
        start: u64,
        end: u64,
        link: &str,
    ) -> Result<usize, RoutingError> {
        if end < start {
            return Err(RoutingError::EmptyRange { start, end });
        }
        let count = end - start + 1;
        if count > IPN_RANGE_LIMIT {
            return Err(RoutingError::RangeTooLarge {
                start,
                end,
                limit: IPN_RANGE_LIMIT,
            });
        }
        let mut entries = self.entries.lock();
        for node in start..=end {
            let pattern = waypoint_core::EidPattern::parse(&format!("ipn:{node}.*"))
                .expect("generated ipn pattern is valid");
            entries.push(RouteEntry::to_link(pattern, link));
        }
        Ok(count as usize)
    }

    /// Snapshot of all routes, insertion order
    pub fn entries(&self) -> Vec<RouteEntry> {
        self.entries.lock().clone()
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every route
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// All entries matching `dest`, best first
    ///
    /// Ordering: pattern specificity descending, then priority descending,
    /// then insertion order.
    pub fn matching(&self, dest: &EndpointId) -> Vec<RouteEntry> {
        let entries = self.entries.lock();
        let mut matches: Vec<(usize, &RouteEntry)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.pattern.matches(dest))
            .collect();
        matches.sort_by(|(ia, a), (ib, b)| {
            b.pattern
                .specificity()
                .cmp(&a.pattern.specificity())
                .then(b.priority.cmp(&a.priority))
                .then(ia.cmp(ib))
        });
        matches.into_iter().map(|(_, e)| e.clone()).collect()
    }

    /// The single best matching entry for `dest`
    pub fn best_match(&self, dest: &EndpointId) -> Option<RouteEntry> {
        self.matching(dest).into_iter().next()
    }

    /// Resolve `dest` to concrete links
    ///
    /// Matching entries are resolved in best-first order; entries routing
    /// to an endpoint are chased recursively up to the chain bound. The
    /// result is deduplicated by link, first (best) resolution kept.
    pub fn resolve(&self, dest: &EndpointId) -> Result<Vec<ResolvedRoute>, RoutingError> {
        let mut resolved = Vec::new();
        self.resolve_inner(dest, 0, &mut resolved)?;

        let mut seen = std::collections::HashSet::new();
        resolved.retain(|r: &ResolvedRoute| seen.insert(r.link.clone()));
        Ok(resolved)
    }

    fn resolve_inner(
        &self,
        dest: &EndpointId,
        depth: usize,
        out: &mut Vec<ResolvedRoute>,
    ) -> Result<(), RoutingError> {
        if depth >= self.max_route_to_chain {
            return Err(RoutingError::ChainTooLong {
                dest: dest.to_string(),
                max: self.max_route_to_chain,
            });
        }
        for entry in self.matching(dest) {
            match &entry.next_hop {
                NextHop::Link(link) => out.push(ResolvedRoute {
                    link: link.clone(),
                    action: entry.action,
                    priority: entry.priority,
                }),
                NextHop::Endpoint(endpoint) => {
                    self.resolve_inner(endpoint, depth + 1, out)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(10)
    }
}
