//! Route entries

use serde::{Deserialize, Serialize};

use waypoint_core::{EidPattern, EndpointId, ForwardingAction};

/// Where a matching bundle goes next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextHop {
    /// Queue on a named link
    Link(String),
    /// Re-resolve against the table as if destined for this endpoint
    Endpoint(EndpointId),
}

impl std::fmt::Display for NextHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextHop::Link(name) => write!(f, "link:{name}"),
            NextHop::Endpoint(eid) => write!(f, "{eid}"),
        }
    }
}

/// One route: destination pattern to next hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination pattern this route covers
    pub pattern: EidPattern,
    /// Next hop (link, or endpoint for recursive resolution)
    pub next_hop: NextHop,
    /// Forward the bundle or send a copy
    pub action: ForwardingAction,
    /// Tie-break priority among equally specific patterns (higher wins)
    pub priority: u32,
    /// Routing cost hint
    pub cost: u32,
}

impl RouteEntry {
    /// A forwarding route to a link with default priority and cost
    pub fn to_link(pattern: EidPattern, link: impl Into<String>) -> Self {
        Self {
            pattern,
            next_hop: NextHop::Link(link.into()),
            action: ForwardingAction::Forward,
            priority: 0,
            cost: 0,
        }
    }

    /// A recursive route to another endpoint
    pub fn to_endpoint(pattern: EidPattern, endpoint: EndpointId) -> Self {
        Self {
            pattern,
            next_hop: NextHop::Endpoint(endpoint),
            action: ForwardingAction::Forward,
            priority: 0,
            cost: 0,
        }
    }

    /// Set the action
    pub fn with_action(mut self, action: ForwardingAction) -> Self {
        self.action = action;
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the cost
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

impl std::fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} ({:?}, priority {})",
            self.pattern, self.next_hop, self.action, self.priority
        )
    }
}

/// A fully resolved forwarding decision for one bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// The link to queue on
    pub link: String,
    /// Forward vs copy
    pub action: ForwardingAction,
    /// Priority inherited from the winning entry
    pub priority: u32,
}
