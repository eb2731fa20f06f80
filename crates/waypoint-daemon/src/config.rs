//! Node configuration
//!
//! A [`NodeConfig`] covers the whole daemon: identity, storage paths and
//! quota, custody and ACS tuning, declarative links and routes. The
//! binary loads it from a TOML file; every field has a default so partial
//! files work. `validate` reports problems without mutating anything.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use waypoint_core::{EidPattern, EndpointId, ForwardingAction};
use waypoint_routing::{NextHop, RouteEntry};

use crate::acs::AcsConfig;
use crate::custody::CustodyTimerParams;
use crate::error::DaemonError;
use crate::link::{Link, LinkParams, LinkRef, LinkType};

/// Storage paths and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// redb database path
    pub db_path: PathBuf,
    /// Payload file directory
    pub payload_dir: PathBuf,
    /// Payload quota in bytes (0 = unlimited)
    pub payload_quota: u64,
    /// Maximum simultaneously open payload files
    pub fd_cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/waypoint.redb"),
            payload_dir: PathBuf::from("./data/payloads"),
            payload_quota: 0,
            fd_cache_capacity: 32,
        }
    }
}

/// One declarative link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfigEntry {
    /// Unique link name
    pub name: String,
    /// Link type string
    pub link_type: String,
    /// Next-hop address for the convergence layer
    pub nexthop: String,
    /// Convergence layer name
    #[serde(default = "default_cl_name")]
    pub cl: String,
    /// Tunables (missing fields take defaults)
    #[serde(flatten)]
    pub params: LinkParams,
}

fn default_cl_name() -> String {
    "loopback".to_string()
}

impl LinkConfigEntry {
    /// Build the link object, validating type and parameters
    pub fn build(&self) -> Result<LinkRef, DaemonError> {
        let link_type = LinkType::parse(&self.link_type).ok_or_else(|| {
            DaemonError::Configuration(format!("unknown link type '{}'", self.link_type))
        })?;
        Link::create(
            self.name.clone(),
            link_type,
            self.nexthop.clone(),
            self.cl.clone(),
            self.params.clone(),
        )
    }
}

/// One declarative route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfigEntry {
    /// Destination pattern
    pub dest: String,
    /// Next-hop link name (exactly one of link/endpoint)
    #[serde(default)]
    pub link: Option<String>,
    /// Next-hop endpoint for recursive resolution
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Tie-break priority
    #[serde(default)]
    pub priority: u32,
    /// "forward" (default) or "copy"
    #[serde(default)]
    pub action: Option<String>,
    /// Routing cost
    #[serde(default)]
    pub cost: u32,
}

impl RouteConfigEntry {
    /// Build the route entry
    pub fn build(&self) -> Result<RouteEntry, DaemonError> {
        let pattern = EidPattern::parse(&self.dest)?;
        let next_hop = match (&self.link, &self.endpoint) {
            (Some(link), None) => NextHop::Link(link.clone()),
            (None, Some(endpoint)) => NextHop::Endpoint(EndpointId::parse(endpoint)?),
            _ => {
                return Err(DaemonError::Configuration(format!(
                    "route '{}' needs exactly one of link or endpoint",
                    self.dest
                )))
            }
        };
        let action = match self.action.as_deref() {
            None | Some("forward") => ForwardingAction::Forward,
            Some("copy") => ForwardingAction::Copy,
            Some(other) => {
                return Err(DaemonError::Configuration(format!(
                    "unknown route action '{other}'"
                )))
            }
        };
        Ok(RouteEntry {
            pattern,
            next_hop,
            action,
            priority: self.priority,
            cost: self.cost,
        })
    }
}

/// The whole node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's endpoint id
    pub local_eid: EndpointId,
    /// Storage paths and limits
    pub storage: StorageConfig,
    /// Custody timer tuning
    pub custody: CustodyTimerParams,
    /// Aggregate custody signal tuning
    pub acs: AcsConfig,
    /// Shut down after this many idle seconds (0 = never)
    pub idle_shutdown_secs: u64,
    /// Cancel sends queued on unavailable opportunistic links
    pub cancel_on_unavailable: bool,
    /// Recursive route resolution bound
    pub max_route_to_chain: usize,
    /// Per-processor event queue depth
    pub event_queue_capacity: usize,
    /// Lifetime of locally generated administrative bundles, seconds
    pub admin_lifetime_secs: u64,
    /// Declarative links
    pub links: Vec<LinkConfigEntry>,
    /// Declarative routes
    pub routes: Vec<RouteConfigEntry>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local_eid: EndpointId::parse("dtn://localhost").expect("valid default eid"),
            storage: StorageConfig::default(),
            custody: CustodyTimerParams::default(),
            acs: AcsConfig::default(),
            idle_shutdown_secs: 0,
            cancel_on_unavailable: true,
            max_route_to_chain: 10,
            event_queue_capacity: 1024,
            admin_lifetime_secs: 3600,
            links: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// Configuration problems found by [`NodeConfig::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The local EID is null
    NullLocalEid,
    /// Two links share a name
    DuplicateLinkName(String),
    /// A link entry does not parse
    BadLink(String),
    /// A route entry does not parse
    BadRoute(String),
    /// A route names a link that is not configured
    RouteToUnknownLink(String),
    /// ACS batching enabled with a zero-second window
    AcsWindowZero,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::NullLocalEid => write!(f, "local_eid is the null endpoint"),
            ConfigWarning::DuplicateLinkName(name) => {
                write!(f, "duplicate link name '{name}'")
            }
            ConfigWarning::BadLink(err) => write!(f, "invalid link: {err}"),
            ConfigWarning::BadRoute(err) => write!(f, "invalid route: {err}"),
            ConfigWarning::RouteToUnknownLink(name) => {
                write!(f, "route names unknown link '{name}'")
            }
            ConfigWarning::AcsWindowZero => {
                write!(f, "acs.delay_secs is 0 with batching enabled")
            }
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| DaemonError::Configuration(format!("cannot parse {}: {e}", path.display())))
    }

    /// Check for problems; an empty list means the configuration is usable
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.local_eid.is_null() {
            warnings.push(ConfigWarning::NullLocalEid);
        }
        if self.acs.enabled && self.acs.delay_secs == 0 {
            warnings.push(ConfigWarning::AcsWindowZero);
        }

        let mut names = std::collections::HashSet::new();
        for link in &self.links {
            if !names.insert(link.name.clone()) {
                warnings.push(ConfigWarning::DuplicateLinkName(link.name.clone()));
            }
            if let Err(e) = link.build() {
                warnings.push(ConfigWarning::BadLink(e.to_string()));
            }
        }

        for route in &self.routes {
            match route.build() {
                Ok(entry) => {
                    if let NextHop::Link(link) = &entry.next_hop {
                        if !names.contains(link) {
                            warnings.push(ConfigWarning::RouteToUnknownLink(link.clone()));
                        }
                    }
                }
                Err(e) => warnings.push(ConfigWarning::BadRoute(e.to_string())),
            }
        }

        warnings
    }

    /// Whether validate found nothing
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NodeConfig::default().is_valid());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: NodeConfig = toml::from_str(
            r#"
            local_eid = "dtn://node-a"
            "#,
        )
        .unwrap();
        assert_eq!(config.local_eid.as_str(), "dtn://node-a");
        assert_eq!(config.max_route_to_chain, 10);
        assert!(config.acs.enabled);
    }

    #[test]
    fn test_parse_full_toml() {
        let config: NodeConfig = toml::from_str(
            r#"
            local_eid = "ipn:7.0"
            idle_shutdown_secs = 120

            [storage]
            payload_quota = 1048576

            [custody]
            base_secs = 10
            max_retries = 3

            [acs]
            size_threshold = 10
            delay_secs = 5

            [[links]]
            name = "uplink"
            link_type = "ondemand"
            nexthop = "10.0.0.2:4556"
            cl = "loopback"
            remote_eid = "ipn:8.*"
            reliable = true
            mtu = 3000

            [[routes]]
            dest = "ipn:8.*"
            link = "uplink"
            priority = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.custody.base_secs, 10);
        assert_eq!(config.custody.max_retries, 3);
        // Unset custody fields keep defaults
        assert_eq!(config.custody.per_retry_secs, 15);
        assert_eq!(config.acs.size_threshold, 10);
        assert_eq!(config.storage.payload_quota, 1_048_576);

        assert_eq!(config.links.len(), 1);
        let link = config.links[0].build().unwrap();
        assert!(link.params().reliable);
        assert_eq!(link.params().mtu, 3000);

        let route = config.routes[0].build().unwrap();
        assert_eq!(route.priority, 3);
        assert!(config.is_valid());
    }

    #[test]
    fn test_route_requires_one_target() {
        let entry = RouteConfigEntry {
            dest: "dtn://x/*".into(),
            link: None,
            endpoint: None,
            priority: 0,
            action: None,
            cost: 0,
        };
        assert!(entry.build().is_err());
    }

    #[test]
    fn test_validate_flags_unknown_route_link() {
        let config: NodeConfig = toml::from_str(
            r#"
            [[routes]]
            dest = "dtn://x/*"
            link = "nope"
            "#,
        )
        .unwrap();
        assert!(config
            .validate()
            .contains(&ConfigWarning::RouteToUnknownLink("nope".into())));
    }

    #[test]
    fn test_validate_flags_bad_link_params() {
        let config: NodeConfig = toml::from_str(
            r#"
            [[links]]
            name = "l"
            link_type = "alwayson"
            nexthop = "x"
            idle_close_time = 5
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate().first(),
            Some(ConfigWarning::BadLink(_))
        ));
    }
}
