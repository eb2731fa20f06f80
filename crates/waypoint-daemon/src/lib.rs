//! # Waypoint Daemon
//!
//! The bundle-processing engine of the Waypoint DTN node: the event bus
//! and its five processors, links and contacts, registrations, custody
//! transfer with aggregate custody signals, fragmentation and
//! reassembly, and the pluggable router seam.
//!
//! ## Architecture
//!
//! ```text
//!           ┌────────────────────────────────────────────────┐
//!           │                 DaemonCore                      │
//!           ├────────────────────────────────────────────────┤
//!  arrivals │ input ─► main ─► output ─► convergence layer    │
//!           │           │  └─► storage (async persistence)    │
//!           │           └────► acs (signal batching)          │
//!           └────────────────────────────────────────────────┘
//! ```
//!
//! Each processor is a single-consumer task over its own bounded queue;
//! one event is handled to completion before the next is dequeued, and
//! routers observe events after the daemon does.

pub mod acs;
pub mod acs_task;
pub mod bus;
pub mod clayer;
pub mod config;
pub mod contact;
pub mod custody;
pub mod daemon;
pub mod error;
pub mod event;
pub mod fragmentation;
pub mod input;
pub mod link;
pub mod output;
pub mod registration;
pub mod router;
pub mod stats;
pub mod storage_task;

pub use acs::{AcsConfig, AcsEngine, AcsKey};
pub use bus::{EventBus, EventEnvelope, EventQueue, ProcessorQueues};
pub use clayer::{ClError, ConvergenceLayer, LoopbackConvergenceLayer};
pub use config::{ConfigWarning, LinkConfigEntry, NodeConfig, RouteConfigEntry, StorageConfig};
pub use contact::{Contact, ContactRef};
pub use custody::{CustodyTimerParams, CustodyTimers};
pub use daemon::{BundleDaemon, DaemonCore, ReportKind, SubmitOptions};
pub use error::{DaemonError, DaemonResult};
pub use event::{BundleEvent, ContactReason, EventSource, Processor};
pub use fragmentation::{plan_fragments, plan_tail, FragmentPlan, ReassemblyTracker};
pub use link::{Link, LinkParams, LinkRef, LinkState, LinkStats, LinkType};
pub use registration::{
    DeliveryOutcome, FailureAction, Registration, RegistrationTable, FIRST_APP_REGID,
};
pub use router::{ExternalRouter, Router, RouterCommand, TableRouter};
pub use stats::{DaemonStats, DaemonStatsSnapshot};
