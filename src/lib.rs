//! Buckos fleet log collector
//!
//! Collects diagnostic reports from a managed fleet (the engine node, its
//! database and the hypervisors it manages) and packs them into a single
//! archive for support analysis.
//!
//! # Features
//!
//! - **Host selection**: glob and exact-name filters over hosts, clusters and
//!   datacenters, with DNS reconciliation and one-host-per-cluster reduction
//! - **Parallel collection**: bounded worker pool, per-host isolation,
//!   partial-failure tolerance
//! - **Clock skew report**: host versus collector time for every hypervisor
//! - **Archive assembly**: deterministic naming, restrictive permissions and
//!   a SHA-256 sidecar
//!
//! # Example
//!
//! ```no_run
//! use buckos_collector::{
//!     filter::{select, FilterSpec, SystemResolver},
//!     inventory::{fetch_fleet, FileInventory},
//!     orchestrator::{Orchestrator, OrchestratorConfig},
//!     remote::SshShell,
//! };
//! use std::path::Path;
//!
//! let inventory = FileInventory::load(Path::new("/etc/buckos/fleet.json")).unwrap();
//! let fleet = fetch_fleet(&inventory).unwrap();
//!
//! let spec = FilterSpec {
//!     clusters: vec!["prod-*".to_string()],
//!     ..Default::default()
//! };
//! let selection = select(&fleet, &spec, &SystemResolver).unwrap();
//!
//! let shell = SshShell::default();
//! let orchestrator = Orchestrator::new(OrchestratorConfig::new("/var/tmp/scratch"), &shell);
//! if let Some(report) = orchestrator.run(&selection.hosts, &|_: &str| true) {
//!     println!("collection finished: {}", report.severity);
//! }
//! ```

pub mod archive;
pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod inventory;
pub mod job;
pub mod local;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod remote;
pub mod severity;
pub mod skew;
pub mod staging;

pub use error::{Error, Result};
pub use severity::Severity;
