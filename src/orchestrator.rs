//! Parallel collection across the selected hypervisors.
//!
//! One worker thread runs per host, gated by a [`Semaphore`] sized to the
//! configured connection limit. The dispatcher blocks on the semaphore before
//! spawning each job, then joins every worker before persisting the skew
//! report. Jobs share nothing but the skew log, the result channel and the
//! scratch directory, in which each job owns its own subdirectory named after
//! the host address.

use crossbeam_channel::unbounded;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::inventory::{HostKey, HostRecord, HostSet};
use crate::job::{run_job, JobConfig, JobOutcome};
use crate::pool::Semaphore;
use crate::remote::RemoteShell;
use crate::severity::Severity;
use crate::skew::SkewLog;

/// Fleet size from which the user is asked before collecting.
pub const MAX_WARN_HOSTS_COUNT: usize = 10;

/// Default number of concurrent collection jobs.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Answer assumed when the user just presses Enter at the prompt.
pub const PROCEED_BY_DEFAULT: bool = true;

/// Asks the user a yes/no question.
pub trait Confirmer {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F> Confirmer for F
where
    F: Fn(&str) -> bool,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Settings shared by every job of a collection run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_connections: usize,
    /// Batch mode: never prompt.
    pub quiet: bool,
    pub ticket_number: Option<String>,
    /// Report option given to one designated host per datacenter.
    pub designated_option: Option<String>,
    pub scratch_dir: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            quiet: false,
            ticket_number: None,
            designated_option: None,
            scratch_dir: scratch_dir.into(),
        }
    }
}

/// Summary of a finished collection run.
#[derive(Debug, Clone)]
pub struct CollectionReport {
    /// One outcome per dispatched host, sorted by host.
    pub outcomes: Vec<JobOutcome>,
    /// Most severe outcome of the run.
    pub severity: Severity,
    /// Location of the skew report, if it could be written.
    pub skew_report: Option<PathBuf>,
    pub skew_records: usize,
}

/// Pick one host per datacenter for the designated report option: the
/// running SPM host if there is one, else the first host that is up.
pub fn designate_hosts(hosts: &HostSet) -> BTreeMap<String, HostKey> {
    let mut chosen: BTreeMap<String, &HostRecord> = BTreeMap::new();
    for host in hosts.iter().filter(|h| h.is_up) {
        match chosen.entry(host.datacenter.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(host);
            }
            Entry::Occupied(mut entry) => {
                if host.is_active_spm() && !entry.get().is_active_spm() {
                    entry.insert(host);
                }
            }
        }
    }
    chosen
        .into_iter()
        .map(|(datacenter, host)| (datacenter, host.key()))
        .collect()
}

/// Drives collection jobs over a host set.
/// Staging directory name for every host.
///
/// The address is used as is unless several hosts share it, in which case
/// each of them gets an `_<n>` suffix in key order.
pub fn staging_dir_names(hosts: &HostSet) -> BTreeMap<HostKey, String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for host in hosts.iter() {
        *counts.entry(host.address.trim()).or_default() += 1;
    }

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    hosts
        .iter()
        .map(|host| {
            let address = host.address.trim();
            let name = if counts[address] > 1 {
                let n = seen.entry(address).or_default();
                *n += 1;
                format!("{}_{}", address, n)
            } else {
                address.to_string()
            };
            (host.key(), name)
        })
        .collect()
}

pub struct Orchestrator<'a> {
    config: OrchestratorConfig,
    shell: &'a dyn RemoteShell,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: OrchestratorConfig, shell: &'a dyn RemoteShell) -> Self {
        Self { config, shell }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Collect from every host in `hosts`.
    ///
    /// Returns `None` when the user declined to proceed; no job was started
    /// in that case.
    pub fn run(&self, hosts: &HostSet, confirmer: &dyn Confirmer) -> Option<CollectionReport> {
        if !self.config.quiet && hosts.len() >= MAX_WARN_HOSTS_COUNT {
            warn!(
                "{number} hypervisors detected. It might take some time to collect logs \
                 from {number} hypervisors. You can use the following filters -c, -d, -H. \
                 For more information use -h",
                number = hosts.len()
            );
            if !confirmer.confirm("Do you want to proceed") {
                info!("Aborting hypervisor collection...");
                return None;
            }
        }

        info!("Gathering information from selected hypervisors...");

        let designated = designate_hosts(hosts);
        let mut dir_names = staging_dir_names(hosts);
        let semaphore = Semaphore::new(self.config.max_connections);
        let skew = SkewLog::new();
        let (sender, receiver) = unbounded();
        let mut panicked = Vec::new();

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(hosts.len());

            for host in hosts.iter() {
                let permit = semaphore.acquire();
                let extra = designated
                    .get(&host.datacenter)
                    .filter(|key| **key == host.key())
                    .and(self.config.designated_option.as_deref());
                let mut job = JobConfig::for_host(
                    host,
                    self.config.ticket_number.as_deref(),
                    extra,
                    &self.config.scratch_dir,
                );
                if let Some(name) = dir_names.remove(&host.key()) {
                    job = job.dir_name(name);
                }
                let sender = sender.clone();
                let skew = &skew;
                let shell = self.shell;

                let label = job.host.clone();
                let handle = scope.spawn(move || {
                    let _permit = permit;
                    let outcome = run_job(&job, shell, skew);
                    let _ = sender.send(outcome);
                });
                handles.push((label, handle));
            }

            for (host, handle) in handles {
                if handle.join().is_err() {
                    error!("Collection job for {} terminated unexpectedly", host);
                    panicked.push(host);
                }
            }
        });
        drop(sender);

        let mut outcomes: Vec<JobOutcome> = receiver.iter().collect();
        for host in panicked {
            let mut outcome = JobOutcome::new(host);
            outcome.fail(Severity::Warning, "collection job terminated unexpectedly");
            outcomes.push(outcome);
        }
        outcomes.sort_by(|a, b| a.host.cmp(&b.host));

        let mut severity: Severity = outcomes.iter().map(|o| o.severity).collect();
        let skew_report = match skew.write_report(&self.config.scratch_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Could not write clock skew report: {}", e);
                severity.escalate(Severity::Warning);
                None
            }
        };

        Some(CollectionReport {
            outcomes,
            severity,
            skew_report,
            skew_records: skew.len(),
        })
    }
}
