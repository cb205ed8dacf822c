//! Collection runs against a scripted remote shell.

use buckos_collector::inventory::{ClusterRef, HostRecord, HostSet};
use buckos_collector::job::{DATE_COMMAND, LISTING_COMMAND, LISTING_FILE};
use buckos_collector::orchestrator::{Orchestrator, OrchestratorConfig, PROCEED_BY_DEFAULT};
use buckos_collector::remote::{CommandOutput, RemoteShell};
use buckos_collector::skew::TIME_DIFF_FILE;
use buckos_collector::{Error, Result, Severity};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Remote shell answering like a healthy hypervisor, with per-host faults.
#[derive(Default)]
struct ScriptedShell {
    running: AtomicUsize,
    peak: AtomicUsize,
    report_delay: Duration,
    fail_fetch: HashSet<String>,
    broken_report: HashSet<String>,
    host_time: Option<String>,
    commands: Mutex<Vec<(String, String)>>,
}

impl ScriptedShell {
    fn ok(stdout: impl Into<String>) -> Result<CommandOutput> {
        Ok(CommandOutput {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        })
    }

    fn report_commands(&self) -> Vec<(String, String)> {
        self.commands
            .lock()
            .iter()
            .filter(|(_, command)| command.contains("/usr/sbin/sosreport"))
            .cloned()
            .collect()
    }
}

impl RemoteShell for ScriptedShell {
    fn run(&self, host: &str, command: &str) -> Result<CommandOutput> {
        self.commands
            .lock()
            .push((host.to_string(), command.to_string()));

        if command.contains("/usr/sbin/sosreport") {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.report_delay);
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.broken_report.contains(host) {
                return Self::ok("No valid version of sosreport found.\n");
            }
            return Self::ok(format!(
                "Your sosreport has been generated and saved in:\n  \
                 /var/tmp/sosreport-{}-20240101.tar.xz\n\nThe checksum is: abc123\n",
                host
            ));
        }
        if command == LISTING_COMMAND {
            // ls exits non-zero when /rhev is missing; the listing is kept.
            return Ok(CommandOutput {
                status: Some(2),
                stdout: format!("{} listing\n", host),
                stderr: "No such file or directory\n".to_string(),
            });
        }
        if command == DATE_COMMAND {
            return match &self.host_time {
                Some(time) => Self::ok(format!("{}\n", time)),
                None => Self::ok("not a date\n"),
            };
        }
        Self::ok("")
    }

    fn fetch(&self, host: &str, remote_path: &str, local_path: &Path) -> Result<()> {
        if self.fail_fetch.contains(host) {
            return Err(Error::CommandFailed {
                host: host.to_string(),
                command: format!("scp {}:{}", host, remote_path),
                stderr: "Connection reset".to_string(),
            });
        }
        std::fs::write(local_path, remote_path).map_err(|e| Error::io(local_path, e))
    }
}

fn hosts(count: usize) -> HostSet {
    let cluster = ClusterRef::new("c1", "clusterA", false);
    (1..=count)
        .map(|i| HostRecord::new("dc1", cluster.clone(), format!("h{:02}", i), i == 1, true))
        .collect()
}

fn config(scratch: &TempDir, max_connections: usize, quiet: bool) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(scratch.path());
    config.max_connections = max_connections;
    config.quiet = quiet;
    config
}

fn yes(_: &str) -> bool {
    true
}

mod dispatch_tests {
    use super::*;

    #[test]
    fn test_concurrency_never_exceeds_limit() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell {
            report_delay: Duration::from_millis(20),
            ..Default::default()
        };

        let report = Orchestrator::new(config(&scratch, 3, true), &shell)
            .run(&hosts(12), &yes)
            .unwrap();

        assert_eq!(report.outcomes.len(), 12);
        let peak = shell.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 3, "peak concurrency {}", peak);
        assert_eq!(report.severity, Severity::Clean);
    }

    #[test]
    fn test_every_host_gets_its_own_directory() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell::default();

        let report = Orchestrator::new(config(&scratch, 2, true), &shell)
            .run(&hosts(4), &yes)
            .unwrap();

        for outcome in &report.outcomes {
            let dir = scratch.path().join(&outcome.host);
            let artifact = outcome.artifact.as_ref().unwrap();
            assert!(artifact.starts_with(&dir));
            assert_eq!(
                artifact.file_name().unwrap().to_string_lossy(),
                format!("{}-sosreport-{}-20240101.tar.xz", outcome.host, outcome.host)
            );
            let listing = std::fs::read_to_string(dir.join("selinux").join(LISTING_FILE)).unwrap();
            assert_eq!(listing, format!("{} listing\n", outcome.host));
        }
    }

    #[test]
    fn test_remote_report_is_removed() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell::default();
        Orchestrator::new(config(&scratch, 1, true), &shell)
            .run(&hosts(1), &yes)
            .unwrap();
        let commands = shell.commands.lock();
        assert!(commands
            .iter()
            .any(|(_, c)| c == "/bin/rm /var/tmp/sosreport-h01-20240101.tar.xz*"));
    }

    #[test]
    fn test_shared_address_in_two_clusters() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell::default();
        let fleet: HostSet = vec![
            HostRecord::new("dc1", ClusterRef::new("c1", "clusterA", false), "h1", false, true),
            HostRecord::new("dc1", ClusterRef::new("c2", "clusterB", false), "h1", false, true),
        ]
        .into_iter()
        .collect();

        let report = Orchestrator::new(config(&scratch, 2, true), &shell)
            .run(&fleet, &yes)
            .unwrap();

        assert_eq!(report.severity, Severity::Clean);
        assert_eq!(report.outcomes.len(), 2);
        let dirs: HashSet<_> = report
            .outcomes
            .iter()
            .map(|o| o.artifact.as_ref().unwrap().parent().unwrap().to_path_buf())
            .collect();
        assert_eq!(dirs.len(), 2);
        assert!(dirs.iter().all(|dir| dir.starts_with(scratch.path())));

        let removals = shell
            .commands
            .lock()
            .iter()
            .filter(|(_, c)| c.starts_with("/bin/rm "))
            .count();
        assert_eq!(removals, 2);
    }

    #[test]
    fn test_designated_option_once_per_datacenter() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell::default();
        let mut config = config(&scratch, 4, true);
        config.designated_option = Some("-k vdsm.dump_volume_chains=on".to_string());

        let other = ClusterRef::new("c9", "clusterZ", false);
        let mut fleet = hosts(3);
        fleet.insert(HostRecord::new("dc2", other.clone(), "z1", false, true));
        fleet.insert(HostRecord::new("dc2", other, "z2", true, true));

        Orchestrator::new(config, &shell).run(&fleet, &yes).unwrap();

        let designated: Vec<String> = shell
            .report_commands()
            .into_iter()
            .filter(|(_, command)| command.contains("vdsm.dump_volume_chains=on"))
            .map(|(host, _)| host)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(designated, vec!["h01", "z2"]);
    }
}

mod failure_tests {
    use super::*;

    #[test]
    fn test_fetch_failure_is_isolated() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell {
            fail_fetch: HashSet::from(["h02".to_string()]),
            ..Default::default()
        };

        let report = Orchestrator::new(config(&scratch, 3, true), &shell)
            .run(&hosts(3), &yes)
            .unwrap();

        assert_eq!(report.severity, Severity::Warning);
        for outcome in &report.outcomes {
            if outcome.host == "h02" {
                assert_eq!(outcome.severity, Severity::Warning);
                assert!(outcome.artifact.is_none());
                // The job went on after the failed copy.
                assert!(scratch.path().join("h02/selinux").join(LISTING_FILE).exists());
            } else {
                assert_eq!(outcome.severity, Severity::Clean);
                assert!(outcome.artifact.as_ref().unwrap().exists());
            }
        }
    }

    #[test]
    fn test_unparseable_report_is_critical() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell {
            broken_report: HashSet::from(["h01".to_string()]),
            ..Default::default()
        };

        let report = Orchestrator::new(config(&scratch, 2, true), &shell)
            .run(&hosts(2), &yes)
            .unwrap();

        assert_eq!(report.severity, Severity::Critical);
        assert_eq!(report.outcomes[0].host, "h01");
        assert_eq!(report.outcomes[0].severity, Severity::Critical);
        assert_eq!(report.outcomes[1].severity, Severity::Clean);
        assert!(!scratch.path().join("h01").exists());
    }
}

mod confirmation_tests {
    use super::*;

    #[test]
    fn test_declining_dispatches_nothing() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell::default();
        let asked = AtomicUsize::new(0);
        let decline = |_: &str| {
            asked.fetch_add(1, Ordering::SeqCst);
            false
        };

        let report = Orchestrator::new(config(&scratch, 4, false), &shell).run(&hosts(10), &decline);

        assert!(report.is_none());
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert!(shell.commands.lock().is_empty());
        assert!(!scratch.path().join(TIME_DIFF_FILE).exists());
    }

    #[test]
    fn test_default_answer_proceeds() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell::default();
        let enter = |_: &str| PROCEED_BY_DEFAULT;

        let report = Orchestrator::new(config(&scratch, 4, false), &shell).run(&hosts(10), &enter);

        assert_eq!(report.unwrap().outcomes.len(), 10);
        assert_eq!(shell.report_commands().len(), 10);
    }

    #[test]
    fn test_small_fleet_is_not_prompted() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell::default();
        let asked = AtomicUsize::new(0);
        let count = |_: &str| {
            asked.fetch_add(1, Ordering::SeqCst);
            true
        };

        let report = Orchestrator::new(config(&scratch, 4, false), &shell).run(&hosts(9), &count);

        assert_eq!(report.unwrap().outcomes.len(), 9);
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_quiet_never_prompts() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell::default();
        let refuse = |_: &str| -> bool { panic!("prompted in quiet mode") };

        let report = Orchestrator::new(config(&scratch, 4, true), &shell).run(&hosts(10), &refuse);
        assert_eq!(report.unwrap().outcomes.len(), 10);
    }
}

mod skew_tests {
    use super::*;

    #[test]
    fn test_skew_report_lists_every_host() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell {
            host_time: Some("2100-01-01T00:00:00+00:00".to_string()),
            ..Default::default()
        };

        let report = Orchestrator::new(config(&scratch, 2, true), &shell)
            .run(&hosts(3), &yes)
            .unwrap();

        assert_eq!(report.skew_records, 3);
        let path = report.skew_report.unwrap();
        assert_eq!(path, scratch.path().join(TIME_DIFF_FILE));

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Node"));
        let mut hosts: Vec<&str> = lines[1..]
            .iter()
            .map(|line| line.split(" : ").next().unwrap().trim())
            .collect();
        hosts.sort();
        assert_eq!(hosts, vec!["h01", "h02", "h03"]);
        assert!(lines[1..].iter().all(|line| line.contains(" : +")));
    }

    #[test]
    fn test_unparseable_host_time_is_not_an_error() {
        let scratch = TempDir::new().unwrap();
        let shell = ScriptedShell::default();

        let report = Orchestrator::new(config(&scratch, 2, true), &shell)
            .run(&hosts(2), &yes)
            .unwrap();

        assert_eq!(report.severity, Severity::Clean);
        assert_eq!(report.skew_records, 0);
        let content = std::fs::read_to_string(report.skew_report.unwrap()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
