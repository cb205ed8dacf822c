//! Collection job for a single hypervisor.
//!
//! A job runs the report tool on the host, copies the resulting archive into
//! the host's own staging directory, records a file-label listing and
//! measures the host's clock skew. Errors never leave the job: they are
//! logged and folded into the returned [`JobOutcome`].

use chrono::{DateTime, FixedOffset, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::inventory::HostRecord;
use crate::remote::RemoteShell;
use crate::severity::Severity;
use crate::skew::{parse_host_time, SkewLog, SkewRecord};

/// Report plugins collected from every hypervisor.
pub const BASE_REPORTS: &[&str] = &[
    "libvirt",
    "vdsm",
    "general",
    "networking",
    "hardware",
    "process",
    "yum",
    "filesys",
    "devicemapper",
    "selinux",
    "kernel",
    "memory",
    "rpm",
];

/// Plugins only available with report tool 3.0 and later.
pub const EXTENDED_REPORTS: &[&str] = &[
    "processor",
    "pci",
    "md",
    "block",
    "scsi",
    "multipath",
    "systemd",
    "sanlock",
    "lvm2",
];

/// Plugins understood by the oldest supported report tool.
pub const LEGACY_REPORTS: &[&str] = &[
    "vdsm",
    "general",
    "networking",
    "hardware",
    "process",
    "yum",
    "filesys",
];

/// Directory relative report paths are resolved against on the host.
pub const REMOTE_TMP_DIR: &str = "/var/tmp";

/// Command producing the file-label listing.
pub const LISTING_COMMAND: &str = "/bin/ls -lRZ /etc /var /rhev";

/// File the listing is stored in, below `<host>/selinux/`.
pub const LISTING_FILE: &str = "ls_-lRZ_etc_var_rhev";

/// Command printing the host's wall clock.
pub const DATE_COMMAND: &str = "date --iso-8601=seconds";

/// Everything a job needs to know, copied out of the run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobConfig {
    pub host: String,
    pub datacenter: String,
    pub cluster: String,
    pub gluster_enabled: bool,
    pub ticket_number: Option<String>,
    /// Extra report option for the datacenter's designated host.
    pub extra_option: Option<String>,
    /// Root of the per-host staging directories.
    pub scratch_dir: PathBuf,
    /// Name of this job's directory below `scratch_dir`.
    pub dir_name: String,
}

impl JobConfig {
    pub fn for_host(
        host: &HostRecord,
        ticket_number: Option<&str>,
        extra_option: Option<&str>,
        scratch_dir: &Path,
    ) -> Self {
        let address = host.address.trim().to_string();
        Self {
            dir_name: address.clone(),
            host: address,
            datacenter: host.datacenter.clone(),
            cluster: host.cluster.name.clone(),
            gluster_enabled: host.cluster.gluster_enabled,
            ticket_number: ticket_number.map(str::to_string),
            extra_option: extra_option.map(str::to_string),
            scratch_dir: scratch_dir.to_path_buf(),
        }
    }

    pub fn dir_name(mut self, dir_name: impl Into<String>) -> Self {
        self.dir_name = dir_name.into();
        self
    }

    /// Staging directory owned by this job.
    pub fn host_dir(&self) -> PathBuf {
        self.scratch_dir.join(&self.dir_name)
    }

    /// Comma separated base plugin list, with gluster when enabled.
    pub fn reports(&self) -> String {
        let mut reports = BASE_REPORTS.join(",");
        if self.gluster_enabled {
            reports.push_str(",gluster");
        }
        reports
    }

    /// Shell script run on the host to produce the report.
    pub fn report_command(&self) -> String {
        let mut option = String::new();
        if let Some(ticket) = &self.ticket_number {
            option.push_str(&format!("--ticket-number={} ", ticket));
        }
        if let Some(extra) = &self.extra_option {
            option.push_str(extra);
            option.push(' ');
        }
        let reports = self.reports();
        let extended = EXTENDED_REPORTS.join(",");
        let legacy = LEGACY_REPORTS.join(",");

        format!(
            r#"VERSION=`/bin/rpm -q --qf '[%{{VERSION}}]' sos | /bin/sed 's/\.//'`;
if [ "$VERSION" -ge "32" ]; then
    /usr/sbin/sosreport {option}--batch --all-logs -o logs,{reports},{extended},ovirt_hosted_engine
elif [ "$VERSION" -ge "30" ]; then
    /usr/sbin/sosreport {option}--batch -k logs.all_logs=True -o logs,{reports},{extended}
elif [ "$VERSION" -ge "22" ]; then
    /usr/sbin/sosreport {option}--batch -k general.all_logs=True -o {reports}
elif [ "$VERSION" -ge "17" ]; then
    /usr/sbin/sosreport {option}--no-progressbar -k general.all_logs=True -o {legacy}
else
    /bin/echo "No valid version of sosreport found." 1>&2
    exit 1
fi
"#
        )
    }
}

/// Report archive announced by the report tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifact {
    pub filename: String,
    /// Absolute path of the archive on the host that produced it.
    pub path: String,
    pub checksum: Option<String>,
}

fn is_report_line(line: &str) -> bool {
    line.find("sosreport-")
        .map(|idx| line[idx..].contains("tar"))
        .unwrap_or(false)
}

fn is_checksum_line(line: &str) -> bool {
    line.starts_with("The md5sum is") || line.starts_with("The checksum is")
}

/// Extract the archive location and checksum from report tool output.
///
/// Relative paths are resolved against `base_dir`.
pub fn parse_report_output(stdout: &str, base_dir: &Path) -> Result<ReportArtifact> {
    let line = stdout
        .lines()
        .find(|line| is_report_line(line))
        .ok_or(Error::ReportOutput)?;
    let raw = line.trim();
    let filename = Path::new(raw)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or(Error::ReportOutput)?;
    let path = if Path::new(raw).is_absolute() {
        raw.to_string()
    } else {
        base_dir.join(&filename).display().to_string()
    };

    let checksum = stdout
        .lines()
        .find(|line| is_checksum_line(line))
        .and_then(|line| line.split_once(": "))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty());

    debug!("filename({})", filename);
    debug!("path({})", path);
    debug!("checksum({:?})", checksum);

    Ok(ReportArtifact {
        filename,
        path,
        checksum,
    })
}

/// Result of one host's collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub host: String,
    pub severity: Severity,
    /// Archive copied into the staging area, if the copy succeeded.
    pub artifact: Option<PathBuf>,
    pub failures: Vec<String>,
}

impl JobOutcome {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            severity: Severity::Clean,
            artifact: None,
            failures: Vec::new(),
        }
    }

    /// Record a failure of the given severity.
    pub fn fail(&mut self, severity: Severity, message: impl Into<String>) {
        self.severity.escalate(severity);
        self.failures.push(message.into());
    }

    fn soft_failure(&mut self, step: &str, err: &Error) {
        warn!("{}: {} failed: {}", self.host, step, err);
        self.fail(Severity::Warning, format!("{}: {}", step, err));
    }
}

/// Run the collection for one host.
pub fn run_job(config: &JobConfig, shell: &dyn RemoteShell, skew: &SkewLog) -> JobOutcome {
    let mut outcome = JobOutcome::new(&config.host);
    info!("collecting information from {}", config.host);

    if let Err(e) = collect(config, shell, skew, &mut outcome) {
        let severity = match e {
            Error::ReportOutput => Severity::Critical,
            _ => Severity::Warning,
        };
        error!("Failed to collect logs from: {}; {}", config.host, e);
        debug!("Configuration for {}:", config.host);
        for line in format!("{:#?}", config).lines() {
            debug!("{}", line);
        }
        outcome.fail(severity, e.to_string());
    }

    info!("finished collecting information from {}", config.host);
    outcome
}

fn collect(
    config: &JobConfig,
    shell: &dyn RemoteShell,
    skew: &SkewLog,
    outcome: &mut JobOutcome,
) -> Result<()> {
    let host = config.host.as_str();

    if config.gluster_enabled {
        info!("Gluster logs will be collected from {}", host);
    }
    let stdout = shell
        .run(host, &config.report_command())?
        .into_checked(host, "sosreport")?;
    let artifact = parse_report_output(&stdout, Path::new(REMOTE_TMP_DIR))?;

    let host_dir = config.host_dir();
    std::fs::create_dir(&host_dir).map_err(|e| Error::io(&host_dir, e))?;

    let local_path = host_dir.join(format!("{}-{}", host, artifact.filename));
    match shell.fetch(host, &artifact.path, &local_path) {
        Ok(()) => outcome.artifact = Some(local_path),
        Err(e) => outcome.soft_failure("fetch report", &e),
    }

    let cleanup = format!("/bin/rm {}*", artifact.path);
    if let Err(e) = shell
        .run(host, &cleanup)
        .and_then(|output| output.into_checked(host, &cleanup))
    {
        outcome.soft_failure("remove remote report", &e);
    }

    match shell.run(host, LISTING_COMMAND) {
        Ok(output) => {
            if !output.success() {
                debug!(
                    "{}: {} exited with {:?}",
                    host, LISTING_COMMAND, output.status
                );
            }
            if let Err(e) = write_listing(&host_dir, &output.stdout) {
                outcome.soft_failure("write file listing", &e);
            }
        }
        Err(e) => outcome.soft_failure("file listing", &e),
    }

    match shell
        .run(host, DATE_COMMAND)
        .and_then(|output| output.into_checked(host, DATE_COMMAND))
    {
        Ok(stdout) => {
            let local_time: DateTime<FixedOffset> = Local::now().into();
            match parse_host_time(&stdout) {
                Ok(host_time) => {
                    debug!("host <{}> time: {}", host, host_time.to_rfc3339());
                    debug!("local <localhost> time: {}", local_time.to_rfc3339());
                    skew.append(SkewRecord::measure(host, host_time, local_time));
                }
                Err(e) => debug!("get_time_diff: {}", e),
            }
        }
        Err(e) => outcome.soft_failure("read host time", &e),
    }

    Ok(())
}

fn write_listing(host_dir: &Path, content: &str) -> Result<()> {
    let dir = host_dir.join("selinux");
    std::fs::create_dir(&dir).map_err(|e| Error::io(&dir, e))?;
    let path = dir.join(LISTING_FILE);
    std::fs::write(&path, content).map_err(|e| Error::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ClusterRef;

    fn config(gluster: bool) -> JobConfig {
        let host = HostRecord::new(
            "dc1",
            ClusterRef::new("c1", "clusterA", gluster),
            " h1 ",
            false,
            true,
        );
        JobConfig::for_host(&host, Some("00123"), None, Path::new("/tmp/scratch"))
    }

    #[test]
    fn test_parse_absolute_path() {
        let stdout = "\
Creating compressed archive...

Your sosreport has been generated and saved in:
  /var/tmp/sosreport-h1-20240101.tar.xz

The checksum is: 0123abcd
";
        let artifact = parse_report_output(stdout, Path::new(REMOTE_TMP_DIR)).unwrap();
        assert_eq!(artifact.filename, "sosreport-h1-20240101.tar.xz");
        assert_eq!(artifact.path, "/var/tmp/sosreport-h1-20240101.tar.xz");
        assert_eq!(artifact.checksum.as_deref(), Some("0123abcd"));
    }

    #[test]
    fn test_parse_relative_path_and_md5_line() {
        let stdout = "sosreport-h1.tar.bz2\nThe md5sum is: ffff\n";
        let artifact = parse_report_output(stdout, Path::new("/var/tmp")).unwrap();
        assert_eq!(artifact.path, "/var/tmp/sosreport-h1.tar.bz2");
        assert_eq!(artifact.checksum.as_deref(), Some("ffff"));
    }

    #[test]
    fn test_parse_without_archive_line_fails() {
        let err = parse_report_output("No valid version\n", Path::new("/var/tmp")).unwrap_err();
        assert!(matches!(err, Error::ReportOutput));
    }

    #[test]
    fn test_checksum_is_optional() {
        let artifact =
            parse_report_output("/tmp/sosreport-x.tar.xz\n", Path::new("/var/tmp")).unwrap();
        assert_eq!(artifact.checksum, None);
    }

    #[test]
    fn test_gluster_adds_report() {
        assert!(!config(false).reports().contains("gluster"));
        assert!(config(true).reports().ends_with(",gluster"));
    }

    #[test]
    fn test_report_command_options() {
        let mut job = config(false);
        assert_eq!(job.host, "h1");
        assert!(job.report_command().contains("--ticket-number=00123 --batch"));
        assert!(job.report_command().contains("'[%{VERSION}]'"));

        job.extra_option = Some("-k vdsm.dump_volume_chains=on".to_string());
        assert!(job
            .report_command()
            .contains("--ticket-number=00123 -k vdsm.dump_volume_chains=on --batch"));
    }
}
