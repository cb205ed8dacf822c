//! Reports collected on the machine running the collector: the engine
//! report and the database report.

use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::job::parse_report_output;
use crate::remote::{execute, CommandOutput};

/// Local report tool.
pub const REPORT_TOOL: &str = "/usr/sbin/sosreport";

/// Prefix given to the database report and its checksum file.
pub const DATABASE_PREFIX: &str = "postgresql-";

/// Report plugin used for the database.
pub const DATABASE_PLUGIN: &str = "postgresql";

/// Plugins collected on the engine besides the engine plugin itself.
pub const ENGINE_REPORTS: &[&str] = &[
    "rpm",
    "libvirt",
    "general",
    "networking",
    "hardware",
    "process",
    "yum",
    "filesys",
    "devicemapper",
    "selinux",
    "kernel",
    "apache",
    "memory",
];

/// Engine plugins added for report tool versions after 3.0.
pub const EXTENDED_ENGINE_REPORTS: &[&str] =
    &["block", "java", "lvm2", "md", "pci", "processor", "scsi"];

const DWH_PLUGIN: &str = "ovirt_engine_dwh";
const REPORTS_PLUGIN: &str = "ovirt_engine_reports";

/// A local program invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LocalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

// Environment values are never printed.
impl fmt::Debug for LocalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, _) in &self.env {
            write!(f, "{}=*** ", key)?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs local programs.
pub trait CommandRunner: Send + Sync {
    fn call(&self, command: &LocalCommand) -> Result<CommandOutput>;
}

/// [`CommandRunner`] spawning real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn call(&self, command: &LocalCommand) -> Result<CommandOutput> {
        let mut process = Command::new(&command.program);
        process.args(&command.args);
        for (key, value) in &command.env {
            process.env(key, value);
        }
        execute(&mut process, &format!("{:?}", command))
    }
}

fn call_checked(runner: &dyn CommandRunner, command: &LocalCommand) -> Result<String> {
    runner
        .call(command)?
        .into_checked("localhost", &format!("{:?}", command))
}

/// `major.minor` version of the report tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ToolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Assumed when the installed version cannot be determined.
    pub const DEFAULT: ToolVersion = ToolVersion::new(3, 2);

    /// Parse the leading `major.minor` of a version string.
    pub fn parse(version: &str) -> Option<Self> {
        let re = Regex::new(r"(\d+)\.(\d+)").ok()?;
        let caps = re.captures(version.trim())?;
        Some(Self::new(caps[1].parse().ok()?, caps[2].parse().ok()?))
    }

    /// Query the package database for the installed version.
    pub fn detect(runner: &dyn CommandRunner) -> Self {
        let query = LocalCommand::new("/bin/rpm").args(["-q", "--qf", "%{VERSION}", "sos"]);
        match call_checked(runner, &query).map(|out| Self::parse(&out)) {
            Ok(Some(version)) => version,
            Ok(None) => {
                debug!("unrecognized report tool version, assuming {}", Self::DEFAULT);
                Self::DEFAULT
            }
            Err(e) => {
                debug!("report tool version unknown ({}), assuming {}", e, Self::DEFAULT);
                Self::DEFAULT
            }
        }
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Settings for the engine report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReportConfig {
    pub ticket_number: Option<String>,
    pub upload: Option<String>,
    pub include_sensitive_data: bool,
    /// Colon separated keys masked by the engine plugin.
    pub sensitive_keys: Option<String>,
    /// Colon separated keys masked by the warehouse plugin.
    pub dwh_sensitive_keys: Option<String>,
}

/// Report of the engine node, written into the working directory.
pub struct EngineReport<'a> {
    runner: &'a dyn CommandRunner,
    config: EngineReportConfig,
    plugins: String,
    engine_plugin: &'static str,
    version: ToolVersion,
}

/// Engine plugin name advertised by a `--list-plugins` listing.
pub fn engine_plugin(listing: &str) -> &'static str {
    if listing.contains("ovirt.sensitive_keys") {
        "ovirt"
    } else if listing.contains("ovirt-engine.sensitive_keys") {
        "ovirt-engine"
    } else if listing.contains("engine.sensitive_keys") {
        "engine"
    } else {
        error!("ovirt plugin not found, falling back on default");
        "ovirt"
    }
}

impl<'a> EngineReport<'a> {
    /// Inspect the installed report tool.
    pub fn probe(runner: &'a dyn CommandRunner, config: EngineReportConfig) -> Result<Self> {
        let listing = LocalCommand::new(REPORT_TOOL).arg("--list-plugins");
        let plugins = call_checked(runner, &listing)?;
        let version = ToolVersion::detect(runner);
        Ok(Self::with_listing(runner, config, plugins, version))
    }

    pub fn with_listing(
        runner: &'a dyn CommandRunner,
        mut config: EngineReportConfig,
        plugins: String,
        version: ToolVersion,
    ) -> Self {
        let engine_plugin = engine_plugin(&plugins);
        let has_dwh = plugins.contains(&format!("{}.sensitive_keys", DWH_PLUGIN));

        // Without a warehouse plugin its keys are masked by the engine plugin.
        if !has_dwh {
            if let Some(dwh_keys) = config.dwh_sensitive_keys.take() {
                config.sensitive_keys = Some(match config.sensitive_keys.take() {
                    Some(keys) if !keys.is_empty() => format!("{}:{}", keys, dwh_keys),
                    _ => dwh_keys,
                });
            }
        }

        Self {
            runner,
            config,
            plugins,
            engine_plugin,
            version,
        }
    }

    pub fn engine_plugin(&self) -> &'static str {
        self.engine_plugin
    }

    fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains(name)
    }

    /// Report tool options.
    pub fn options(&self) -> Vec<String> {
        let mut opts: Vec<String> = ["-k", "rpm.rpmva=off", "-k", "apache.log=True"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let masked = |keys: &Option<String>| -> Option<String> {
            if self.config.include_sensitive_data {
                Some(":".to_string())
            } else {
                keys.clone().filter(|k| !k.is_empty())
            }
        };
        if let Some(keys) = masked(&self.config.sensitive_keys) {
            opts.push("-k".to_string());
            opts.push(format!("{}.sensitive_keys={}", self.engine_plugin, keys));
        }
        if self.has_plugin(&format!("{}.sensitive_keys", DWH_PLUGIN)) {
            if let Some(keys) = masked(&self.config.dwh_sensitive_keys) {
                opts.push("-k".to_string());
                opts.push(format!("{}.sensitive_keys={}", DWH_PLUGIN, keys));
            }
        }

        if let Some(ticket) = &self.config.ticket_number {
            opts.push(format!("--ticket-number={}", ticket));
        }
        if let Some(upload) = &self.config.upload {
            opts.push(format!("--upload={}", upload));
        }

        if self.version < ToolVersion::new(3, 0) {
            opts.push("--report".to_string());
            opts.push("-k".to_string());
            opts.push("general.all_logs=True".to_string());
        } else if self.version < ToolVersion::new(3, 2) {
            opts.push("-k".to_string());
            opts.push("logs.all_logs=True".to_string());
        } else {
            opts.push("--all-logs".to_string());
        }
        opts
    }

    /// Comma separated plugin list.
    pub fn reports(&self) -> String {
        let mut reports = vec![self.engine_plugin];
        reports.extend_from_slice(ENGINE_REPORTS);
        if self.version > ToolVersion::new(3, 0) {
            reports.extend_from_slice(EXTENDED_ENGINE_REPORTS);
        }
        if self.has_plugin("logs.all_logs") {
            reports.push("logs");
        }
        if self.has_plugin(&format!("{}.sensitive_keys", DWH_PLUGIN)) {
            reports.push(DWH_PLUGIN);
        }
        if self.has_plugin(REPORTS_PLUGIN) {
            reports.push(REPORTS_PLUGIN);
        }
        reports.join(",")
    }

    pub fn command(&self, working_dir: &Path) -> LocalCommand {
        LocalCommand::new(REPORT_TOOL)
            .args(["--batch", "--build"])
            .arg(format!("--tmp-dir={}", working_dir.display()))
            .arg("-o")
            .arg(self.reports())
            .args(self.options())
    }

    /// Produce the engine report below `working_dir`.
    pub fn run(&self, working_dir: &Path) -> Result<()> {
        info!("Gathering oVirt Engine information...");
        call_checked(self.runner, &self.command(working_dir)).map(|_| ())
    }
}

/// Database connection settings handed to the report tool.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub dbhost: String,
    pub dbport: u16,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("dbname", &self.dbname)
            .field("dbhost", &self.dbhost)
            .field("dbport", &self.dbport)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: None,
            dbname: "engine".to_string(),
            dbhost: "localhost".to_string(),
            dbport: 5432,
        }
    }
}

/// Report of the database, written into the scratch directory.
pub struct DatabaseReport<'a> {
    runner: &'a dyn CommandRunner,
    config: DatabaseConfig,
    ticket_number: Option<String>,
    version: ToolVersion,
}

impl<'a> DatabaseReport<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        config: DatabaseConfig,
        ticket_number: Option<String>,
        version: ToolVersion,
    ) -> Self {
        Self {
            runner,
            config,
            ticket_number,
            version,
        }
    }

    /// Report tool invocation, `None` without database credentials.
    pub fn command(&self, scratch_dir: &Path) -> Option<LocalCommand> {
        let password = self.config.password.as_ref()?;
        let mut command = LocalCommand::new(REPORT_TOOL)
            .args(["--batch", "-o", DATABASE_PLUGIN])
            .arg(format!("--tmp-dir={}", scratch_dir.display()));
        if let Some(ticket) = &self.ticket_number {
            command = command.arg(format!("--ticket-number={}", ticket));
        }
        if self.version < ToolVersion::new(3, 0) {
            command = command.arg("--report");
        }
        let settings = [
            ("dbname", self.config.dbname.clone()),
            ("dbhost", self.config.dbhost.clone()),
            ("dbport", self.config.dbport.to_string()),
            ("username", self.config.user.clone()),
        ];
        for (key, value) in settings {
            command = command
                .arg("-k")
                .arg(format!("{}.{}={}", DATABASE_PLUGIN, key, value));
        }
        Some(command.env("PGPASSWORD", password.clone()))
    }

    /// Produce the database report in `scratch_dir`.
    ///
    /// Returns the renamed report, or `None` when no credentials are
    /// configured.
    pub fn run(&self, scratch_dir: &Path) -> Result<Option<PathBuf>> {
        let command = match self.command(scratch_dir) {
            Some(command) => command,
            None => {
                info!("No database credentials configured, skipping PostgreSQL collection");
                return Ok(None);
            }
        };
        info!(
            "Gathering PostgreSQL information from {}...",
            self.config.dbhost
        );

        let stdout = call_checked(self.runner, &command)?;
        let artifact = parse_report_output(&stdout, scratch_dir)?;

        let source = PathBuf::from(&artifact.path);
        let target = scratch_dir.join(format!("{}{}", DATABASE_PREFIX, artifact.filename));
        std::fs::rename(&source, &target).map_err(|e| Error::io(&source, e))?;

        for extension in ["md5", "sha256"] {
            let sidecar = PathBuf::from(format!("{}.{}", artifact.path, extension));
            if sidecar.exists() {
                let renamed = scratch_dir.join(format!(
                    "{}{}.{}",
                    DATABASE_PREFIX, artifact.filename, extension
                ));
                std::fs::rename(&sidecar, &renamed).map_err(|e| Error::io(&sidecar, e))?;
            }
        }
        Ok(Some(target))
    }
}
