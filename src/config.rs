//! Layered collector configuration.
//!
//! Precedence, lowest to highest: built-in defaults, the main TOML file,
//! every `*.toml` below `<file>.d/` in sorted order, command line flags.
//! Each layer is a [`ConfigFile`] whose unset fields leave the lower layer
//! untouched; [`Settings::resolve`] applies the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::archive::DEFAULT_ARCHIVE_TOOL;
use crate::error::{Error, Result};
use crate::filter::FilterSpec;
use crate::local::{DatabaseConfig, EngineReportConfig};
use crate::orchestrator::{OrchestratorConfig, DEFAULT_MAX_CONNECTIONS};
use crate::remote::{SshOptions, DEFAULT_SSH_USER};

/// Configuration file read when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/buckos/collector.toml";

/// Directory the archive is written to by default.
pub const DEFAULT_OUTPUT_DIR: &str = "/tmp";

/// Report option for the designated host of each datacenter.
pub const DEFAULT_DESIGNATED_OPTION: &str = "-k vdsm.dump_volume_chains=on";

/// `[collector]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorSection {
    pub output: Option<PathBuf>,
    pub local_tmp: Option<PathBuf>,
    pub ticket_number: Option<String>,
    pub upload: Option<String>,
    pub quiet: Option<bool>,
    pub log_file: Option<PathBuf>,
    pub include_sensitive_data: Option<bool>,
    pub no_hypervisors: Option<bool>,
    pub no_postgresql: Option<bool>,
    pub hypervisor_per_cluster: Option<bool>,
    pub archive_tool: Option<String>,
    pub designated_option: Option<String>,
    /// Comma separated host filter.
    pub hosts: Option<String>,
    /// Comma separated cluster filter.
    pub cluster: Option<String>,
    /// Comma separated datacenter filter.
    pub data_center: Option<String>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    /// JSON inventory snapshot.
    pub inventory: Option<PathBuf>,
    /// Comma separated keys masked in the engine report.
    pub sensitive_keys: Option<String>,
    /// Comma separated keys masked in the warehouse report.
    pub dwh_sensitive_keys: Option<String>,
}

/// `[ssh]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSection {
    pub port: Option<u16>,
    pub key_file: Option<PathBuf>,
    pub user: Option<String>,
    pub max_connections: Option<usize>,
}

/// `[postgres]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostgresSection {
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: Option<String>,
    pub dbhost: Option<String>,
    pub dbport: Option<u16>,
}

/// One configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub collector: CollectorSection,
    pub engine: EngineSection,
    pub ssh: SshSection,
    pub postgres: PostgresSection,
}

macro_rules! overlay {
    ($base:expr, $top:expr; $($field:ident),+ $(,)?) => {
        $(
            if $top.$field.is_some() {
                $base.$field = $top.$field;
            }
        )+
    };
}

impl ConfigFile {
    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a TOML file.
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply `top` over `self`; fields set in `top` win.
    pub fn merge(&mut self, top: ConfigFile) {
        overlay!(self.collector, top.collector;
            output, local_tmp, ticket_number, upload, quiet, log_file,
            include_sensitive_data, no_hypervisors, no_postgresql,
            hypervisor_per_cluster, archive_tool, designated_option,
            hosts, cluster, data_center);
        overlay!(self.engine, top.engine; inventory, sensitive_keys, dwh_sensitive_keys);
        overlay!(self.ssh, top.ssh; port, key_file, user, max_connections);
        overlay!(self.postgres, top.postgres; user, password, dbname, dbhost, dbport);
    }
}

/// Loads the file layers.
pub struct ConfigLoader {
    path: PathBuf,
    /// Whether `path` was chosen by the user and so must exist.
    explicit: bool,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            explicit: true,
        }
    }

    /// Loader for [`DEFAULT_CONFIG_FILE`], which may be missing.
    pub fn system() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CONFIG_FILE),
            explicit: false,
        }
    }

    /// Directory of drop-in files, `<file>.d`.
    pub fn drop_in_dir(&self) -> PathBuf {
        let mut dir = self.path.clone().into_os_string();
        dir.push(".d");
        PathBuf::from(dir)
    }

    /// Drop-in files in the order they are applied.
    pub fn drop_in_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.drop_in_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = dir.join("*.toml");
        let pattern = pattern.to_string_lossy();
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("{}: {}", pattern, e)))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Merge the main file and its drop-ins.
    pub fn load(&self) -> Result<ConfigFile> {
        let drop_in = self.drop_in_dir();
        if self.explicit && !self.path.exists() && !drop_in.exists() {
            return Err(Error::Config(format!(
                "Configuration file {} not found",
                self.path.display()
            )));
        }

        let mut config = ConfigFile::default();
        if self.path.is_file() {
            debug!("loading configuration from {}", self.path.display());
            config.merge(ConfigFile::read(&self.path)?);
        }
        for file in self.drop_in_files()? {
            debug!("loading configuration from {}", file.display());
            config.merge(ConfigFile::read(&file)?);
        }
        Ok(config)
    }
}

/// Split a comma separated option, dropping blanks.
pub fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn colon_keys(value: Option<String>) -> Option<String> {
    value
        .map(|keys| keys.replace(',', ":"))
        .filter(|keys| !keys.is_empty())
}

/// Fully resolved settings for a run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub output: PathBuf,
    pub local_tmp: Option<PathBuf>,
    pub ticket_number: Option<String>,
    pub upload: Option<String>,
    pub quiet: bool,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
    pub include_sensitive_data: bool,
    pub no_hypervisors: bool,
    pub no_postgresql: bool,
    pub archive_tool: String,
    pub designated_option: Option<String>,
    pub filter: FilterSpec,
    pub inventory: Option<PathBuf>,
    pub sensitive_keys: Option<String>,
    pub dwh_sensitive_keys: Option<String>,
    pub ssh: SshOptions,
    pub max_connections: usize,
    pub database: DatabaseConfig,
}

impl Settings {
    /// Apply defaults to a merged configuration and validate it.
    pub fn resolve(config: ConfigFile, verbose: bool) -> Result<Self> {
        let ConfigFile {
            collector,
            engine,
            ssh,
            postgres,
        } = config;

        let quiet = collector.quiet.unwrap_or(false);
        if quiet && verbose {
            return Err(Error::Config(
                "quiet and verbose cannot be used together".to_string(),
            ));
        }

        let max_connections = ssh.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }

        if let Some(key) = &ssh.key_file {
            if !key.is_file() {
                return Err(Error::Config(format!(
                    "SSH key file {} not found",
                    key.display()
                )));
            }
        }

        let defaults = DatabaseConfig::default();
        let database = DatabaseConfig {
            user: postgres.user.unwrap_or(defaults.user),
            password: postgres.password.or(defaults.password),
            dbname: postgres.dbname.unwrap_or(defaults.dbname),
            dbhost: postgres.dbhost.unwrap_or(defaults.dbhost),
            dbport: postgres.dbport.unwrap_or(defaults.dbport),
        };

        let filter = FilterSpec {
            hosts: split_list(collector.hosts.as_deref()),
            clusters: split_list(collector.cluster.as_deref()),
            datacenters: split_list(collector.data_center.as_deref()),
            one_per_cluster: collector.hypervisor_per_cluster.unwrap_or(false),
        };

        Ok(Self {
            output: collector
                .output
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            local_tmp: collector.local_tmp,
            ticket_number: collector.ticket_number.filter(|t| !t.is_empty()),
            upload: collector.upload,
            quiet,
            verbose,
            log_file: collector.log_file,
            include_sensitive_data: collector.include_sensitive_data.unwrap_or(false),
            no_hypervisors: collector.no_hypervisors.unwrap_or(false),
            no_postgresql: collector.no_postgresql.unwrap_or(false),
            archive_tool: collector
                .archive_tool
                .unwrap_or_else(|| DEFAULT_ARCHIVE_TOOL.to_string()),
            designated_option: match collector.designated_option {
                Some(option) if option.is_empty() => None,
                Some(option) => Some(option),
                None => Some(DEFAULT_DESIGNATED_OPTION.to_string()),
            },
            filter,
            inventory: engine.inventory,
            sensitive_keys: colon_keys(engine.sensitive_keys),
            dwh_sensitive_keys: colon_keys(engine.dwh_sensitive_keys),
            ssh: SshOptions {
                user: ssh.user.unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
                port: ssh.port,
                key_file: ssh.key_file,
            },
            max_connections,
            database,
        })
    }

    /// Orchestrator settings for jobs writing below `scratch_dir`.
    pub fn orchestrator(&self, scratch_dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            max_connections: self.max_connections,
            quiet: self.quiet,
            ticket_number: self.ticket_number.clone(),
            designated_option: self.designated_option.clone(),
            scratch_dir: scratch_dir.to_path_buf(),
        }
    }

    pub fn engine_report(&self) -> EngineReportConfig {
        EngineReportConfig {
            ticket_number: self.ticket_number.clone(),
            upload: self.upload.clone(),
            include_sensitive_data: self.include_sensitive_data,
            sensitive_keys: self.sensitive_keys.clone(),
            dwh_sensitive_keys: self.dwh_sensitive_keys.clone(),
        }
    }
}
