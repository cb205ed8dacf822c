//! CLI command definitions and argument parsing.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{CollectorSection, ConfigFile, EngineSection, PostgresSection, SshSection};

/// Buckos fleet log collector.
///
/// Gathers diagnostic reports from the engine, its database and the
/// hypervisors it manages into a single archive.
#[derive(Parser, Debug)]
#[command(name = "buckos-collector")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only show errors, never prompt
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Configuration file
    #[arg(long = "conf-file", global = true, env = "BUCKOS_COLLECTOR_CONF")]
    pub conf_file: Option<PathBuf>,

    /// Also write log messages to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Collect reports into an archive
    Collect(CollectArgs),

    /// List the hypervisors matching the filters
    List,
}

/// Inventory and host filters, shared by every command.
#[derive(Args, Debug, Default)]
pub struct SelectionArgs {
    /// Hosts to collect from: comma separated names, addresses or globs
    #[arg(short = 'H', long, global = true)]
    pub hosts: Option<String>,

    /// Cluster names or globs, comma separated
    #[arg(short = 'c', long, global = true)]
    pub cluster: Option<String>,

    /// Datacenter names or globs, comma separated
    #[arg(short = 'd', long = "data-center", global = true)]
    pub data_center: Option<String>,

    /// Collect from at most one hypervisor per cluster
    #[arg(long, global = true)]
    pub hypervisor_per_cluster: bool,

    /// JSON inventory snapshot
    #[arg(long, global = true)]
    pub inventory: Option<PathBuf>,
}

/// Arguments for the collect command.
#[derive(Args, Debug, Default)]
pub struct CollectArgs {
    /// Staging directory, must be empty or missing
    #[arg(long)]
    pub local_tmp: Option<PathBuf>,

    /// Directory the archive is written to
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Support ticket number recorded in every report
    #[arg(long)]
    pub ticket_number: Option<String>,

    /// Upload the engine report to this location
    #[arg(long)]
    pub upload: Option<String>,

    /// Do not mask passwords and other sensitive values
    #[arg(long)]
    pub include_sensitive_data: bool,

    /// Skip hypervisor collection
    #[arg(long)]
    pub no_hypervisors: bool,

    /// SSH port of the hypervisors
    #[arg(long)]
    pub ssh_port: Option<u16>,

    /// SSH private key
    #[arg(short = 'k', long)]
    pub key_file: Option<PathBuf>,

    /// Concurrent hypervisor collections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Skip the database report
    #[arg(long)]
    pub no_postgresql: bool,

    /// Database user
    #[arg(long)]
    pub pg_user: Option<String>,

    /// Database password
    #[arg(long, env = "BUCKOS_COLLECTOR_PG_PASS", hide_env_values = true)]
    pub pg_pass: Option<String>,

    /// Database name
    #[arg(long)]
    pub pg_dbname: Option<String>,

    /// Database host
    #[arg(long)]
    pub pg_dbhost: Option<String>,

    /// Database port
    #[arg(long)]
    pub pg_dbport: Option<u16>,
}

fn flag(value: bool) -> Option<bool> {
    value.then_some(true)
}

impl Cli {
    /// Command line layer applied over the configuration files.
    pub fn overrides(&self) -> ConfigFile {
        let selection = &self.selection;
        let mut config = ConfigFile {
            collector: CollectorSection {
                quiet: flag(self.quiet),
                log_file: self.log_file.clone(),
                hosts: selection.hosts.clone(),
                cluster: selection.cluster.clone(),
                data_center: selection.data_center.clone(),
                hypervisor_per_cluster: flag(selection.hypervisor_per_cluster),
                ..Default::default()
            },
            engine: EngineSection {
                inventory: selection.inventory.clone(),
                ..Default::default()
            },
            ..Default::default()
        };

        if let Commands::Collect(args) = &self.command {
            config.merge(args.overrides());
        }
        config
    }
}

impl CollectArgs {
    fn overrides(&self) -> ConfigFile {
        ConfigFile {
            collector: CollectorSection {
                output: self.output.clone(),
                local_tmp: self.local_tmp.clone(),
                ticket_number: self.ticket_number.clone(),
                upload: self.upload.clone(),
                include_sensitive_data: flag(self.include_sensitive_data),
                no_hypervisors: flag(self.no_hypervisors),
                no_postgresql: flag(self.no_postgresql),
                ..Default::default()
            },
            ssh: SshSection {
                port: self.ssh_port,
                key_file: self.key_file.clone(),
                user: None,
                max_connections: self.max_connections,
            },
            postgres: PostgresSection {
                user: self.pg_user.clone(),
                password: self.pg_pass.clone(),
                dbname: self.pg_dbname.clone(),
                dbhost: self.pg_dbhost.clone(),
                dbport: self.pg_dbport,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_collect_overrides() {
        let cli = Cli::parse_from([
            "buckos-collector",
            "collect",
            "-H",
            "h1,h2",
            "--ssh-port",
            "2222",
            "--no-postgresql",
            "--ticket-number",
            "00123",
        ]);
        let config = cli.overrides();
        assert_eq!(config.collector.hosts.as_deref(), Some("h1,h2"));
        assert_eq!(config.collector.no_postgresql, Some(true));
        assert_eq!(config.collector.no_hypervisors, None);
        assert_eq!(config.ssh.port, Some(2222));
        assert_eq!(config.collector.ticket_number.as_deref(), Some("00123"));
    }

    #[test]
    fn test_list_with_filters() {
        let cli = Cli::parse_from(["buckos-collector", "list", "-d", "dc*", "--quiet"]);
        assert!(matches!(cli.command, Commands::List));
        let config = cli.overrides();
        assert_eq!(config.collector.data_center.as_deref(), Some("dc*"));
        assert_eq!(config.collector.quiet, Some(true));
    }
}
