//! Buckos fleet log collector CLI
//!
//! Collects reports from the engine, its database and the selected
//! hypervisors, then packs everything into one archive.

use anyhow::{bail, Context, Result};
use clap::Parser;
use console::style;
use dialoguer::Confirm;
use tracing::{error, info, warn};

use buckos_collector::{
    archive::ArchiveAssembler,
    cli::{Cli, Commands},
    config::{ConfigLoader, Settings},
    filter::{plan_selection, select, Selection, SystemResolver},
    inventory::{fetch_fleet, FileInventory, HostSet},
    local::{DatabaseReport, EngineReport, SystemRunner, ToolVersion},
    logging,
    orchestrator::{Orchestrator, PROCEED_BY_DEFAULT},
    remote::SshShell,
    staging::Staging,
    Error, Severity,
};

const SENSITIVE_DATA_NOTICE: &str = "\
This command will collect system configuration and diagnostic information \
from this system and the selected hypervisors.
The generated archive may contain data considered sensitive and its content \
should be reviewed by the originating organization before being passed to \
any third party.
No changes will be made to system configuration.";

fn main() {
    let code = match run() {
        Ok(severity) => severity.exit_code(),
        Err(e) => {
            let severity = e
                .downcast_ref::<Error>()
                .map(Error::severity)
                .unwrap_or(Severity::Critical);
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            severity.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<Severity> {
    let cli = Cli::parse();

    let loader = match &cli.conf_file {
        Some(path) => ConfigLoader::new(path),
        None => ConfigLoader::system(),
    };
    let mut config = loader.load().context("Failed to load configuration")?;
    config.merge(cli.overrides());
    let settings = Settings::resolve(config, cli.verbose)?;

    logging::init(settings.verbose, settings.quiet, settings.log_file.as_deref())?;

    match cli.command {
        Commands::List => run_list(&settings),
        Commands::Collect(_) => run_collect(&settings),
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn load_fleet(settings: &Settings) -> buckos_collector::Result<HostSet> {
    let path = settings
        .inventory
        .as_deref()
        .ok_or_else(|| Error::Inventory("no inventory configured".to_string()))?;
    let inventory = FileInventory::load(path)?;
    fetch_fleet(&inventory)
}

fn select_hosts(settings: &Settings, fleet: &HostSet) -> Result<Selection> {
    select(fleet, &settings.filter, &SystemResolver).context("Failed to select hypervisors")
}

/// Print the selected hypervisors.
fn run_list(settings: &Settings) -> Result<Severity> {
    let fleet = load_fleet(settings).context("Failed to load the fleet inventory")?;
    let selection = select_hosts(settings, &fleet)?;

    if selection.is_empty() {
        println!("No hypervisors were found, therefore no hypervisor data will be listed.");
        return Ok(Severity::Clean);
    }

    println!("Host list ({}):", settings.filter.describe());
    println!("{:<20} | {:<20} | {}", "Data Center", "Cluster", "Hostname/IP Address");
    for host in selection.hosts.sorted_by_address() {
        println!(
            "{:<20} | {:<20} | {}",
            host.datacenter, host.cluster.name, host.address
        );
    }
    Ok(Severity::Clean)
}

fn confirm(prompt: &str) -> bool {
    Confirm::new()
        .with_prompt(prompt)
        .default(PROCEED_BY_DEFAULT)
        .interact()
        .unwrap_or(false)
}

/// Collect everything and assemble the archive.
fn run_collect(settings: &Settings) -> Result<Severity> {
    if !is_root() {
        bail!("This tool requires root permissions to run.");
    }

    if !settings.quiet {
        println!("{}\n", style(SENSITIVE_DATA_NOTICE).yellow());
    }

    let mut severity = Severity::Clean;
    let hypervisors = if settings.no_hypervisors {
        None
    } else {
        let planned = plan_selection(load_fleet(settings), &settings.filter, &SystemResolver)
            .context("Failed to select hypervisors")?;
        if planned.is_none() {
            severity.escalate(Severity::Warning);
        }
        planned
    };

    let staging = match &settings.local_tmp {
        Some(path) => Staging::prepare(path)?,
        None => Staging::temporary()?,
    };
    let runner = SystemRunner;

    let engine = EngineReport::probe(&runner, settings.engine_report())
        .context("Failed to inspect the report tool")?;
    engine
        .run(&staging.working)
        .context("Failed to collect the engine report")?;

    if settings.no_postgresql {
        info!("Skipping PostgreSQL database collection");
    } else {
        let version = ToolVersion::detect(&runner);
        let database = DatabaseReport::new(
            &runner,
            settings.database.clone(),
            settings.ticket_number.clone(),
            version,
        );
        if let Err(e) = database.run(&staging.scratch) {
            error!("Failed to collect PostgreSQL database report: {}", e);
            severity.escalate(Severity::Warning);
        }
    }

    if settings.no_hypervisors {
        info!("Skipping hypervisor collection...");
    } else if let Some(selection) = &hypervisors {
        severity.escalate(collect_hypervisors(settings, &staging, selection));
    }

    let summary = ArchiveAssembler::new(&settings.output)
        .tool(settings.archive_tool.clone())
        .case_id(settings.ticket_number.clone())
        .assemble(&staging)
        .context("Failed to assemble the archive")?;

    println!("{}", style(summary.message()).green());
    if severity != Severity::Clean {
        warn!("Collection finished with status: {}", severity);
    }
    Ok(severity)
}

fn collect_hypervisors(settings: &Settings, staging: &Staging, selection: &Selection) -> Severity {
    if selection.is_empty() {
        info!("No hypervisors were selected, therefore no hypervisor data will be collected.");
        return Severity::Clean;
    }

    let shell = SshShell::new(settings.ssh.clone());
    let orchestrator = Orchestrator::new(settings.orchestrator(&staging.scratch), &shell);
    let report = match orchestrator.run(&selection.hosts, &confirm) {
        Some(report) => report,
        None => return Severity::Clean,
    };

    for outcome in report.outcomes.iter().filter(|o| o.severity != Severity::Clean) {
        warn!(
            "{}: {} ({})",
            outcome.host,
            outcome.severity,
            outcome.failures.join("; ")
        );
    }
    if let Some(path) = &report.skew_report {
        info!(
            "Clock skew of {} hypervisors recorded in {}",
            report.skew_records,
            path.display()
        );
    }
    report.severity
}
