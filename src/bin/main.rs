//! hvnat CLI - declare and reconcile a Hyper-V NAT network

use clap::{Parser, Subcommand, ValueEnum};
use hvnat::reconcile::{
    ApplyReport, HostInventory, StepOutcome, TeardownReport, DEFAULT_ADAPTER_DELAY_SECS,
};
use hvnat::{
    Action, DryRunHost, PowerShellHost, Reconciler, ReconcilerSettings,
    ReconciliationConfig, Result, RunOutcome,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "hvnat")]
#[command(about = "Declare and reconcile a Hyper-V NAT network from a JSON file")]
#[command(version)]
struct Cli {
    /// Log every host command
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tear down and recreate (or only remove) the declared network
    Run {
        /// Path to the network JSON file
        config: PathBuf,
        /// Override the action in the file
        #[arg(short, long, value_enum)]
        action: Option<ActionArg>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Query the host but only print the changes that would be made
        #[arg(long)]
        dry_run: bool,
        /// Seconds to wait for the switch adapter to register
        #[arg(long, default_value_t = DEFAULT_ADAPTER_DELAY_SECS)]
        adapter_delay: u64,
        /// PowerShell executable
        #[arg(long, default_value = "powershell")]
        powershell: String,
    },
    /// Check a network file without touching the host
    Validate {
        /// Path to the network JSON file
        config: PathBuf,
    },
    /// Show which of the network's resources exist on the host
    Status {
        /// Path to the network JSON file
        config: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
        /// PowerShell executable
        #[arg(long, default_value = "powershell")]
        powershell: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Apply,
    Remove,
}

impl From<ActionArg> for Action {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Apply => Action::Apply,
            ActionArg::Remove => Action::Remove,
        }
    }
}

// Table display structs
#[derive(Tabled)]
struct MappingRow {
    #[tabled(rename = "Rule")]
    name: String,
    #[tabled(rename = "Protocol")]
    protocol: String,
    #[tabled(rename = "External")]
    external: String,
    #[tabled(rename = "Internal")]
    internal: String,
}

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "VM")]
    name: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Prefix")]
    prefix: String,
    #[tabled(rename = "Gateway")]
    gateway: String,
    #[tabled(rename = "Memo")]
    memo: String,
}

#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Present")]
    present: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            config,
            action,
            yes,
            dry_run,
            adapter_delay,
            powershell,
        } => cmd_run(
            &config,
            action.map(Action::from),
            yes,
            dry_run,
            Duration::from_secs(adapter_delay),
            &powershell,
        ),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Status {
            config,
            json,
            powershell,
        } => cmd_status(&config, json, &powershell),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\nError: {}", e);
            let mut cause = std::error::Error::source(&e);
            while let Some(inner) = cause {
                eprintln!("  Caused by: {}", inner);
                cause = std::error::Error::source(inner);
            }
            let remediation = e.remediation();
            if !remediation.is_empty() {
                eprintln!("\nAutomatic rollback was incomplete. Clean up manually:");
                for step in remediation {
                    eprintln!("  {}", step);
                }
            }
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "hvnat=debug" } else { "hvnat=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn cmd_run(
    path: &Path,
    action: Option<Action>,
    yes: bool,
    dry_run: bool,
    adapter_delay: Duration,
    powershell: &str,
) -> Result<()> {
    let config = ReconciliationConfig::load_with_action(path, action)?;
    let action = config.action;
    let host = PowerShellHost::with_executable(powershell);

    print_plan(&config, action);

    if dry_run {
        let dry = DryRunHost::new(host);
        let settings = ReconcilerSettings {
            adapter_registration_delay: Duration::ZERO,
        };
        let outcome = Reconciler::with_settings(&dry, settings).run(&config, Some(action))?;
        print_outcome(&config, &outcome);

        println!("\nDry run - these changes were NOT made:");
        for op in dry.planned() {
            println!("  {}", op);
        }
        return Ok(());
    }

    host.preflight()?;

    if !yes && !confirm(&format!("Proceed with '{}'?", action))? {
        println!("Cancelled.");
        return Ok(());
    }

    let settings = ReconcilerSettings {
        adapter_registration_delay: adapter_delay,
    };
    let outcome = Reconciler::with_settings(host, settings).run(&config, Some(action))?;
    print_outcome(&config, &outcome);
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let config = ReconciliationConfig::load(path)?;
    print_plan(&config, config.action);
    println!("\nConfig is valid.");
    Ok(())
}

fn cmd_status(path: &Path, json: bool, powershell: &str) -> Result<()> {
    let config = ReconciliationConfig::load(path)?;
    let reconciler = Reconciler::new(PowerShellHost::with_executable(powershell));
    let inventory = reconciler.inspect(&config.context())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&inventory)?);
    } else {
        print_inventory(&inventory);
    }
    Ok(())
}

/// Prompt on stdout, read one line from stdin. Piped input answers it; EOF means no.
fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        println!();
        return Ok(false);
    }
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_plan(config: &ReconciliationConfig, action: Action) {
    let ctx = config.context();
    println!("Network '{}' ({})", config.network.name, action);
    println!("  Switch:  {} (Internal)", ctx.names.switch);
    println!("  Adapter: {}", ctx.names.adapter);
    println!("  Gateway: {}/{}", ctx.gateway, ctx.prefix_len());
    println!("  NAT:     {} for {}", ctx.names.nat, ctx.subnet);
    if action == Action::Apply {
        println!("  Port mappings: {}", config.port_forwarding.len());
    }

    for note in config.advisories() {
        println!("  WARNING: {}", note);
    }
}

fn print_outcome(config: &ReconciliationConfig, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Applied(report) => print_applied(config, report),
        RunOutcome::Removed(report) => print_removed(config, report),
    }
}

fn print_teardown(report: &TeardownReport) {
    for step in &report.steps {
        match &step.outcome {
            StepOutcome::Absent => println!("  {:<15} not present", step.kind.to_string()),
            StepOutcome::Removed(n) => println!("  {:<15} removed {}", step.kind.to_string(), n),
            StepOutcome::Failed { removed, message } => println!(
                "  {:<15} FAILED after removing {}: {}",
                step.kind.to_string(),
                removed,
                message
            ),
        }
    }
}

fn print_applied(config: &ReconciliationConfig, report: &ApplyReport) {
    let ctx = config.context();

    println!("\nCleanup before provisioning:");
    print_teardown(&report.teardown);

    println!(
        "\nNetwork '{}' is {} with {} port mapping(s).",
        config.network.name, report.state, report.mappings_applied
    );

    if !config.port_forwarding.is_empty() {
        let rows: Vec<MappingRow> = config
            .port_forwarding
            .iter()
            .map(|r| MappingRow {
                name: r.name.clone(),
                protocol: r.protocol.to_string(),
                external: format!("0.0.0.0:{}", r.external_port),
                internal: format!("{}:{}", r.internal_ip, r.internal_port),
            })
            .collect();
        println!("\n{}", Table::new(rows));
    }

    if !config.vms.is_empty() {
        println!("\nConfigure these VMs by hand (attach them to switch '{}'):", ctx.names.switch);
        let rows: Vec<VmRow> = config
            .vms
            .iter()
            .map(|vm| VmRow {
                name: vm.name.clone(),
                ip: vm.ip.clone(),
                prefix: ctx.prefix_len().to_string(),
                gateway: ctx.gateway.to_string(),
                memo: vm.memo.clone().unwrap_or_default(),
            })
            .collect();
        println!("{}", Table::new(rows));
    }
}

fn print_removed(config: &ReconciliationConfig, report: &TeardownReport) {
    println!("\nRemoval of '{}':", config.network.name);
    print_teardown(report);

    if report.removed_count() == 0 && report.is_clean() {
        println!("\nNothing to remove.");
    } else if report.is_clean() {
        println!("\nRemoved {} resource(s).", report.removed_count());
    } else {
        println!("\nSome resources could not be removed. Clean up manually:");
        for step in config.context().remediation_steps() {
            println!("  {}", step);
        }
    }
}

fn print_inventory(inventory: &HostInventory) {
    let yes_no = |b: bool| if b { "Yes" } else { "No" }.to_string();
    let names = &inventory.names;

    let mut rows = vec![ResourceRow {
        resource: "Virtual switch".into(),
        name: names.switch.clone(),
        present: yes_no(inventory.switch),
    }];
    rows.push(ResourceRow {
        resource: "Gateway IP".into(),
        name: if inventory.ip_assignments.is_empty() {
            "-".into()
        } else {
            inventory
                .ip_assignments
                .iter()
                .map(|a| format!("{}/{} on {}", a.ip_address, a.prefix_length, a.interface_alias))
                .collect::<Vec<_>>()
                .join(", ")
        },
        present: yes_no(!inventory.ip_assignments.is_empty()),
    });
    rows.push(ResourceRow {
        resource: "NAT".into(),
        name: names.nat.clone(),
        present: yes_no(inventory.nat),
    });
    for m in &inventory.static_mappings {
        rows.push(ResourceRow {
            resource: format!("Mapping #{}", m.id),
            name: format!(
                "{} {} -> {}:{}",
                m.protocol, m.external_port, m.internal_ip, m.internal_port
            ),
            present: "Yes".into(),
        });
    }

    println!("{}", Table::new(rows));
    if inventory.is_empty() {
        println!("\nNo resources exist for this network.");
    }
}
