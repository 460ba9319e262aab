//! tenant-netctl
//!
//! Operator CLI for the tenant network allocation engine.
//!
//! Usage:
//!   tenant-netctl assign <tenant> <vm>      Assign or look up a static address
//!   tenant-netctl release <tenant> <vm>     Release a static address
//!   tenant-netctl show <tenant>             Show a tenant network
//!   tenant-netctl list                      List tenant networks
//!   tenant-netctl reconcile <tenant>        Restart / re-sync a tenant network

mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use console::style;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands, OutputFormat};
use tenant_network::{EngineConfig, ReconcileReport, ReconciliationEngine, TenantNetwork};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let engine = ReconciliationEngine::from_config(&config)
        .await
        .context("starting engine")?;

    match cli.command {
        Commands::Assign { tenant, vm } => {
            let assignment = engine.assign_static_ip(&tenant, &vm).await?;
            match cli.format {
                OutputFormat::Json => print_json(&assignment)?,
                OutputFormat::Table => {
                    println!("Network:  {}", style(&assignment.network_name).green());
                    println!("IP:       {}", style(assignment.ip).green());
                    println!("MAC:      {}", style(assignment.mac).green());
                }
            }
        }
        Commands::Release { tenant, vm } => {
            engine.release_static_ip(&tenant, &vm).await?;
            if cli.format == OutputFormat::Table {
                println!("Released {} / {}", style(&tenant).bold(), style(&vm).bold());
            }
        }
        Commands::Show { tenant } => {
            let network = engine.tenant_network(&tenant).await?;
            match cli.format {
                OutputFormat::Json => print_json(&network)?,
                OutputFormat::Table => print_network(&network),
            }
        }
        Commands::List => {
            let networks = engine.networks().await?;
            match cli.format {
                OutputFormat::Json => print_json(&networks)?,
                OutputFormat::Table => print_networks(&networks),
            }
        }
        Commands::Reconcile { tenant } => {
            let report = engine.reconcile_tenant(&tenant).await?;
            match cli.format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Table => print_report(&report),
            }
            if !report.is_clean() {
                bail!(
                    "{} reservation(s) of {} failed to sync",
                    report.failed.len(),
                    tenant
                );
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_network(network: &TenantNetwork) {
    println!();
    println!("{}", style(&network.network_name).cyan().bold());
    println!("{}", style("=".repeat(40)).dim());
    println!("Tenant:   {}", network.tenant_id);
    println!("Subnet:   {}", network.subnet_cidr);
    println!("Gateway:  {}", network.gateway);
    println!("State:    {}", state_label(network));
    println!(
        "DHCP:     {} - {}",
        network.dhcp_range.start, network.dhcp_range.end
    );
    println!("Created:  {}", network.created_at.format("%Y-%m-%d %H:%M"));

    if network.allocations.is_empty() {
        println!();
        println!("{}", style("No allocations.").yellow());
        return;
    }

    println!();
    println!(
        "{:24} {:16} {:18} {:16}",
        style("VM").bold().underlined(),
        style("IP").bold().underlined(),
        style("MAC").bold().underlined(),
        style("CREATED").bold().underlined()
    );
    for allocation in &network.allocations {
        println!(
            "{:24} {:16} {:18} {:16}",
            allocation.vm_name,
            allocation.ip_address.to_string(),
            allocation.mac_address.to_string(),
            allocation.created_at.format("%Y-%m-%d %H:%M").to_string()
        );
    }
}

fn print_networks(networks: &[TenantNetwork]) {
    if networks.is_empty() {
        println!();
        println!("{}", style("No tenant networks.").yellow());
        return;
    }

    println!();
    println!(
        "{:24} {:20} {:18} {:14} {:6}",
        style("TENANT").bold().underlined(),
        style("NETWORK").bold().underlined(),
        style("SUBNET").bold().underlined(),
        style("STATE").bold().underlined(),
        style("VMS").bold().underlined()
    );
    for network in networks {
        println!(
            "{:24} {:20} {:18} {:14} {:6}",
            network.tenant_id,
            network.network_name,
            network.subnet_cidr.to_string(),
            network.state.to_string(),
            network.allocations.len()
        );
    }
    println!();
    println!("Total: {} networks", style(networks.len()).bold());
}

fn state_label(network: &TenantNetwork) -> String {
    let label = network.state.to_string();
    if network.is_ready() {
        style(label).green().to_string()
    } else {
        style(label).yellow().to_string()
    }
}

fn print_report(report: &ReconcileReport) {
    println!();
    println!("{}", style(&report.network_name).cyan().bold());
    if report.healed {
        println!(
            "{}",
            style("Network was down or unfinished and has been brought up").yellow()
        );
    }
    for vm in &report.synced {
        println!("  {} {}", style("✓").green(), vm);
    }
    for failure in &report.failed {
        println!("  {} {}: {}", style("✗").red(), failure.vm_name, failure.error);
    }
}
