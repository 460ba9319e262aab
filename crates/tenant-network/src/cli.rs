//! tenant-netctl command line structure

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tenant-netctl - inspect and drive tenant network allocation
///
/// Operator tool over the same engine the VM lifecycle uses. Tenant locks are
/// per process: stop any service sharing the store before mutating from here.
#[derive(Parser)]
#[command(name = "tenant-netctl")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    pub format: OutputFormat,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true, env = "TENANT_NETWORK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Assign (or look up) a VM's static address, provisioning the tenant network if needed
    Assign {
        /// Tenant (user account) id
        tenant: String,
        /// VM name
        vm: String,
    },

    /// Release a VM's static address
    Release {
        /// Tenant (user account) id
        tenant: String,
        /// VM name
        vm: String,
    },

    /// Show a tenant's network and allocations
    Show {
        /// Tenant (user account) id
        tenant: String,
    },

    /// List every tenant network
    List,

    /// Restart a tenant's network if down and re-sync every DHCP reservation
    Reconcile {
        /// Tenant (user account) id
        tenant: String,
    },
}
