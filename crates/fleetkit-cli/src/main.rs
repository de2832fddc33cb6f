//! fleetkit - IoT evaluation-kit fleet provisioning.
//!
//! Drives the vendor's `fleethub` CLI to provision the evaluation-kit
//! fleet end to end: profile configuration, product and cohort creation
//! with a local CA chain, device registration with boot environments, and
//! release publication. Every command is idempotent; re-running after a
//! failure resumes where the previous run stopped.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod client;
mod commands;

/// fleetkit - IoT evaluation-kit fleet provisioning
#[derive(Parser, Debug)]
#[command(name = "fleetkit")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configure a profile, credentials, and the local root CA
    Configure {
        /// Organization name, also used as the profile name
        #[arg(long)]
        organization_name: String,

        /// Organization prn
        #[arg(long)]
        organization_prn: String,

        /// API key for the vendor control plane
        #[arg(long)]
        api_key: String,
    },

    /// Create the product, its cohorts, intermediate CAs, and signing keys
    CreateProduct {
        /// Product name
        #[arg(long)]
        name: String,
    },

    /// Register the evaluation-kit devices with local boot environments
    RegisterDevices {
        /// Product name
        #[arg(long)]
        product_name: String,

        /// Cohort the devices join
        #[arg(long)]
        cohort: String,
    },

    /// Publish the artifact bundles and releases to a cohort
    PublishRelease {
        /// Product name
        #[arg(long)]
        product_name: String,

        /// Cohort receiving the releases
        #[arg(long)]
        cohort: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Configure {
            organization_name,
            organization_prn,
            api_key,
        } => commands::configure::run(&organization_name, &organization_prn, &api_key),
        Commands::CreateProduct { name } => commands::product::run(&name),
        Commands::RegisterDevices {
            product_name,
            cohort,
        } => commands::devices::run(&product_name, &cohort),
        Commands::PublishRelease {
            product_name,
            cohort,
        } => commands::release::run(&product_name, &cohort),
    }
}
