use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::env;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tagsync::cli::{AwsArgs, AzureArgs, Cli, Commands, GcpArgs, SmcArgs};
use tagsync::config::SmcSettings;
use tagsync::error::{Error, EXIT_PROVIDER_API, EXIT_USAGE};
use tagsync::inventory::{parse_tag_filters, InventorySource, Provider};
use tagsync::smc::SmcClient;
use tagsync::sync::{execute, RunOptions};
use tagsync::azure::ArmTransport;
use tagsync::{aws, azure, gcp, report};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };
    init_logging(cli.debug);

    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            e.downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(EXIT_PROVIDER_API)
        }
    };

    std::process::exit(code);
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("warn,tagsync=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Aws(args) => run_aws(args),
        Commands::Azure(args) => run_azure(args),
        Commands::Gcp(args) => run_gcp(args),
    }
}

fn banner(provider: Provider, scope: &str) {
    println!("{}", format!("🔍 Collecting {} inventory...", provider).cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!("Scope: {}", scope.yellow());
    println!();
}

/// A credentials file next to the working directory or the executable
fn local_file(name: &str) -> Option<PathBuf> {
    let cwd = PathBuf::from(name);
    if cwd.exists() {
        return Some(cwd);
    }
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|p| p.exists())
}

/// Aggregate `source`, then report or publish to the SMC.
/// SMC settings are only resolved when publishing.
fn sync_with_smc<S>(source: &mut S, options: &RunOptions, smc: &SmcArgs) -> Result<()>
where
    S: InventorySource + ?Sized,
{
    execute(source, options, || {
        let settings = SmcSettings::resolve(smc)?;
        SmcClient::login(&settings)
    })?;
    Ok(())
}

fn run_aws(args: AwsArgs) -> Result<()> {
    let credentials_file = args.credentials_file.clone().or_else(|| local_file("config"));
    if let Some(file) = &credentials_file {
        info!("Using AWS shared credentials file {}", file.display());
    }

    let cli = aws::AwsCli::new(args.region.clone(), args.profile.clone(), credentials_file);
    let options = RunOptions::from(&args.sync);

    banner(Provider::Aws, args.region.as_deref().unwrap_or("default region"));

    if options.report_only && !args.skip_vpc_discovery {
        let vpcs = aws::discover_vpcs(&cli, args.sync.page_size)
            .map_err(|e| Error::fetch(Provider::Aws, e))
            .context("VPC discovery")?;
        report::print_vpcs(&vpcs);
    }

    let query = aws::InstanceQuery {
        page_size: args.sync.page_size,
        name: args.name.clone(),
        tag_filters: args.tag_filters.as_deref().map(parse_tag_filters).unwrap_or_default(),
        states: args.ec2_states.as_deref().map(aws::parse_states).unwrap_or_default(),
    };

    let mut source = aws::Ec2Inventory::new(cli, query);
    sync_with_smc(&mut source, &options, &args.smc)
}

fn run_azure(args: AzureArgs) -> Result<()> {
    let options = RunOptions::from(&args.sync);
    let client = azure::AzureClient::connect().map_err(|e| Error::fetch(Provider::Azure, e))?;

    let subscriptions = match &args.subscription {
        Some(id) => vec![id.clone()],
        None => client
            .list_subscriptions()
            .map_err(|e| Error::fetch(Provider::Azure, e))?,
    };

    if subscriptions.is_empty() {
        return Err(Error::NoScope {
            provider: Provider::Azure,
            reason: format!(
                "no subscriptions were found for client id: {} and tenant id: {}",
                env::var("AZURE_CLIENT_ID").unwrap_or_else(|_| "-".into()),
                env::var("AZURE_TENANT_ID").unwrap_or_else(|_| "-".into())
            ),
        }
        .into());
    }

    info!("The following subscriptions will be scanned: {:?}", subscriptions);
    banner(Provider::Azure, &subscriptions.join(", "));

    let states = args.states.as_deref().map(azure::parse_power_states).unwrap_or_default();
    let mut source =
        azure::VmInventory::new(client, &subscriptions, args.resource_group.as_deref()).with_states(states);
    sync_with_smc(&mut source, &options, &args.smc)
}

fn run_gcp(args: GcpArgs) -> Result<()> {
    let options = RunOptions::from(&args.sync);
    let credentials_file = args.credentials_file.clone().or_else(|| local_file("gcp.json"));

    let client = gcp::GcpClient::connect(credentials_file).map_err(|e| Error::fetch(Provider::Gcp, e))?;

    let scope = match &args.zone {
        Some(zone) => format!("{} ({})", args.project_id, zone),
        None => format!("{} (all zones)", args.project_id),
    };
    banner(Provider::Gcp, &scope);

    let query = gcp::GcpQuery {
        project: args.project_id.clone(),
        zone: args.zone.clone(),
        status: args.status.clone(),
        name: args.name.clone(),
        labels: args.labels.as_deref().map(parse_tag_filters).unwrap_or_default(),
        page_size: args.sync.page_size,
    };

    let mut source = gcp::ComputeInventory::new(client, query);
    sync_with_smc(&mut source, &options, &args.smc)
}
