use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tagsync")]
#[command(about = "Virtual Machine Tag Collector - sync cloud VM tags to SMC IP lists", long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Collect EC2 instances through the aws CLI
    Aws(AwsArgs),

    /// Collect Azure virtual machines through the management API
    Azure(AzureArgs),

    /// Collect GCP Compute instances through the compute API
    Gcp(GcpArgs),
}

/// Options shared by every provider
#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Do not create IP lists, just print the data collected
    #[arg(long = "report_only")]
    pub report_only: bool,

    /// Max results requested from the provider per page
    #[arg(long = "page_size", default_value = "100", value_parser = clap::value_parser!(u32).range(1..))]
    pub page_size: u32,

    /// Group for instances without tags. Defaults to untagged-<provider>-<zone>
    #[arg(long = "untagged_group")]
    pub untagged_group: Option<String>,

    /// Keep repeated addresses within a group
    #[arg(long = "keep_duplicates")]
    pub keep_duplicates: bool,
}

/// Security Management Center connection settings.
///
/// Unset values fall back to the `[smc]` section of `~/.smcrc`.
#[derive(Args, Debug, Clone, Default)]
pub struct SmcArgs {
    /// SMC URL, e.g. http://192.168.1.1:8082
    #[arg(long = "smc_address", env = "SMC_ADDRESS")]
    pub address: Option<String>,

    /// SMC API client key
    #[arg(long = "smc_api_key", env = "SMC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// API version, e.g. 6.10. Discovered from the SMC when unset
    #[arg(long = "smc_api_version", env = "SMC_API_VERSION")]
    pub api_version: Option<String>,

    /// Administrative domain to log in to
    #[arg(long = "smc_domain", env = "SMC_DOMAIN")]
    pub domain: Option<String>,

    /// Request timeout in seconds
    #[arg(long = "smc_timeout", env = "SMC_TIMEOUT")]
    pub timeout: Option<u64>,

    /// PEM certificate used to verify the SMC
    #[arg(long = "smc_client_cert", env = "SMC_CLIENT_CERT")]
    pub client_cert: Option<PathBuf>,

    /// Skip TLS certificate verification
    #[arg(long = "smc_insecure")]
    pub insecure: bool,

    /// Alternate smcrc file
    #[arg(long = "smc_config")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct AwsArgs {
    #[command(flatten)]
    pub sync: SyncArgs,

    #[command(flatten)]
    pub smc: SmcArgs,

    /// Region override, otherwise the aws CLI default
    #[arg(long)]
    pub region: Option<String>,

    /// Named profile from the shared credentials file
    #[arg(long)]
    pub profile: Option<String>,

    /// Comma separated list of instance states to filter on, e.g. running,stopped
    #[arg(long = "ec2_states")]
    pub ec2_states: Option<String>,

    /// Only instances whose Name tag matches (wildcards allowed)
    #[arg(long)]
    pub name: Option<String>,

    /// Comma separated key=value tag filters, e.g. env=prod,team=infra
    #[arg(long = "tag_filters")]
    pub tag_filters: Option<String>,

    /// Skip the VPC discovery process used for reports
    #[arg(long = "skip_vpc_discovery")]
    pub skip_vpc_discovery: bool,

    /// Shared credentials file. Defaults to ./config when present
    #[arg(long = "credentials_file")]
    pub credentials_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct AzureArgs {
    #[command(flatten)]
    pub sync: SyncArgs,

    #[command(flatten)]
    pub smc: SmcArgs,

    /// Scan only this subscription id
    #[arg(long)]
    pub subscription: Option<String>,

    /// Scan only this resource group
    #[arg(long = "resource_group")]
    pub resource_group: Option<String>,

    /// Comma separated list of power states to keep, e.g. running,deallocated
    #[arg(long)]
    pub states: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct GcpArgs {
    #[command(flatten)]
    pub sync: SyncArgs,

    #[command(flatten)]
    pub smc: SmcArgs,

    /// Project ID or number
    #[arg(long = "project_id")]
    pub project_id: String,

    /// Only this zone, e.g. us-west3-b. All zones when unset
    #[arg(long)]
    pub zone: Option<String>,

    /// Only instances in this status, e.g. RUNNING
    #[arg(long)]
    pub status: Option<String>,

    /// Only instances whose name matches (wildcards allowed)
    #[arg(long)]
    pub name: Option<String>,

    /// Comma separated key=value label filters, e.g. env=prod,team
    #[arg(long)]
    pub labels: Option<String>,

    /// Service account key file. Defaults to ./gcp.json when present
    #[arg(long = "credentials_file")]
    pub credentials_file: Option<PathBuf>,
}
