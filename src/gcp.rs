//! GCP Compute instances through the compute v1 REST API

use crate::error::FetchError;
use crate::inventory::{bearer_get, run_tool, Cursor, InventorySource, NormalizedInstance, Provider};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

pub const COMPUTE_URL: &str = "https://compute.googleapis.com/compute/v1";

/// Authenticated compute API client for one run
pub struct GcpClient {
    http: Client,
    token: String,
}

impl GcpClient {
    /// Token from `GCP_ACCESS_TOKEN`, or from gcloud.
    ///
    /// With a service account key file gcloud is asked for an
    /// application-default token, the key being exported to gcloud only.
    pub fn connect(credentials_file: Option<PathBuf>) -> Result<Self, FetchError> {
        let http = Client::builder().build()?;

        if let Ok(token) = env::var("GCP_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                return Ok(Self {
                    http,
                    token: token.trim().to_string(),
                });
            }
        }

        let mut cmd = Command::new("gcloud");
        match &credentials_file {
            Some(file) => {
                debug!("Using service account key {}", file.display());
                cmd.args(["auth", "application-default", "print-access-token"])
                    .env("GOOGLE_APPLICATION_CREDENTIALS", file);
            }
            None => {
                cmd.args(["auth", "print-access-token"]);
            }
        }

        let output = run_tool(&mut cmd, "gcloud")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Auth(stderr.trim().to_string()));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(FetchError::Auth("gcloud returned an empty access token".into()));
        }
        Ok(Self { http, token })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub zone: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(rename = "networkIP")]
    pub network_ip: Option<String>,
    pub ipv6_address: Option<String>,
}

impl Instance {
    /// GCP labels are used verbatim
    pub fn normalize(self) -> NormalizedInstance {
        let addresses = self
            .network_interfaces
            .iter()
            .flat_map(|nic| [nic.network_ip.clone(), nic.ipv6_address.clone()])
            .flatten()
            .collect();

        // zone is a URL ending in zones/<name>
        let zone = self.zone.as_deref().and_then(|z| z.rsplit('/').next());

        NormalizedInstance::from_tags(self.id, self.labels, addresses, zone)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceList {
    #[serde(default)]
    pub items: Vec<Instance>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstancesScopedList {
    #[serde(default)]
    pub instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedInstanceList {
    /// Keyed by `zones/<name>`; zones without instances carry only a warning
    #[serde(default)]
    pub items: BTreeMap<String, InstancesScopedList>,
    pub next_page_token: Option<String>,
}

impl AggregatedInstanceList {
    pub fn into_page(self) -> (Vec<NormalizedInstance>, Option<String>) {
        let instances = self
            .items
            .into_values()
            .flat_map(|scoped| scoped.instances)
            .map(Instance::normalize)
            .collect();
        (instances, self.next_page_token)
    }
}

impl InstanceList {
    pub fn into_page(self) -> (Vec<NormalizedInstance>, Option<String>) {
        let instances = self.items.into_iter().map(Instance::normalize).collect();
        (instances, self.next_page_token)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcpQuery {
    pub project: String,
    pub zone: Option<String>,
    pub status: Option<String>,
    /// Instance name, `*` wildcards allowed
    pub name: Option<String>,
    /// Label filters; a `*` value only requires the label to exist
    pub labels: Vec<(String, String)>,
    pub page_size: u32,
}

impl GcpQuery {
    pub fn url(&self) -> String {
        match &self.zone {
            Some(zone) => format!("{}/projects/{}/zones/{}/instances", COMPUTE_URL, self.project, zone),
            None => format!("{}/projects/{}/aggregated/instances", COMPUTE_URL, self.project),
        }
    }

    /// Compute API filter expression, parenthesized when there is more than one
    pub fn filter(&self) -> Option<String> {
        let mut terms = Vec::new();
        if let Some(status) = &self.status {
            terms.push(format!("status = {}", status.to_uppercase()));
        }
        if let Some(name) = &self.name {
            terms.push(format!("name = \"{}\"", name));
        }
        for (key, value) in &self.labels {
            if value == "*" {
                terms.push(format!("labels.{}:*", key));
            } else {
                terms.push(format!("labels.{} = \"{}\"", key, value));
            }
        }

        match terms.len() {
            0 => None,
            1 => terms.pop(),
            _ => Some(
                terms
                    .iter()
                    .map(|t| format!("({})", t))
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
        }
    }

    pub fn params(&self, token: Option<&str>) -> Vec<(&'static str, String)> {
        let mut params = vec![("maxResults", self.page_size.to_string())];
        if let Some(filter) = self.filter() {
            params.push(("filter", filter));
        }
        if let Some(token) = token {
            params.push(("pageToken", token.to_string()));
        }
        params
    }
}

/// Authenticated GETs against the compute API
pub trait ComputeApi {
    fn get_value(&self, url: &str, params: &[(&str, String)]) -> Result<Value, FetchError>;
}

impl ComputeApi for GcpClient {
    fn get_value(&self, url: &str, params: &[(&str, String)]) -> Result<Value, FetchError> {
        bearer_get(&self.http, url, &self.token, params)
    }
}

/// Paginated instance listing for one project
pub struct ComputeInventory<C = GcpClient> {
    client: C,
    query: GcpQuery,
    cursor: Cursor,
}

impl<C: ComputeApi> ComputeInventory<C> {
    pub fn new(client: C, query: GcpQuery) -> Self {
        Self {
            client,
            query,
            cursor: Cursor::Start,
        }
    }
}

impl<C: ComputeApi> InventorySource for ComputeInventory<C> {
    fn provider(&self) -> Provider {
        Provider::Gcp
    }

    fn next_page(&mut self) -> Result<Option<Vec<NormalizedInstance>>, FetchError> {
        if self.cursor == Cursor::Exhausted {
            return Ok(None);
        }

        let url = self.query.url();
        let params = self.query.params(self.cursor.token());
        let json = self.client.get_value(&url, &params)?;

        let (page, next) = if self.query.zone.is_some() {
            serde_json::from_value::<InstanceList>(json)?.into_page()
        } else {
            serde_json::from_value::<AggregatedInstanceList>(json)?.into_page()
        };

        self.cursor = Cursor::after(next);
        debug!("GCP page with {} instance(s)", page.len());
        Ok(Some(page))
    }
}
