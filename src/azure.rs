//! Azure virtual machines through the management REST API
//!
//! A service principal from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and
//! `AZURE_CLIENT_SECRET` is used when set, otherwise the token of the
//! logged-in `az` CLI.
//!
//! The VM listing only carries interface ids, so every interface is fetched
//! from the Network API to learn its private addresses.

use crate::error::FetchError;
use crate::inventory::{bearer_get, run_tool, InventorySource, NormalizedInstance, Provider};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::env;
use std::process::Command;
use tracing::{debug, info};

pub const MANAGEMENT_URL: &str = "https://management.azure.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const LOGIN_URL: &str = "https://login.microsoftonline.com";

const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";
const COMPUTE_API_VERSION: &str = "2024-07-01";
const NETWORK_API_VERSION: &str = "2024-05-01";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
}

/// Service principal credential from the environment, if complete
fn environment_credential() -> Option<(String, String, String)> {
    let tenant = env::var("AZURE_TENANT_ID").ok()?;
    let client = env::var("AZURE_CLIENT_ID").ok()?;
    let secret = env::var("AZURE_CLIENT_SECRET").ok()?;
    Some((tenant, client, secret))
}

fn acquire_token(http: &Client) -> Result<String, FetchError> {
    if let Some((tenant, client_id, secret)) = environment_credential() {
        debug!("Using service principal {} in tenant {}", client_id, tenant);
        let resp = http
            .post(format!("{}/{}/oauth2/v2.0/token", LOGIN_URL, tenant))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", secret.as_str()),
                ("scope", MANAGEMENT_SCOPE),
            ])
            .send()?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(FetchError::Auth(format!("token request for client {} returned {}: {}", client_id, status, body)));
        }
        let token: TokenResponse = resp.json()?;
        return Ok(token.access_token);
    }

    debug!("No service principal in environment, asking az CLI for a token");
    let output = run_tool(
        Command::new("az").args([
            "account",
            "get-access-token",
            "--resource",
            "https://management.azure.com/",
            "--output",
            "json",
        ]),
        "az",
    )?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FetchError::Auth(stderr.trim().to_string()));
    }
    let token: CliToken = serde_json::from_slice(&output.stdout)?;
    Ok(token.access_token)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Subscription {
    id: Option<String>,
    subscription_id: String,
    tenant_id: Option<String>,
}

/// One page of an ARM list operation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmPage<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub properties: Option<VmProperties>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmProperties {
    pub vm_id: Option<String>,
    #[serde(default)]
    pub network_profile: Option<NetworkProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    #[serde(default)]
    pub network_interfaces: Option<Vec<ResourceRef>>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceRef {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub properties: Option<NicProperties>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicProperties {
    #[serde(default)]
    pub ip_configurations: Option<Vec<IpConfiguration>>,
}

#[derive(Debug, Deserialize)]
pub struct IpConfiguration {
    #[serde(default)]
    pub properties: Option<IpConfigurationProperties>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IpConfigurationProperties {
    #[serde(rename = "privateIPAddress")]
    pub private_ip_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstanceView {
    #[serde(default)]
    pub statuses: Option<Vec<InstanceViewStatus>>,
}

#[derive(Debug, Deserialize)]
pub struct InstanceViewStatus {
    #[serde(default)]
    pub code: String,
}

impl InstanceView {
    /// `running` for a `PowerState/running` status
    pub fn power_state(&self) -> Option<&str> {
        self.statuses
            .iter()
            .flatten()
            .find_map(|s| s.code.strip_prefix("PowerState/"))
    }
}

impl NetworkInterface {
    pub fn private_addresses(&self) -> Vec<String> {
        self.properties
            .iter()
            .flat_map(|p| p.ip_configurations.iter().flatten())
            .filter_map(|c| c.properties.as_ref()?.private_ip_address.clone())
            .collect()
    }
}

impl VirtualMachine {
    pub fn interface_ids(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .flat_map(|p| p.network_profile.iter())
            .flat_map(|n| n.network_interfaces.iter().flatten())
            .map(|nic| nic.id.as_str())
    }

    /// Normalize with the addresses resolved from its interfaces.
    /// Azure tags are used verbatim.
    pub fn into_instance(self, private_addresses: Vec<String>) -> NormalizedInstance {
        NormalizedInstance::from_tags(
            self.properties.and_then(|p| p.vm_id).unwrap_or_default(),
            self.tags.unwrap_or_default(),
            private_addresses,
            self.location.as_deref(),
        )
    }
}

/// Authenticated GETs against the management API
pub trait ArmTransport {
    fn get_value(&self, url: &str, api_version: Option<&str>) -> Result<Value, FetchError>;

    fn get<T: DeserializeOwned>(&self, url: &str, api_version: Option<&str>) -> Result<T, FetchError> {
        Ok(serde_json::from_value(self.get_value(url, api_version)?)?)
    }

    /// Subscription ids visible to the credential
    fn list_subscriptions(&self) -> Result<Vec<String>, FetchError> {
        let mut ids = Vec::new();
        let mut page: ArmPage<Subscription> =
            self.get(&format!("{}/subscriptions", MANAGEMENT_URL), Some(SUBSCRIPTIONS_API_VERSION))?;

        loop {
            for sub in page.value {
                info!(
                    "Subscription: {} id: {} Tenant: {}",
                    sub.id.as_deref().unwrap_or("-"),
                    sub.subscription_id,
                    sub.tenant_id.as_deref().unwrap_or("-")
                );
                ids.push(sub.subscription_id);
            }
            match page.next_link {
                Some(link) => page = self.get(&link, None)?,
                None => break,
            }
        }

        Ok(ids)
    }

    fn interface_addresses(&self, interface_id: &str) -> Result<Vec<String>, FetchError> {
        let nic: NetworkInterface = self.get(
            &format!("{}{}", MANAGEMENT_URL, interface_id),
            Some(NETWORK_API_VERSION),
        )?;
        Ok(nic.private_addresses())
    }

    fn power_state(&self, vm_id: &str) -> Result<Option<String>, FetchError> {
        let view: InstanceView = self.get(
            &format!("{}{}/instanceView", MANAGEMENT_URL, vm_id),
            Some(COMPUTE_API_VERSION),
        )?;
        Ok(view.power_state().map(String::from))
    }
}

/// Authenticated management API client for one run
pub struct AzureClient {
    http: Client,
    token: String,
}

impl AzureClient {
    pub fn connect() -> Result<Self, FetchError> {
        let http = Client::builder().build()?;
        let token = acquire_token(&http)?;
        Ok(Self { http, token })
    }
}

impl ArmTransport for AzureClient {
    fn get_value(&self, url: &str, api_version: Option<&str>) -> Result<Value, FetchError> {
        // nextLink URLs already carry their query string
        let query: Vec<(&str, String)> = api_version
            .map(|v| vec![("api-version", v.to_string())])
            .unwrap_or_default();
        bearer_get(&self.http, url, &self.token, &query)
    }
}

/// VM listing URL for a subscription, optionally narrowed to a resource group
pub fn vm_list_url(subscription: &str, resource_group: Option<&str>) -> String {
    match resource_group {
        Some(group) => format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines",
            MANAGEMENT_URL, subscription, group
        ),
        None => format!(
            "{}/subscriptions/{}/providers/Microsoft.Compute/virtualMachines",
            MANAGEMENT_URL, subscription
        ),
    }
}

/// Lowercased power states from `running,deallocated`
pub fn parse_power_states(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// VMs of every subscription in turn, one ARM page at a time.
///
/// The VM list has no power state filter, so with `states` set each VM's
/// instance view is read and VMs in other states are dropped.
pub struct VmInventory<T = AzureClient> {
    client: T,
    scopes: VecDeque<String>,
    next_link: Option<String>,
    states: Vec<String>,
}

impl<T: ArmTransport> VmInventory<T> {
    pub fn new(client: T, subscriptions: &[String], resource_group: Option<&str>) -> Self {
        Self {
            client,
            scopes: subscriptions
                .iter()
                .map(|s| vm_list_url(s, resource_group))
                .collect(),
            next_link: None,
            states: Vec::new(),
        }
    }

    pub fn with_states(mut self, states: Vec<String>) -> Self {
        self.states = states;
        self
    }

    fn wanted(&self, vm: &VirtualMachine) -> Result<bool, FetchError> {
        if self.states.is_empty() {
            return Ok(true);
        }
        let state = self.client.power_state(&vm.id)?;
        debug!("VM {} power state {:?}", vm.name, state);
        Ok(state.is_some_and(|s| self.states.iter().any(|w| w.eq_ignore_ascii_case(&s))))
    }

    fn resolve(&self, vm: VirtualMachine) -> Result<Option<NormalizedInstance>, FetchError> {
        if !self.wanted(&vm)? {
            return Ok(None);
        }
        let mut addresses = Vec::new();
        for id in vm.interface_ids() {
            addresses.extend(self.client.interface_addresses(id)?);
        }
        debug!("VM {}: {:?}", vm.name, addresses);
        Ok(Some(vm.into_instance(addresses)))
    }
}

impl<T: ArmTransport> InventorySource for VmInventory<T> {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn next_page(&mut self) -> Result<Option<Vec<NormalizedInstance>>, FetchError> {
        let page: ArmPage<VirtualMachine> = match self.next_link.take() {
            Some(link) => self.client.get(&link, None)?,
            None => match self.scopes.pop_front() {
                Some(url) => {
                    info!("Virtual machine check {}", url);
                    self.client.get(&url, Some(COMPUTE_API_VERSION))?
                }
                None => return Ok(None),
            },
        };
        self.next_link = page.next_link;

        let mut instances = Vec::new();
        for vm in page.value {
            if let Some(instance) = self.resolve(vm)? {
                instances.push(instance);
            }
        }
        Ok(Some(instances))
    }
}
