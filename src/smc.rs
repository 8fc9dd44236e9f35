//! Forcepoint Security Management Center REST client
//!
//! Implements the IP list update-or-create contract: find the list by exact
//! name, create it when missing, and upload new contents only when the
//! members differ from what the SMC holds.

use crate::config::SmcSettings;
use crate::error::SmcError;
use crate::publish::{merged_contents, same_members, AddressListStore, ListChange, ListHandle, MergeMode};
use reqwest::blocking::{Client, Response};
use reqwest::header::LOCATION;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const IP_LIST_ENTRY_POINT: &str = "ip_list";

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
}

#[derive(Debug, Deserialize)]
struct VersionList {
    #[serde(default)]
    version: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct EntryPoints {
    #[serde(default)]
    entry_point: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    result: Vec<ElementRef>,
}

#[derive(Debug, Deserialize)]
struct ElementRef {
    name: String,
    href: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IpAddressList {
    #[serde(default)]
    ip: Vec<String>,
}

/// Highest API version advertised by `GET /api`
fn latest_version(links: &[Link]) -> Option<String> {
    fn key(rel: &str) -> Vec<u32> {
        rel.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    }

    links
        .iter()
        .max_by(|a, b| key(&a.rel).cmp(&key(&b.rel)))
        .map(|l| l.rel.clone())
}

fn check(resp: Response) -> Result<Response, SmcError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().unwrap_or_default();
    Err(SmcError::Status {
        status: status.as_u16(),
        url,
        body,
    })
}

/// Logged-in SMC session
pub struct SmcClient {
    http: Client,
    base: String,
    entry_points: HashMap<String, String>,
    logged_in: bool,
}

impl SmcClient {
    /// Open a session: resolve the API version, log in and load entry points
    pub fn login(settings: &SmcSettings) -> Result<Self, SmcError> {
        let mut builder = Client::builder()
            .cookie_store(true)
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify_ssl);

        if let Some(path) = &settings.ca_cert {
            let pem = std::fs::read(path)
                .map_err(|e| SmcError::Config(format!("cannot read {}: {}", path.display(), e)))?;
            let cert = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build()?;

        let version = match &settings.api_version {
            Some(v) => v.clone(),
            None => {
                let url = format!("{}/api", settings.address);
                let versions: VersionList = check(http.get(&url).send()?)?.json()?;
                latest_version(&versions.version)
                    .ok_or_else(|| SmcError::Login(format!("no API versions advertised at {}", url)))?
            }
        };
        let base = format!("{}/{}", settings.address, version);

        let mut body = json!({ "authenticationkey": settings.api_key });
        if let Some(domain) = &settings.domain {
            body["domain"] = json!(domain);
        }

        let resp = http.post(format!("{}/login", base)).json(&body).send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(SmcError::Login(format!("{} {}", status, text)));
        }
        info!("Logged in to SMC at {} (API {})", settings.address, version);

        let api: EntryPoints = check(http.get(format!("{}/api", base)).send()?)?.json()?;
        let entry_points = api
            .entry_point
            .into_iter()
            .map(|link| (link.rel, link.href))
            .collect();

        Ok(Self {
            http,
            base,
            entry_points,
            logged_in: true,
        })
    }

    fn entry_point(&self, rel: &str) -> Result<&str, SmcError> {
        self.entry_points
            .get(rel)
            .map(String::as_str)
            .ok_or_else(|| SmcError::MissingEntryPoint(rel.to_string()))
    }

    pub fn logout(&mut self) -> Result<(), SmcError> {
        if !self.logged_in {
            return Ok(());
        }
        // one attempt only, Drop must not retry a failed logout
        self.logged_in = false;
        check(self.http.put(format!("{}/logout", self.base)).send()?)?;
        debug!("Logged out of SMC");
        Ok(())
    }
}

/// IP list element operations update-or-create is built from
trait IpListElements {
    fn find(&self, name: &str) -> Result<Option<String>, SmcError>;
    fn create(&self, name: &str) -> Result<String, SmcError>;
    fn contents(&self, href: &str) -> Result<Vec<String>, SmcError>;
    fn upload(&self, href: &str, addresses: &[String]) -> Result<(), SmcError>;
}

impl IpListElements for SmcClient {
    /// Href of the IP list named exactly `name`
    fn find(&self, name: &str) -> Result<Option<String>, SmcError> {
        let href = self.entry_point(IP_LIST_ENTRY_POINT)?;
        let found: SearchResult = check(
            self.http
                .get(href)
                .query(&[("filter", name), ("exact_match", "true")])
                .send()?,
        )?
        .json()?;

        Ok(found
            .result
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| e.href))
    }

    fn create(&self, name: &str) -> Result<String, SmcError> {
        let href = self.entry_point(IP_LIST_ENTRY_POINT)?;
        let resp = check(
            self.http
                .post(href)
                .json(&json!({ "name": name, "comment": "Managed by tagsync" }))
                .send()?,
        )?;

        resp.headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| SmcError::MissingLocation(name.to_string()))
    }

    fn contents(&self, href: &str) -> Result<Vec<String>, SmcError> {
        let list: IpAddressList = check(
            self.http
                .get(format!("{}/ip_address_list", href))
                .send()?,
        )?
        .json()?;
        Ok(list.ip)
    }

    fn upload(&self, href: &str, addresses: &[String]) -> Result<(), SmcError> {
        check(
            self.http
                .post(format!("{}/ip_address_list", href))
                .query(&[("type", "json")])
                .json(&IpAddressList {
                    ip: addresses.to_vec(),
                })
                .send()?,
        )?;
        Ok(())
    }
}

/// Find or create the list `name` and upload `addresses` when the members differ
fn sync_ip_list<E: IpListElements + ?Sized>(
    elements: &E,
    name: &str,
    addresses: &[String],
    mode: MergeMode,
) -> Result<ListHandle, SmcError> {
    let (href, change) = match elements.find(name)? {
        Some(href) => {
            let existing = elements.contents(&href)?;
            let desired = merged_contents(&existing, addresses, mode);
            if same_members(&existing, &desired) {
                (href, ListChange::Unchanged)
            } else {
                elements.upload(&href, &desired)?;
                (href, ListChange::Updated)
            }
        }
        None => {
            let href = elements.create(name)?;
            elements.upload(&href, addresses)?;
            (href, ListChange::Created)
        }
    };

    debug!(name, href = %href, ?change, "update_or_create");
    Ok(ListHandle {
        name: name.to_string(),
        href,
        change,
    })
}

impl AddressListStore for SmcClient {
    fn update_or_create(
        &mut self,
        name: &str,
        addresses: &[String],
        mode: MergeMode,
    ) -> Result<ListHandle, SmcError> {
        sync_ip_list(&*self, name, addresses, mode)
    }

    fn finish(&mut self) -> Result<(), SmcError> {
        self.logout()
    }
}

impl Drop for SmcClient {
    fn drop(&mut self) {
        if self.logged_in {
            if let Err(e) = self.logout() {
                warn!("SMC logout failed: {}", e);
            }
        }
    }
}
