//! Provider-neutral inventory types
//!
//! Every provider adapter turns its raw listing into pages of
//! [`NormalizedInstance`] and exposes them through [`InventorySource`], so the
//! aggregator and the publisher never see provider-specific shapes.

use crate::error::FetchError;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::process::{Command, Output};

/// Tag or label holding the display name of an instance
pub const NAME_TAG: &str = "Name";

/// Display name used when no `Name` tag is present
pub const UNKNOWN_NAME: &str = "Unknown";

/// Locality used when the provider record carries none
pub const UNKNOWN_ZONE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One virtual machine, reduced to what grouping needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedInstance {
    /// Provider instance id, empty when the record has none
    pub id: String,

    /// Value of the `Name` tag, or `"Unknown"`
    pub name: String,

    /// Every tag except `Name`, in provider order. Kept as pairs so keys that
    /// normalize to the same text still yield one group each.
    pub group_tags: Vec<(String, String)>,

    /// Private addresses of all interfaces, in interface order
    pub private_addresses: Vec<String>,

    /// Availability zone, location or zone name
    pub zone_or_placement: String,
}

impl NormalizedInstance {
    /// Build an instance from raw tags, splitting off the `Name` tag.
    ///
    /// A missing or empty `Name` yields `"Unknown"`; a blank zone yields
    /// `"unknown"`. Never fails.
    pub fn from_tags<I>(
        id: impl Into<String>,
        tags: I,
        private_addresses: Vec<String>,
        zone_or_placement: Option<&str>,
    ) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut name = None;
        let mut group_tags = Vec::new();

        for (key, value) in tags {
            if key == NAME_TAG {
                name = Some(value);
            } else {
                group_tags.push((key, value));
            }
        }

        let zone = zone_or_placement
            .map(str::trim)
            .filter(|z| !z.is_empty())
            .unwrap_or(UNKNOWN_ZONE);

        Self {
            id: id.into(),
            name: name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| UNKNOWN_NAME.to_string()),
            group_tags,
            private_addresses,
            zone_or_placement: zone.to_string(),
        }
    }

    /// Value of the first group tag named `key`
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.group_tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A lazy, finite sequence of inventory pages.
///
/// Sources are built once per run. `next_page` returns `Ok(None)` once the
/// provider has no continuation left; errors are never retried here.
pub trait InventorySource {
    fn provider(&self) -> Provider;

    fn next_page(&mut self) -> Result<Option<Vec<NormalizedInstance>>, FetchError>;
}

/// Iterator over the pages of a source. Stops after the first error.
pub struct Pages<'a, S: ?Sized> {
    source: &'a mut S,
    done: bool,
}

pub fn pages<S: InventorySource + ?Sized>(source: &mut S) -> Pages<'_, S> {
    Pages { source, done: false }
}

impl<S: InventorySource + ?Sized> Iterator for Pages<'_, S> {
    type Item = Result<Vec<NormalizedInstance>, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.source.next_page() {
            Ok(Some(page)) => Some(Ok(page)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Pagination position of a token-based listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Start,
    Token(String),
    Exhausted,
}

impl Cursor {
    /// Position after a page that returned `next` as its continuation
    pub fn after(next: Option<String>) -> Self {
        match next {
            Some(token) if !token.is_empty() => Cursor::Token(token),
            _ => Cursor::Exhausted,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Cursor::Token(t) => Some(t),
            _ => None,
        }
    }
}

/// Split `env=prod,team=infra` into key/value pairs. A bare key gets the value `*`.
pub fn parse_tag_filters(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (pair.to_string(), "*".to_string()),
        })
        .collect()
}

/// Run an external CLI, mapping a missing binary to [`FetchError::ToolMissing`]
pub(crate) fn run_tool(cmd: &mut Command, tool: &'static str) -> Result<Output, FetchError> {
    tracing::debug!("Running: {:?}", cmd);

    cmd.output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FetchError::ToolMissing(tool)
        } else {
            FetchError::Io(e)
        }
    })
}

/// GET a JSON document with a bearer token.
///
/// 401/403 become [`FetchError::Auth`], any other non-success status
/// [`FetchError::Api`].
pub(crate) fn bearer_get<T: DeserializeOwned>(
    http: &Client,
    url: &str,
    token: &str,
    query: &[(&str, String)],
) -> Result<T, FetchError> {
    tracing::debug!(url, ?query, "GET");

    let resp = http.get(url).bearer_auth(token).query(query).send()?;
    let status = resp.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let body = resp.text().unwrap_or_default();
        return Err(FetchError::Auth(format!("{} {}: {}", status, url, body)));
    }
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        return Err(FetchError::Api(format!("{} {}: {}", status, url, body)));
    }

    Ok(resp.json()?)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Source replaying canned pages
    pub struct FixtureSource {
        pub provider: Provider,
        pub pages: VecDeque<Vec<NormalizedInstance>>,
        pub fail_after: Option<usize>,
        pub served: usize,
    }

    impl FixtureSource {
        pub fn new(provider: Provider, pages: Vec<Vec<NormalizedInstance>>) -> Self {
            Self {
                provider,
                pages: pages.into(),
                fail_after: None,
                served: 0,
            }
        }

        /// Split instances into pages of `size`
        pub fn paged(provider: Provider, instances: Vec<NormalizedInstance>, size: usize) -> Self {
            let pages = instances.chunks(size).map(|c| c.to_vec()).collect();
            Self::new(provider, pages)
        }
    }

    impl InventorySource for FixtureSource {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn next_page(&mut self) -> Result<Option<Vec<NormalizedInstance>>, FetchError> {
            if self.fail_after == Some(self.served) {
                return Err(FetchError::Auth("fixture denied".into()));
            }
            self.served += 1;
            Ok(self.pages.pop_front())
        }
    }

    pub fn instance(name: &str, tags: &[(&str, &str)], addrs: &[&str], zone: &str) -> NormalizedInstance {
        let mut all: Vec<(String, String)> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        all.push((NAME_TAG.to_string(), name.to_string()));
        NormalizedInstance::from_tags(
            name,
            all,
            addrs.iter().map(|a| a.to_string()).collect(),
            Some(zone),
        )
    }
}
