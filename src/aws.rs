//! EC2 inventory through the aws CLI
//!
//! Credentials are whatever the aws CLI resolves (environment, profiles,
//! instance roles). A shared credentials file can be handed to the child
//! process; the CLI user needs AmazonEC2ReadOnlyAccess and
//! AmazonVPCReadOnlyAccess.

use crate::error::FetchError;
use crate::inventory::{
    parse_tag_filters, run_tool, Cursor, InventorySource, NormalizedInstance, Provider, NAME_TAG, UNKNOWN_NAME,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Error codes and messages the aws CLI prints for credential problems
const AUTH_MARKERS: &[&str] = &[
    "AuthFailure",
    "UnauthorizedOperation",
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "AccessDenied",
    "Unable to locate credentials",
    "The config profile",
];

/// aws CLI handle for one run
#[derive(Debug, Clone, Default)]
pub struct AwsCli {
    region: Option<String>,
    profile: Option<String>,
    credentials_file: Option<PathBuf>,
}

impl AwsCli {
    pub fn new(region: Option<String>, profile: Option<String>, credentials_file: Option<PathBuf>) -> Self {
        Self {
            region,
            profile,
            credentials_file,
        }
    }

    /// Build the argument list for one CLI call
    fn args(&self, command: &str, extra: &[String]) -> Vec<String> {
        let mut args = vec!["ec2".to_string(), command.to_string(), "--output".into(), "json".into()];
        if let Some(region) = &self.region {
            args.extend(["--region".to_string(), region.clone()]);
        }
        if let Some(profile) = &self.profile {
            args.extend(["--profile".to_string(), profile.clone()]);
        }
        args.extend(extra.iter().cloned());
        args
    }

    fn run(&self, command: &str, extra: &[String]) -> Result<Value, FetchError> {
        let mut cmd = Command::new("aws");
        cmd.args(self.args(command, extra));
        if let Some(file) = &self.credentials_file {
            cmd.env("AWS_SHARED_CREDENTIALS_FILE", file);
        }

        let output = run_tool(&mut cmd, "aws")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }

        let json: Value = serde_json::from_slice(&output.stdout)?;
        debug!("aws ec2 {}: {}", command, json);
        Ok(json)
    }

    /// One page of `describe-vpcs` with the next token
    pub fn describe_vpcs_page(
        &self,
        page_size: u32,
        token: Option<&str>,
    ) -> Result<(Vec<VpcSummary>, Option<String>), FetchError> {
        let json = self.run("describe-vpcs", &page_args(page_size, token))?;
        Ok((vpcs_from_response(&json), next_token(&json)))
    }
}

fn page_args(page_size: u32, token: Option<&str>) -> Vec<String> {
    let mut args = vec!["--max-items".to_string(), page_size.to_string()];
    if let Some(token) = token {
        args.extend(["--starting-token".to_string(), token.to_string()]);
    }
    args
}

/// Map aws CLI stderr to an auth or API failure
pub fn classify_failure(stderr: &str) -> FetchError {
    let message = stderr.trim().to_string();
    if AUTH_MARKERS.iter().any(|m| message.contains(m)) {
        FetchError::Auth(message)
    } else {
        FetchError::Api(message)
    }
}

/// Server-side filters for `describe-instances`
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    pub page_size: u32,
    pub name: Option<String>,
    pub tag_filters: Vec<(String, String)>,
    pub states: Vec<String>,
}

impl InstanceQuery {
    fn filters(&self) -> Vec<Value> {
        let mut filters = Vec::new();

        if let Some(name) = &self.name {
            filters.push(json!({ "Name": format!("tag:{}", NAME_TAG), "Values": [name] }));
        }
        for (key, value) in &self.tag_filters {
            filters.push(json!({ "Name": format!("tag:{}", key), "Values": [value] }));
        }
        if !self.states.is_empty() {
            filters.push(json!({ "Name": "instance-state-name", "Values": self.states }));
        }

        filters
    }

    /// `--filters` in JSON form so values with commas or spaces survive
    pub fn filter_args(&self) -> Vec<String> {
        let filters = self.filters();
        if filters.is_empty() {
            return Vec::new();
        }
        vec!["--filters".to_string(), Value::Array(filters).to_string()]
    }
}

/// Split `running,stopped` into states
pub fn parse_states(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn next_token(json: &Value) -> Option<String> {
    json["NextToken"].as_str().map(String::from)
}

/// Spaces are not accepted in the group names built from EC2 tags
fn sanitize(s: &str) -> String {
    s.replace(' ', "_")
}

/// Normalize one element of `Reservations[].Instances[]`
pub fn normalize_instance(instance: &Value) -> NormalizedInstance {
    let empty = vec![];

    let tags = instance["Tags"].as_array().unwrap_or(&empty).iter().map(|tag| {
        let key = tag["Key"].as_str().unwrap_or("");
        let value = tag["Value"].as_str().unwrap_or("");
        if key == NAME_TAG {
            (key.to_string(), value.to_string())
        } else {
            (sanitize(key), sanitize(value))
        }
    });

    let mut addresses = Vec::new();
    for nic in instance["NetworkInterfaces"].as_array().unwrap_or(&empty) {
        for private in nic["PrivateIpAddresses"].as_array().unwrap_or(&empty) {
            if let Some(addr) = private["PrivateIpAddress"].as_str() {
                addresses.push(addr.to_string());
            }
        }
        for v6 in nic["Ipv6Addresses"].as_array().unwrap_or(&empty) {
            if let Some(addr) = v6["Ipv6Address"].as_str() {
                addresses.push(addr.to_string());
            }
        }
    }

    // Instances without interface details still report their primary address
    if addresses.is_empty() {
        if let Some(addr) = instance["PrivateIpAddress"].as_str() {
            addresses.push(addr.to_string());
        }
    }

    NormalizedInstance::from_tags(
        instance["InstanceId"].as_str().unwrap_or(""),
        tags,
        addresses,
        instance["Placement"]["AvailabilityZone"].as_str(),
    )
}

pub fn instances_from_response(json: &Value) -> Vec<NormalizedInstance> {
    let mut instances = vec![];
    if let Some(reservations) = json["Reservations"].as_array() {
        for reservation in reservations {
            if let Some(insts) = reservation["Instances"].as_array() {
                instances.extend(insts.iter().map(normalize_instance));
            }
        }
    }
    instances
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpcSummary {
    pub name: String,
    pub vpc_id: String,
}

pub fn vpcs_from_response(json: &Value) -> Vec<VpcSummary> {
    let empty = vec![];
    json["Vpcs"]
        .as_array()
        .unwrap_or(&empty)
        .iter()
        .map(|vpc| {
            let name = vpc["Tags"]
                .as_array()
                .and_then(|tags| {
                    tags.iter()
                        .find(|t| t["Key"].as_str() == Some(NAME_TAG))
                        .and_then(|t| t["Value"].as_str())
                })
                .filter(|n| !n.is_empty())
                .unwrap_or(UNKNOWN_NAME);

            VpcSummary {
                name: name.to_string(),
                vpc_id: vpc["VpcId"].as_str().unwrap_or("unknown").to_string(),
            }
        })
        .collect()
}

/// All VPCs visible to the credentials, following `NextToken`
pub fn discover_vpcs(cli: &AwsCli, page_size: u32) -> Result<Vec<VpcSummary>, FetchError> {
    let mut vpcs = Vec::new();
    let mut cursor = Cursor::Start;

    while cursor != Cursor::Exhausted {
        let (page, next) = cli.describe_vpcs_page(page_size, cursor.token())?;
        vpcs.extend(page);
        cursor = Cursor::after(next);
    }

    Ok(vpcs)
}

/// Raw `describe-instances` pages
pub trait DescribeInstances {
    fn describe_instances(&self, query: &InstanceQuery, token: Option<&str>) -> Result<Value, FetchError>;
}

impl DescribeInstances for AwsCli {
    fn describe_instances(&self, query: &InstanceQuery, token: Option<&str>) -> Result<Value, FetchError> {
        let mut extra = query.filter_args();
        extra.extend(page_args(query.page_size, token));
        self.run("describe-instances", &extra)
    }
}

/// Paginated `describe-instances`
pub struct Ec2Inventory<D = AwsCli> {
    cli: D,
    query: InstanceQuery,
    cursor: Cursor,
}

impl<D: DescribeInstances> Ec2Inventory<D> {
    pub fn new(cli: D, query: InstanceQuery) -> Self {
        Self {
            cli,
            query,
            cursor: Cursor::Start,
        }
    }
}

impl<D: DescribeInstances> InventorySource for Ec2Inventory<D> {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn next_page(&mut self) -> Result<Option<Vec<NormalizedInstance>>, FetchError> {
        if self.cursor == Cursor::Exhausted {
            return Ok(None);
        }

        let json = self.cli.describe_instances(&self.query, self.cursor.token())?;
        let page = instances_from_response(&json);
        self.cursor = Cursor::after(next_token(&json));
        debug!("EC2 page with {} instance(s), more: {}", page.len(), self.cursor != Cursor::Exhausted);
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{GroupAggregate, GroupAggregator};

    fn reservation(instances: Value) -> Value {
        json!({ "Reservations": [ { "Instances": instances } ] })
    }

    #[test]
    fn instance_is_normalized() {
        let json = reservation(json!([{
            "InstanceId": "i-0abc",
            "Tags": [
                { "Key": "Name", "Value": "web server" },
                { "Key": "env", "Value": "prod" },
                { "Key": "cost center", "Value": "team a" }
            ],
            "Placement": { "AvailabilityZone": "us-east-1a" },
            "NetworkInterfaces": [
                { "PrivateIpAddresses": [
                    { "PrivateIpAddress": "10.0.0.1" },
                    { "PrivateIpAddress": "10.0.0.2" }
                ] },
                { "PrivateIpAddresses": [ { "PrivateIpAddress": "10.0.1.1" } ],
                  "Ipv6Addresses": [ { "Ipv6Address": "2600:1f18::1" } ] }
            ]
        }]));

        let instances = instances_from_response(&json);
        assert_eq!(instances.len(), 1);

        let inst = &instances[0];
        assert_eq!(inst.id, "i-0abc");
        assert_eq!(inst.name, "web server");
        assert_eq!(inst.zone_or_placement, "us-east-1a");
        assert_eq!(inst.private_addresses, vec!["10.0.0.1", "10.0.0.2", "10.0.1.1", "2600:1f18::1"]);
        assert_eq!(inst.tag("env"), Some("prod"));
        assert_eq!(inst.tag("cost_center"), Some("team_a"));
        assert_eq!(inst.tag("cost center"), None);
    }

    #[test]
    fn keys_that_sanitize_alike_keep_both_groups() {
        let inst = normalize_instance(&json!({
            "InstanceId": "i-1",
            "Tags": [
                { "Key": "cost center", "Value": "a" },
                { "Key": "cost_center", "Value": "b" }
            ],
            "PrivateIpAddress": "10.0.0.1"
        }));

        assert_eq!(inst.group_tags.len(), 2);

        let agg = GroupAggregator::new(Provider::Aws).aggregate([&inst]);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg["cost_center_a"], vec!["10.0.0.1"]);
        assert_eq!(agg["cost_center_b"], vec!["10.0.0.1"]);
    }

    #[test]
    fn bare_instance_gets_defaults() {
        let inst = normalize_instance(&json!({ "InstanceId": "i-1" }));

        assert_eq!(inst.name, "Unknown");
        assert_eq!(inst.zone_or_placement, "unknown");
        assert!(inst.group_tags.is_empty());
        assert!(inst.private_addresses.is_empty());
    }

    #[test]
    fn primary_address_used_without_interfaces() {
        let inst = normalize_instance(&json!({ "InstanceId": "i-1", "PrivateIpAddress": "172.31.0.5" }));
        assert_eq!(inst.private_addresses, vec!["172.31.0.5"]);
    }

    #[test]
    fn untagged_instance_lands_in_zone_group() {
        let json = reservation(json!([
            { "InstanceId": "i-1", "Tags": [ { "Key": "Name", "Value": "vm1" }, { "Key": "env", "Value": "prod" } ],
              "Placement": { "AvailabilityZone": "us-east-1b" },
              "NetworkInterfaces": [ { "PrivateIpAddresses": [ { "PrivateIpAddress": "10.0.0.1" } ] } ] },
            { "InstanceId": "i-2", "Tags": [ { "Key": "Name", "Value": "vm2" } ],
              "Placement": { "AvailabilityZone": "us-east-1a" },
              "NetworkInterfaces": [ { "PrivateIpAddresses": [ { "PrivateIpAddress": "10.0.0.2" } ] } ] }
        ]));

        let agg = GroupAggregator::new(Provider::Aws).aggregate(&instances_from_response(&json));

        let mut expected = GroupAggregate::new();
        expected.insert("env_prod".into(), vec!["10.0.0.1".into()]);
        expected.insert("untagged-aws-us-east-1a".into(), vec!["10.0.0.2".into()]);
        assert_eq!(agg, expected);
    }

    /// Serves canned pages keyed by starting token and records each request
    struct CannedPages {
        pages: Vec<(Option<&'static str>, Value)>,
        requested: std::cell::RefCell<Vec<Option<String>>>,
    }

    impl DescribeInstances for CannedPages {
        fn describe_instances(&self, query: &InstanceQuery, token: Option<&str>) -> Result<Value, FetchError> {
            assert_eq!(query.page_size, 1);
            self.requested.borrow_mut().push(token.map(String::from));
            self.pages
                .iter()
                .find(|(t, _)| *t == token)
                .map(|(_, page)| page.clone())
                .ok_or_else(|| FetchError::Api(format!("unexpected token {:?}", token)))
        }
    }

    #[test]
    fn cursor_follows_next_token_until_exhausted() {
        let mut first = reservation(json!([{ "InstanceId": "i-1", "PrivateIpAddress": "10.0.0.1" }]));
        first["NextToken"] = json!("t1");
        let second = reservation(json!([{ "InstanceId": "i-2", "PrivateIpAddress": "10.0.0.2" }]));

        let cli = CannedPages {
            pages: vec![(None, first), (Some("t1"), second)],
            requested: Default::default(),
        };
        let mut inventory = Ec2Inventory::new(
            cli,
            InstanceQuery {
                page_size: 1,
                ..Default::default()
            },
        );

        let ids: Vec<Vec<String>> = crate::inventory::pages(&mut inventory)
            .map(|page| page.unwrap().into_iter().map(|i| i.id).collect())
            .collect();

        assert_eq!(ids, vec![vec!["i-1".to_string()], vec!["i-2".to_string()]]);
        assert_eq!(inventory.cursor, Cursor::Exhausted);
        assert_eq!(*inventory.cli.requested.borrow(), vec![None, Some("t1".to_string())]);
        assert!(inventory.next_page().unwrap().is_none());
    }

    #[test]
    fn next_token_is_read() {
        assert_eq!(next_token(&json!({ "NextToken": "abc" })).as_deref(), Some("abc"));
        assert_eq!(next_token(&json!({ "Reservations": [] })), None);
    }

    #[test]
    fn filters_are_pushed_down() {
        let query = InstanceQuery {
            page_size: 50,
            name: Some("web*".into()),
            tag_filters: parse_tag_filters("env=prod, team"),
            states: parse_states("running, stopped,"),
        };

        let args = query.filter_args();
        assert_eq!(args[0], "--filters");
        let filters: Value = serde_json::from_str(&args[1]).unwrap();
        assert_eq!(
            filters,
            json!([
                { "Name": "tag:Name", "Values": ["web*"] },
                { "Name": "tag:env", "Values": ["prod"] },
                { "Name": "tag:team", "Values": ["*"] },
                { "Name": "instance-state-name", "Values": ["running", "stopped"] }
            ])
        );

        assert!(InstanceQuery::default().filter_args().is_empty());
    }

    #[test]
    fn cli_args_include_scope_and_paging() {
        let cli = AwsCli::new(Some("us-west-1".into()), Some("audit".into()), None);
        let mut extra = Vec::new();
        extra.extend(page_args(25, Some("tok")));

        let args = cli.args("describe-instances", &extra);
        assert_eq!(
            args,
            vec![
                "ec2", "describe-instances", "--output", "json", "--region", "us-west-1", "--profile", "audit",
                "--max-items", "25", "--starting-token", "tok"
            ]
        );
    }

    #[test]
    fn credential_errors_are_auth_failures() {
        assert!(matches!(
            classify_failure("An error occurred (AuthFailure) when calling the DescribeInstances operation"),
            FetchError::Auth(_)
        ));
        assert!(matches!(
            classify_failure("Unable to locate credentials. You can configure credentials by running \"aws configure\"."),
            FetchError::Auth(_)
        ));
        assert!(matches!(
            classify_failure("An error occurred (RequestLimitExceeded) when calling the DescribeInstances operation"),
            FetchError::Api(_)
        ));
    }

    #[test]
    fn vpc_names_default_to_unknown() {
        let json = json!({ "Vpcs": [
            { "VpcId": "vpc-1", "Tags": [ { "Key": "Name", "Value": "core" } ] },
            { "VpcId": "vpc-2" }
        ] });

        assert_eq!(
            vpcs_from_response(&json),
            vec![
                VpcSummary { name: "core".into(), vpc_id: "vpc-1".into() },
                VpcSummary { name: "Unknown".into(), vpc_id: "vpc-2".into() },
            ]
        );
    }
}
