//! Tag to group aggregation

use crate::inventory::{NormalizedInstance, Provider};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Group name to member addresses. Keys are sorted so every rendering of an
/// aggregate is deterministic.
pub type GroupAggregate = BTreeMap<String, Vec<String>>;

/// Group name for one tag: `key_value`, or the bare key when the value is empty
pub fn tag_group_name(key: &str, value: &str) -> String {
    if value.is_empty() {
        key.to_string()
    } else {
        format!("{}_{}", key, value)
    }
}

/// Folds normalized instances into a [`GroupAggregate`]
#[derive(Debug, Clone)]
pub struct GroupAggregator {
    provider: Provider,
    untagged_group: Option<String>,
    dedup: bool,
}

impl GroupAggregator {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            untagged_group: None,
            dedup: true,
        }
    }

    /// Fixed group for instances without non-Name tags. Blank names are ignored.
    pub fn with_untagged_group(mut self, name: Option<String>) -> Self {
        self.untagged_group = name.filter(|n| !n.trim().is_empty());
        self
    }

    /// Keep repeated addresses inside a group instead of collapsing them
    pub fn keep_duplicates(mut self, keep: bool) -> Self {
        self.dedup = !keep;
        self
    }

    /// Groups one instance contributes to.
    ///
    /// Tagged instances fan out to one group per tag; untagged ones land only
    /// in the fallback group.
    pub fn group_names(&self, instance: &NormalizedInstance) -> Vec<String> {
        if instance.group_tags.is_empty() {
            let name = match &self.untagged_group {
                Some(name) => name.clone(),
                None => format!("untagged-{}-{}", self.provider, instance.zone_or_placement),
            };
            return vec![name];
        }

        instance
            .group_tags
            .iter()
            .map(|(key, value)| tag_group_name(key, value))
            .collect()
    }

    /// Empty running aggregate for a paginated scan
    pub fn accumulator(&self) -> GroupAccumulator {
        GroupAccumulator {
            aggregator: self.clone(),
            groups: GroupAggregate::new(),
            seen: HashMap::new(),
        }
    }

    pub fn aggregate<'a, I>(&self, instances: I) -> GroupAggregate
    where
        I: IntoIterator<Item = &'a NormalizedInstance>,
    {
        let mut acc = self.accumulator();
        acc.add(instances);
        acc.finish()
    }
}

/// Aggregate under construction. Groups and the addresses already seen in
/// each group persist across [`add`](Self::add) calls.
#[derive(Debug)]
pub struct GroupAccumulator {
    aggregator: GroupAggregator,
    groups: GroupAggregate,
    seen: HashMap<String, HashSet<String>>,
}

impl GroupAccumulator {
    /// Add one page of instances
    pub fn add<'a, I>(&mut self, instances: I)
    where
        I: IntoIterator<Item = &'a NormalizedInstance>,
    {
        for instance in instances {
            for group in self.aggregator.group_names(instance) {
                let seen = self.seen.entry(group.clone()).or_default();
                let members = self.groups.entry(group).or_default();
                for addr in &instance.private_addresses {
                    if self.aggregator.dedup && !seen.insert(addr.clone()) {
                        continue;
                    }
                    members.push(addr.clone());
                }
            }
        }
    }

    /// Number of groups so far
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn finish(self) -> GroupAggregate {
        self.groups
    }
}
