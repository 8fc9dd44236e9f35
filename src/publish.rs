//! Full-replace synchronization of groups to named address lists

use crate::aggregate::GroupAggregate;
use crate::error::SmcError;
use crate::inventory::Provider;
use colored::*;
use std::collections::BTreeSet;
use tracing::{error, info};

/// How submitted addresses combine with the current list contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Submitted addresses become the whole list
    Replace,
    /// Submitted addresses are added to what is already there
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChange {
    Created,
    Updated,
    Unchanged,
}

/// Remote list after an update-or-create call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListHandle {
    pub name: String,
    pub href: String,
    pub change: ListChange,
}

/// A remote store of named address lists
pub trait AddressListStore {
    fn update_or_create(
        &mut self,
        name: &str,
        addresses: &[String],
        mode: MergeMode,
    ) -> Result<ListHandle, SmcError>;

    /// Release the session, if any
    fn finish(&mut self) -> Result<(), SmcError> {
        Ok(())
    }
}

/// Contents a list should hold after submitting `incoming`
pub fn merged_contents(existing: &[String], incoming: &[String], mode: MergeMode) -> Vec<String> {
    match mode {
        MergeMode::Replace => incoming.to_vec(),
        MergeMode::Append => {
            let mut merged = existing.to_vec();
            for addr in incoming {
                if !merged.contains(addr) {
                    merged.push(addr.clone());
                }
            }
            merged
        }
    }
}

/// Lists are compared as sets; order and repetition carry no meaning to the firewall
pub fn same_members(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<&String> = a.iter().collect();
    let b: BTreeSet<&String> = b.iter().collect();
    a == b
}

#[derive(Debug)]
pub enum GroupOutcome {
    Synced(ListHandle),
    Failed(String),
}

#[derive(Debug, Default)]
pub struct PublishReport {
    pub outcomes: Vec<(String, GroupOutcome)>,
}

impl PublishReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, GroupOutcome::Failed(_)))
            .count()
    }

    pub fn count(&self, change: ListChange) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, GroupOutcome::Synced(h) if h.change == change))
            .count()
    }

    pub fn print_summary(&self) {
        println!();
        println!("{}", "═".repeat(70).bright_black());
        for (group, outcome) in &self.outcomes {
            match outcome {
                GroupOutcome::Synced(handle) => {
                    let change = match handle.change {
                        ListChange::Created => "created".green(),
                        ListChange::Updated => "updated".yellow(),
                        ListChange::Unchanged => "unchanged".bright_black(),
                    };
                    println!("{} {} {} ({})", "✅".green(), group.cyan().bold(), change, handle.href.bright_black());
                }
                GroupOutcome::Failed(reason) => {
                    println!("{} {} {}", "❌".red(), group.cyan().bold(), reason.red());
                }
            }
        }
        println!("{}", "═".repeat(70).bright_black());
        println!(
            "Groups: {} | created {} | updated {} | unchanged {} | failed {}",
            self.total().to_string().cyan().bold(),
            self.count(ListChange::Created).to_string().green(),
            self.count(ListChange::Updated).to_string().yellow(),
            self.count(ListChange::Unchanged).to_string().bright_black(),
            if self.failed() > 0 {
                self.failed().to_string().red().bold()
            } else {
                self.failed().to_string().green()
            }
        );
    }
}

/// Push every group with replace semantics.
///
/// One call per group. A failing group is recorded and the remaining groups
/// are still attempted.
pub fn publish<S: AddressListStore + ?Sized>(
    store: &mut S,
    provider: Provider,
    aggregate: &GroupAggregate,
) -> PublishReport {
    let mut report = PublishReport::default();

    for (group, addresses) in aggregate {
        match store.update_or_create(group, addresses, MergeMode::Replace) {
            Ok(handle) => {
                info!(%provider, group = %group, members = addresses.len(), change = ?handle.change, "synchronized IP list");
                report.outcomes.push((group.clone(), GroupOutcome::Synced(handle)));
            }
            Err(e) => {
                error!(%provider, group = %group, error = %e, "failed to synchronize IP list");
                report.outcomes.push((group.clone(), GroupOutcome::Failed(e.to_string())));
            }
        }
    }

    report
}
