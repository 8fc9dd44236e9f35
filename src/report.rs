//! Report-only output

use crate::aggregate::GroupAggregate;
use crate::aws::VpcSummary;
use crate::inventory::{NormalizedInstance, Provider};
use colored::*;

/// Pretty JSON of an aggregate. Keys are sorted, so equal aggregates render
/// byte for byte the same.
pub fn render_aggregate(aggregate: &GroupAggregate) -> String {
    serde_json::to_string_pretty(aggregate).unwrap_or_else(|_| "{}".to_string())
}

pub fn print_vpcs(vpcs: &[VpcSummary]) {
    println!("{}", "🏢 VPCs:".yellow().bold());
    if vpcs.is_empty() {
        println!("  {}", "none".bright_black());
    }
    for vpc in vpcs {
        println!("  • {} ({})", vpc.name.cyan(), vpc.vpc_id.bright_black());
    }
    println!();
}

pub fn print_page(provider: Provider, page_no: usize, instances: &[NormalizedInstance]) {
    println!(
        "{}",
        format!("📄 {} page {} - {} instance(s)", provider, page_no, instances.len())
            .cyan()
            .bold()
    );
    for inst in instances {
        let tags = inst
            .group_tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ");

        println!(
            "  {} {} ({}) - {} - [{}] - {}",
            "•".bright_black(),
            inst.name.cyan().bold(),
            inst.id.bright_black(),
            inst.zone_or_placement.yellow(),
            tags,
            if inst.private_addresses.is_empty() {
                "no addresses".bright_black()
            } else {
                inst.private_addresses.join(", ").green()
            }
        );
    }
    println!();
}

pub fn print_aggregate(provider: Provider, aggregate: &GroupAggregate) {
    println!("{}", "═".repeat(70).bright_black());
    println!(
        "{}",
        format!("📋 {} IP lists ({} group(s)) - report only, SMC not contacted", provider, aggregate.len())
            .yellow()
            .bold()
    );
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", render_aggregate(aggregate));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering_is_sorted_and_stable() {
        let mut a = GroupAggregate::new();
        a.insert("team_infra".into(), vec!["10.0.0.1".into()]);
        a.insert("env_prod".into(), vec!["10.0.0.1".into()]);

        let mut b = GroupAggregate::new();
        b.insert("env_prod".into(), vec!["10.0.0.1".into()]);
        b.insert("team_infra".into(), vec!["10.0.0.1".into()]);

        let rendered = render_aggregate(&a);
        assert_eq!(rendered, render_aggregate(&b));
        assert!(rendered.find("env_prod").unwrap() < rendered.find("team_infra").unwrap());

        let parsed: GroupAggregate = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, a);
    }

    #[test]
    fn empty_aggregate_renders_as_object() {
        assert_eq!(render_aggregate(&GroupAggregate::new()), "{}");
    }
}
