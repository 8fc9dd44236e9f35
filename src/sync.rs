//! One run: fetch every page, aggregate, then report or publish

use crate::aggregate::{GroupAggregate, GroupAggregator};
use crate::cli::SyncArgs;
use crate::error::{Error, SmcError};
use crate::inventory::{pages, InventorySource};
use crate::publish::{publish, AddressListStore, PublishReport};
use crate::report;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub report_only: bool,
    pub untagged_group: Option<String>,
    pub keep_duplicates: bool,
}

impl From<&SyncArgs> for RunOptions {
    fn from(args: &SyncArgs) -> Self {
        Self {
            report_only: args.report_only,
            untagged_group: args.untagged_group.clone(),
            keep_duplicates: args.keep_duplicates,
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub aggregate: GroupAggregate,
    pub published: Option<PublishReport>,
}

/// Scan the whole inventory into one aggregate.
///
/// `on_page` sees every page as it arrives. The first fetch error aborts the
/// scan before anything is published.
pub fn collect<S, F>(source: &mut S, options: &RunOptions, mut on_page: F) -> Result<GroupAggregate, Error>
where
    S: InventorySource + ?Sized,
    F: FnMut(usize, &[crate::inventory::NormalizedInstance]),
{
    let provider = source.provider();
    let aggregator = GroupAggregator::new(provider)
        .with_untagged_group(options.untagged_group.clone())
        .keep_duplicates(options.keep_duplicates);

    let mut acc = aggregator.accumulator();
    let mut instances = 0;

    for (index, page) in pages(source).enumerate() {
        let page = page.map_err(|e| Error::fetch(provider, e))?;
        instances += page.len();
        on_page(index + 1, &page);
        acc.add(&page);
    }

    info!(%provider, instances, groups = acc.len(), "inventory scan complete");
    Ok(acc.finish())
}

/// Run the pipeline against `source`.
///
/// `connect` opens the address list store and is only called when
/// publishing, so report-only runs never touch the SMC.
pub fn execute<S, C, F>(source: &mut S, options: &RunOptions, connect: F) -> Result<RunOutcome, Error>
where
    S: InventorySource + ?Sized,
    C: AddressListStore,
    F: FnOnce() -> Result<C, SmcError>,
{
    let provider = source.provider();

    let aggregate = collect(source, options, |page_no, page| {
        if options.report_only {
            report::print_page(provider, page_no, page);
        }
    })?;

    if options.report_only {
        report::print_aggregate(provider, &aggregate);
        return Ok(RunOutcome {
            aggregate,
            published: None,
        });
    }

    let mut store = connect()?;
    let published = publish(&mut store, provider, &aggregate);
    if let Err(e) = store.finish() {
        warn!(%provider, "closing SMC session failed: {}", e);
    }
    published.print_summary();

    if published.failed() > 0 {
        return Err(Error::PublishFailed {
            failed: published.failed(),
            total: published.total(),
        });
    }

    Ok(RunOutcome {
        aggregate,
        published: Some(published),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::testing::{instance, FixtureSource};
    use crate::inventory::Provider;
    use crate::publish::testing::MemoryStore;
    use crate::publish::ListChange;
    use std::cell::Cell;

    fn inventory() -> Vec<crate::inventory::NormalizedInstance> {
        vec![
            instance("vm1", &[("env", "prod")], &["10.0.0.1"], "us-east-1b"),
            instance("vm2", &[], &["10.0.0.2"], "us-east-1a"),
            instance("vm3", &[("env", "prod"), ("team", "infra")], &["10.0.0.3"], "us-east-1a"),
        ]
    }

    #[test]
    fn report_only_never_connects() {
        let mut source = FixtureSource::paged(Provider::Aws, inventory(), 100);
        let options = RunOptions {
            report_only: true,
            ..Default::default()
        };
        let connected = Cell::new(false);

        let outcome = execute(&mut source, &options, || {
            connected.set(true);
            Ok(MemoryStore::default())
        })
        .unwrap();

        assert!(!connected.get());
        assert!(outcome.published.is_none());
        assert_eq!(outcome.aggregate["env_prod"], vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn report_and_publish_share_the_aggregate() {
        let report_options = RunOptions {
            report_only: true,
            ..Default::default()
        };
        let reported = execute(
            &mut FixtureSource::paged(Provider::Aws, inventory(), 100),
            &report_options,
            || Ok(MemoryStore::default()),
        )
        .unwrap();

        let published = execute(
            &mut FixtureSource::paged(Provider::Aws, inventory(), 100),
            &RunOptions::default(),
            || Ok(MemoryStore::default()),
        )
        .unwrap();

        assert_eq!(
            report::render_aggregate(&reported.aggregate),
            report::render_aggregate(&published.aggregate)
        );
        assert_eq!(published.published.unwrap().count(ListChange::Created), 3);
    }

    #[test]
    fn small_pages_match_one_big_page() {
        let options = RunOptions::default();
        let mut one = FixtureSource::paged(Provider::Gcp, inventory(), 1);
        let mut all = FixtureSource::paged(Provider::Gcp, inventory(), 100);

        let paged = collect(&mut one, &options, |_, _| {}).unwrap();
        let single = collect(&mut all, &options, |_, _| {}).unwrap();

        assert_eq!(one.served, 4);
        assert_eq!(paged, single);
    }

    #[test]
    fn fetch_failure_aborts_before_publishing() {
        let mut source = FixtureSource::paged(Provider::Aws, inventory(), 1);
        source.fail_after = Some(1);
        let connected = Cell::new(false);

        let err = execute(&mut source, &RunOptions::default(), || {
            connected.set(true);
            Ok(MemoryStore::default())
        })
        .unwrap_err();

        assert!(!connected.get());
        assert_eq!(err.exit_code(), crate::error::EXIT_PROVIDER_AUTH);
    }

    #[test]
    fn smc_connect_failure_maps_to_smc_exit_code() {
        let mut source = FixtureSource::paged(Provider::Azure, inventory(), 10);

        let err = execute(&mut source, &RunOptions::default(), || {
            Err::<MemoryStore, _>(SmcError::Login("401 Unauthorized".into()))
        })
        .unwrap_err();

        assert_eq!(err.exit_code(), crate::error::EXIT_SMC);
    }

    #[test]
    fn partial_publish_failure_is_reported() {
        let mut source = FixtureSource::paged(Provider::Aws, inventory(), 10);

        let err = execute(&mut source, &RunOptions::default(), || {
            let mut store = MemoryStore::default();
            store.failing.insert("team_infra".into());
            Ok(store)
        })
        .unwrap_err();

        match err {
            Error::PublishFailed { failed, total } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn untagged_override_and_duplicates_flow_through() {
        let mut source = FixtureSource::paged(
            Provider::Aws,
            vec![
                instance("a", &[], &["10.0.0.1"], "z1"),
                instance("b", &[], &["10.0.0.1"], "z2"),
            ],
            1,
        );
        let options = RunOptions {
            untagged_group: Some("lostandfound".into()),
            keep_duplicates: true,
            ..Default::default()
        };

        let agg = collect(&mut source, &options, |_, _| {}).unwrap();

        assert_eq!(agg.len(), 1);
        assert_eq!(agg["lostandfound"], vec!["10.0.0.1", "10.0.0.1"]);
    }
}
