// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;

use strum::IntoEnumIterator;

use crate::{in_workunit, Level, Metric, WorkunitMetadata, WorkunitState, WorkunitStore};

#[tokio::test]
async fn completed_workunits_are_reported_once() {
    let ws = WorkunitStore::new(false, Level::Debug);
    ws.init_thread_state(None);

    in_workunit!("outer", Level::Info, |_workunit| async {}).await;

    let (started, completed) = ws.latest_workunits(Level::Debug);
    assert_eq!(vec!["outer"], started.iter().map(|w| w.name).collect::<Vec<_>>());
    assert_eq!(
        vec!["outer"],
        completed.iter().map(|w| w.name).collect::<Vec<_>>()
    );
    assert!(matches!(
        completed[0].state,
        WorkunitState::Completed { .. }
    ));

    let (started, completed) = ws.latest_workunits(Level::Debug);
    assert!(started.is_empty());
    assert!(completed.is_empty());
}

#[tokio::test]
async fn invisible_parents_are_skipped() {
    let ws = WorkunitStore::new(false, Level::Trace);
    ws.init_thread_state(None);

    in_workunit!("root", Level::Info, |_workunit| async {
        in_workunit!("middle", Level::Trace, |_workunit| async {
            in_workunit!("leaf", Level::Info, |_workunit| async {}).await;
        })
        .await;
    })
    .await;

    let (_, completed) = ws.latest_workunits(Level::Info);
    let by_name = completed
        .iter()
        .map(|w| (w.name, w))
        .collect::<std::collections::HashMap<_, _>>();
    assert_eq!(
        HashSet::from(["root", "leaf"]),
        by_name.keys().cloned().collect::<HashSet<_>>()
    );
    assert_eq!(
        Some(by_name["root"].span_id),
        by_name["leaf"].parent_id,
        "The leaf should be re-parented past the trace-level workunit."
    );
}

#[tokio::test]
async fn disabled_levels_are_not_recorded() {
    let ws = WorkunitStore::new(false, Level::Info);
    ws.init_thread_state(None);

    let res = in_workunit!(
        "too_fine",
        Level::Debug,
        desc = Some("Not recorded".to_owned()),
        |workunit| async move {
            workunit.update_metadata(|m| WorkunitMetadata {
                message: Some("ignored".to_owned()),
                ..m
            });
            42
        }
    )
    .await;
    assert_eq!(42, res);

    let (started, completed) = ws.latest_workunits(Level::Trace);
    assert!(started.is_empty());
    assert!(completed.is_empty());
}

#[tokio::test]
async fn canceled_workunits_are_forgotten() {
    let ws = WorkunitStore::new(false, Level::Debug);
    ws.init_thread_state(None);

    let mut never = in_workunit!("never_finishes", Level::Info, |_workunit| async {
        futures::future::pending::<()>().await
    });
    assert!(futures::poll!(&mut never).is_pending());
    // Dropping the Future cancels the workunit.
    std::mem::drop(never);

    let (started, completed) = ws.latest_workunits(Level::Debug);
    assert!(started.is_empty());
    assert!(completed.is_empty());
}

#[tokio::test]
async fn blocking_token_is_released() {
    let (_store, mut workunit) = WorkunitStore::setup_for_tests();
    let state = |workunit: &super::RunningWorkunit| {
        workunit
            .workunit
            .as_ref()
            .map(|w| w.state.blocked())
            .unwrap()
    };
    {
        let _token = workunit.blocking();
        assert!(state(&workunit));
    }
    assert!(!state(&workunit));
}

#[test]
fn counters() {
    let ws = WorkunitStore::new(false, Level::Debug);
    ws.increment_counter(Metric::FileReads, 2);
    ws.increment_counter(Metric::FileReads, 3);
    ws.increment_counter(Metric::RuleExecutions, 1);

    let metrics = ws.get_metrics();
    assert_eq!(Some(&5), metrics.get("file_reads"));
    assert_eq!(Some(&1), metrics.get("rule_executions"));
    assert_eq!(None, metrics.get("local_process_execution_requests"));
}

#[test]
fn metric_names_are_unique() {
    let names = Metric::iter()
        .map(<&'static str>::from)
        .collect::<HashSet<_>>();
    assert_eq!(Metric::iter().count(), names.len());
}
