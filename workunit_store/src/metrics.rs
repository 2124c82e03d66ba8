// Copyright 2020 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use strum_macros::{EnumIter, IntoStaticStr};

///
/// Counters recorded by the engine while executing a session. The snake_case rendering of each
/// variant is the name reported by `WorkunitStore::get_metrics`.
///
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Metric {
    /// A @rule body (or intrinsic) actually ran, rather than being served from memo.
    RuleExecutions,
    /// A memoized node was revalidated without re-running, because its dependencies were unchanged.
    NodesCleaned,
    /// A node was dirtied by invalidation.
    NodesDirtied,
    FileReads,
    DirectoryScans,
    LocalProcessExecutionRequests,
    LocalProcessExecutionFailures,
    LocalProcessExecutionTimeouts,
}
