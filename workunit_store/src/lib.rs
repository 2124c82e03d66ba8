// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::log;
pub use log::Level;
pub use metrics::Metric;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task_local;

mod metrics;

///
/// Identifies one run of a Session. Uncacheable nodes are recomputed once per RunId.
///
/// RunIds are only meaningful within a single Graph, and only equality matters (not ordering).
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct SpanId(u64);

impl SpanId {
    pub fn new() -> SpanId {
        SpanId(rand::thread_rng().gen())
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016.x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSpan {
    pub start: SystemTime,
    pub duration: Duration,
}

impl TimeSpan {
    fn since(start: SystemTime, end: SystemTime) -> TimeSpan {
        TimeSpan {
            start,
            // A clock that moved backwards yields a zero duration.
            duration: end.duration_since(start).unwrap_or_default(),
        }
    }
}

///
/// A unit of work (usually a node or an intrinsic) which is recorded in the WorkunitStore.
///
/// While running, one copy of a Workunit lives in the `RunningWorkunit` held by the
/// `in_workunit!` macro, and another lives in the store. Only the atomic `blocked` flag is shared
/// between the two: everything else is copied into the store when the workunit completes.
///
#[derive(Clone, Debug)]
pub struct Workunit {
    pub name: &'static str,
    pub span_id: SpanId,
    pub parent_id: Option<SpanId>,
    pub state: WorkunitState,
    pub metadata: WorkunitMetadata,
}

impl Workunit {
    fn log_workunit_state(&self, canceled: bool) {
        if !log::log_enabled!(self.metadata.level) {
            return;
        }
        let state = match (&self.state, canceled) {
            (_, true) => "Canceled:",
            (WorkunitState::Started { .. }, _) => "Starting:",
            (WorkunitState::Completed { .. }, _) => "Completed:",
        };

        let identifier = self.metadata.desc.as_deref().unwrap_or(self.name);
        // Truncate long descriptions (roughly: multi-byte characters are counted as one).
        const MAX_LEN: usize = 200;
        let identifier = if identifier.len() > MAX_LEN {
            let truncated: String = identifier.chars().take(MAX_LEN).collect();
            format!(
                "{truncated}... ({} characters truncated)",
                identifier.len() - MAX_LEN
            )
        } else {
            identifier.to_owned()
        };

        let message = self
            .metadata
            .message
            .as_ref()
            .map(|m| format!(" - {m}"))
            .unwrap_or_default();

        log!(self.metadata.level, "{state} {identifier}{message}");
    }
}

#[derive(Clone, Debug)]
pub enum WorkunitState {
    Started {
        start_time: SystemTime,
        blocked: Arc<AtomicBool>,
    },
    Completed {
        time_span: TimeSpan,
    },
}

impl WorkunitState {
    pub fn blocked(&self) -> bool {
        match self {
            WorkunitState::Started { blocked, .. } => blocked.load(atomic::Ordering::Relaxed),
            WorkunitState::Completed { .. } => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkunitMetadata {
    pub desc: Option<String>,
    pub message: Option<String>,
    pub level: Level,
}

impl Default for WorkunitMetadata {
    fn default() -> WorkunitMetadata {
        WorkunitMetadata {
            level: Level::Info,
            desc: None,
            message: None,
        }
    }
}

///
/// Workunits which have been started or completed since the last call to `latest_workunits`, plus
/// enough history to re-parent visible workunits under their nearest visible ancestor.
///
#[derive(Default)]
struct WorkunitRecords {
    records: HashMap<SpanId, Workunit>,
    unreported_started: Vec<SpanId>,
    unreported_completed: Vec<SpanId>,
}

impl WorkunitRecords {
    fn nearest_visible_parent(
        &self,
        mut span_id: Option<SpanId>,
        max_level: Level,
    ) -> Option<SpanId> {
        while let Some(current) = span_id {
            let workunit = self.records.get(&current)?;
            if workunit.metadata.level <= max_level {
                return Some(current);
            }
            span_id = workunit.parent_id;
        }
        None
    }

    fn drain(&mut self, unreported: Vec<SpanId>, max_level: Level) -> Vec<Workunit> {
        unreported
            .into_iter()
            .filter_map(|span_id| {
                let workunit = self.records.get(&span_id)?;
                if workunit.metadata.level > max_level {
                    return None;
                }
                let mut workunit = workunit.clone();
                workunit.parent_id = self.nearest_visible_parent(workunit.parent_id, max_level);
                Some(workunit)
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct WorkunitStore {
    log_starting_workunits: bool,
    max_level: Level,
    workunit_records: Arc<Mutex<WorkunitRecords>>,
    counters: Arc<Mutex<HashMap<Metric, u64>>>,
}

impl WorkunitStore {
    pub fn new(log_starting_workunits: bool, max_level: Level) -> WorkunitStore {
        WorkunitStore {
            log_starting_workunits,
            max_level,
            workunit_records: Arc::default(),
            counters: Arc::default(),
        }
    }

    pub fn init_thread_state(&self, parent_id: Option<SpanId>) {
        set_thread_workunit_store_handle(Some(WorkunitStoreHandle {
            store: self.clone(),
            parent_id,
        }))
    }

    pub fn max_level(&self) -> Level {
        self.max_level
    }

    ///
    /// NB: Public for macro use. Use `in_workunit!` instead.
    ///
    pub fn _start_workunit(
        &self,
        span_id: SpanId,
        name: &'static str,
        parent_id: Option<SpanId>,
        metadata: WorkunitMetadata,
    ) -> Workunit {
        let started = Workunit {
            name,
            span_id,
            parent_id,
            state: WorkunitState::Started {
                start_time: SystemTime::now(),
                blocked: Arc::new(AtomicBool::new(false)),
            },
            metadata,
        };

        {
            let mut records = self.workunit_records.lock();
            records.records.insert(span_id, started.clone());
            records.unreported_started.push(span_id);
        }

        if self.log_starting_workunits {
            started.log_workunit_state(false)
        }
        started
    }

    fn complete_workunit(&self, mut workunit: Workunit) {
        let start_time = match workunit.state {
            WorkunitState::Started { start_time, .. } => start_time,
            WorkunitState::Completed { .. } => {
                log::warn!("Workunit {} was already completed", workunit.span_id);
                return;
            }
        };
        workunit.state = WorkunitState::Completed {
            time_span: TimeSpan::since(start_time, SystemTime::now()),
        };
        workunit.log_workunit_state(false);

        let mut records = self.workunit_records.lock();
        records.unreported_completed.push(workunit.span_id);
        records.records.insert(workunit.span_id, workunit);
    }

    fn cancel_workunit(&self, workunit: Workunit) {
        workunit.log_workunit_state(true);
        let mut records = self.workunit_records.lock();
        records.records.remove(&workunit.span_id);
        records.unreported_started.retain(|s| *s != workunit.span_id);
    }

    ///
    /// Returns the workunits at or above `max_verbosity` which were (started, completed) since
    /// the last call. The parent of each returned workunit is rewritten to its nearest ancestor
    /// which is itself visible at `max_verbosity`.
    ///
    pub fn latest_workunits(&self, max_verbosity: Level) -> (Vec<Workunit>, Vec<Workunit>) {
        let mut records = self.workunit_records.lock();
        let started = std::mem::take(&mut records.unreported_started);
        let completed = std::mem::take(&mut records.unreported_completed);
        let started = records.drain(started, max_verbosity);
        let completed = records.drain(completed, max_verbosity);
        (started, completed)
    }

    pub fn increment_counter(&self, counter_name: Metric, change: u64) {
        *self.counters.lock().entry(counter_name).or_insert(0) += change;
    }

    pub fn get_metrics(&self) -> HashMap<&'static str, u64> {
        self.counters
            .lock()
            .iter()
            .map(|(metric, value)| (metric.into(), *value))
            .collect()
    }

    pub fn setup_for_tests() -> (WorkunitStore, RunningWorkunit) {
        let store = WorkunitStore::new(false, Level::Debug);
        store.init_thread_state(None);
        let workunit =
            store._start_workunit(SpanId(0), "testing", None, WorkunitMetadata::default());
        (store.clone(), RunningWorkunit::new(store, Some(workunit)))
    }
}

///
/// The store and the current parent workunit for a thread or task.
///
#[derive(Clone)]
pub struct WorkunitStoreHandle {
    pub store: WorkunitStore,
    pub parent_id: Option<SpanId>,
}

thread_local! {
    static THREAD_WORKUNIT_STORE_HANDLE: RefCell<Option<WorkunitStoreHandle>> =
        const { RefCell::new(None) };
}

task_local! {
    static TASK_WORKUNIT_STORE_HANDLE: Option<WorkunitStoreHandle>;
}

///
/// Sets the handle for the current thread (but not for a Task: see
/// `scope_task_workunit_store_handle`).
///
pub fn set_thread_workunit_store_handle(workunit_store_handle: Option<WorkunitStoreHandle>) {
    THREAD_WORKUNIT_STORE_HANDLE.with(|thread_workunit_handle| {
        *thread_workunit_handle.borrow_mut() = workunit_store_handle;
    })
}

pub fn get_workunit_store_handle() -> Option<WorkunitStoreHandle> {
    if let Ok(Some(store_handle)) =
        TASK_WORKUNIT_STORE_HANDLE.try_with(|task_store_handle| task_store_handle.clone())
    {
        Some(store_handle)
    } else {
        THREAD_WORKUNIT_STORE_HANDLE
            .with(|thread_store_handle| (*thread_store_handle.borrow()).clone())
    }
}

pub fn expect_workunit_store_handle() -> WorkunitStoreHandle {
    get_workunit_store_handle().expect("A WorkunitStore has not been set for this thread.")
}

///
/// Runs the given async block inside of a workunit, if the given level is enabled by the store.
/// Otherwise the block runs with a disabled `RunningWorkunit`.
///
/// NB: May only be used where a WorkunitStore has been set (via `init_thread_state` or by
/// spawning through a `task_executor::Executor`). Callers must depend on `futures`.
///
#[macro_export]
macro_rules! in_workunit {
    ($workunit_name: expr, $workunit_level: expr $(, $workunit_field_name:ident = $workunit_field_value:expr)*, |$workunit: ident| $f: expr $(,)?) => {{
        use futures::future::FutureExt;
        let mut store_handle = $crate::expect_workunit_store_handle();
        let level: log::Level = $workunit_level;
        if store_handle.store.max_level() >= level {
            let mut $workunit = {
                let workunit_metadata = $crate::WorkunitMetadata {
                    level,
                    $(
                        $workunit_field_name: $workunit_field_value,
                    )*
                    ..Default::default()
                };
                let span_id = $crate::SpanId::new();
                let parent_id = std::mem::replace(&mut store_handle.parent_id, Some(span_id));
                let workunit = store_handle.store._start_workunit(
                    span_id,
                    $workunit_name,
                    parent_id,
                    workunit_metadata,
                );
                $crate::RunningWorkunit::new(store_handle.store.clone(), Some(workunit))
            };
            $crate::scope_task_workunit_store_handle(Some(store_handle), async move {
                let result = {
                    let $workunit = &mut $workunit;
                    $f
                }
                .await;
                $workunit.complete();
                result
            })
            .boxed()
        } else {
            async move {
                let mut $workunit = $crate::RunningWorkunit::new(store_handle.store, None);
                {
                    let $workunit = &mut $workunit;
                    $f
                }
                .await
            }
            .boxed()
        }
    }};
}

///
/// A started workunit. Completed explicitly via `complete`, or canceled if dropped first (which
/// happens when the Future running inside of it is dropped).
///
pub struct RunningWorkunit {
    store: WorkunitStore,
    workunit: Option<Workunit>,
}

impl RunningWorkunit {
    pub fn new(store: WorkunitStore, workunit: Option<Workunit>) -> RunningWorkunit {
        RunningWorkunit { store, workunit }
    }

    pub fn increment_counter(&mut self, counter_name: Metric, change: u64) {
        self.store.increment_counter(counter_name, change);
    }

    pub fn update_metadata<F>(&mut self, f: F)
    where
        F: FnOnce(WorkunitMetadata) -> WorkunitMetadata,
    {
        if let Some(ref mut workunit) = self.workunit {
            workunit.metadata = f(workunit.metadata.clone())
        }
    }

    ///
    /// Marks the workunit as blocked (waiting on other work) until the returned token is dropped.
    ///
    pub fn blocking(&mut self) -> BlockingWorkunitToken {
        let mut token = BlockingWorkunitToken(None);
        if let Some(WorkunitState::Started { blocked, .. }) =
            self.workunit.as_ref().map(|w| &w.state)
        {
            blocked.store(true, atomic::Ordering::Relaxed);
            token.0 = Some(blocked.clone());
        }
        token
    }

    pub fn complete(&mut self) {
        if let Some(workunit) = self.workunit.take() {
            self.store.complete_workunit(workunit);
        }
    }
}

impl Drop for RunningWorkunit {
    fn drop(&mut self) {
        if let Some(workunit) = self.workunit.take() {
            self.store.cancel_workunit(workunit);
        }
    }
}

pub struct BlockingWorkunitToken(Option<Arc<AtomicBool>>);

impl Drop for BlockingWorkunitToken {
    fn drop(&mut self) {
        if let Some(blocked) = self.0.take() {
            blocked.store(false, atomic::Ordering::Relaxed);
        }
    }
}

///
/// Propagates the given handle into a Future, which is usually about to be spawned as a Task.
///
pub async fn scope_task_workunit_store_handle<F>(
    workunit_store_handle: Option<WorkunitStoreHandle>,
    f: F,
) -> F::Output
where
    F: Future,
{
    TASK_WORKUNIT_STORE_HANDLE
        .scope(workunit_store_handle, f)
        .await
}

#[cfg(test)]
mod tests;
