// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use maplit::{btreemap, hashset};
use parking_lot::Mutex;
use task_executor::Executor;
use tempfile::TempDir;

use crate::context::{Core, ExecutionOptions};
use crate::fs::{
    DirectoryListing, FileContent, ReadFileRequest, RelativePath, ScandirRequest, Stat,
};
use crate::intrinsics::{BuildRunId, SessionValues};
use crate::nodes::{Get, TaskContext};
use crate::process::{Process, ProcessCacheScope, ProcessResult};
use crate::rules::{RuleEntry, RuleIndex};
use crate::scheduler::{ExecutionRequest, ExecutionTermination, Scheduler};
use crate::session::Session;
use crate::tasks::{Function, Tasks};
use crate::values::{throw, Failure, NodeResult, ThrowKind, TypeId, Value};
use crate::Level;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Name(String);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Greeting(String);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Names(Vec<String>);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Greetings(Vec<String>);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct LineCount(usize);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Tick(usize);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Depth(u32);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Total(u32);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Fruit;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Banana(u8);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Config(u8);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Scaled(u8);

fn add_rule<F, Fut>(
    tasks: &mut Tasks,
    name: &str,
    product: TypeId,
    clause: Vec<TypeId>,
    gets: Vec<(TypeId, Vec<TypeId>)>,
    func: F,
) where
    F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = NodeResult<Value>> + Send + 'static,
{
    tasks.task_begin(Function::new(name, func), product, true, None, Level::Debug);
    for selector in clause {
        tasks.add_select(selector);
    }
    for (output, inputs) in gets {
        tasks.add_get(output, inputs);
    }
    tasks.task_end();
}

///
/// A rule which greets a Name, counting its executions. Throws for the name "boom".
///
fn add_greet_rule(tasks: &mut Tasks, counter: Arc<AtomicUsize>) {
    add_rule(
        tasks,
        "greet",
        TypeId::of::<Greeting>(),
        vec![TypeId::of::<Name>()],
        vec![],
        move |_, args| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let name = args[0].extract::<Name>()?.clone();
                if name.0 == "boom" {
                    return Err(throw("Could not greet boom.".to_owned()));
                }
                Ok(Value::new(Greeting(format!("Hello, {}!", name.0))))
            }
        },
    );
}

struct TestEngine {
    scheduler: Scheduler,
    session: Session,
    build_root: TempDir,
}

impl TestEngine {
    fn new(tasks: Tasks) -> TestEngine {
        Self::with_options(tasks, ExecutionOptions::default())
    }

    fn with_options(tasks: Tasks, options: ExecutionOptions) -> TestEngine {
        let build_root = TempDir::new().unwrap();
        let rule_index = RuleIndex::create(tasks.entries()).unwrap();
        let core = Core::new(
            Executor::new(),
            rule_index,
            build_root.path().to_path_buf(),
            options,
        )
        .unwrap();
        let scheduler = Scheduler::new(core);
        let session = Session::new(
            &scheduler,
            "test_build".to_owned(),
            Value::new(()),
            AsyncLatch::new(),
        );
        TestEngine {
            scheduler,
            session,
            build_root,
        }
    }

    fn request(&self, roots: Vec<(Vec<Value>, TypeId)>) -> ExecutionRequest {
        let mut request = ExecutionRequest::new();
        for (params, product) in roots {
            self.scheduler
                .add_root_select(&mut request, params, product)
                .unwrap();
        }
        request
    }

    async fn run(&self, roots: Vec<(Vec<Value>, TypeId)>) -> Vec<NodeResult<Value>> {
        let request = self.request(roots);
        self.scheduler.run(&request, &self.session).await.unwrap()
    }

    async fn run_one(&self, params: Vec<Value>, product: TypeId) -> NodeResult<Value> {
        self.run(vec![(params, product)]).await.remove(0)
    }

    fn write_file(&self, path: &str, content: &str) {
        std::fs::write(self.build_root.path().join(path), content).unwrap();
    }

    fn metric(&self, name: &str) -> u64 {
        self.scheduler
            .metrics(&self.session)
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

fn name(s: &str) -> Value {
    Value::new(Name(s.to_owned()))
}

fn greeting(s: &str) -> Value {
    Value::new(Greeting(s.to_owned()))
}

fn throw_message(result: &NodeResult<Value>) -> String {
    match result {
        Err(Failure::Throw { message, .. }) => message.clone(),
        other => panic!("Expected a Throw, got: {other:?}"),
    }
}

#[tokio::test]
async fn single_rule() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let engine = TestEngine::new(tasks);

    let result = engine
        .run_one(vec![name("pants")], TypeId::of::<Greeting>())
        .await;
    assert_eq!(result, Ok(greeting("Hello, pants!")));
}

#[tokio::test]
async fn memoized_across_requests_and_sessions() {
    let _logger = env_logger::try_init();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, counter.clone());
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let engine = TestEngine::new(tasks);

    for _ in 0..3 {
        let result = engine
            .run_one(vec![name("pants")], TypeId::of::<Greeting>())
            .await;
        assert_eq!(result, Ok(greeting("Hello, pants!")));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let other_session = Session::new(
        &engine.scheduler,
        "other_build".to_owned(),
        Value::new(()),
        AsyncLatch::new(),
    );
    let request = engine.request(vec![(vec![name("pants")], TypeId::of::<Greeting>())]);
    let results = engine
        .scheduler
        .run(&request, &other_session)
        .await
        .unwrap();
    assert_eq!(results, vec![Ok(greeting("Hello, pants!"))]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // A different param is a different Node.
    engine
        .run_one(vec![name("other")], TypeId::of::<Greeting>())
        .await
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_requests_run_once() {
    let _logger = env_logger::try_init();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut tasks = Tasks::new();
    {
        let counter = counter.clone();
        add_rule(
            &mut tasks,
            "slow_greet",
            TypeId::of::<Greeting>(),
            vec![TypeId::of::<Name>()],
            vec![],
            move |_, args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let name = args[0].extract::<Name>()?;
                    Ok(Value::new(Greeting(name.0.clone())))
                }
            },
        );
    }
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let engine = TestEngine::new(tasks);

    let results = engine
        .run(
            (0..4)
                .map(|_| (vec![name("same")], TypeId::of::<Greeting>()))
                .collect(),
        )
        .await;
    assert_eq!(results, vec![Ok(greeting("same")); 4]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

///
/// Greets each of a list of Names with a MultiGet.
///
fn add_greet_all_rule(tasks: &mut Tasks) {
    add_rule(
        tasks,
        "greet_all",
        TypeId::of::<Greetings>(),
        vec![TypeId::of::<Names>()],
        vec![(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()])],
        |context, args| async move {
            let names = args[0].extract::<Names>()?.clone();
            let gets = names
                .0
                .into_iter()
                .map(|n| Get::new(TypeId::of::<Greeting>(), vec![Value::new(Name(n))]))
                .collect();
            let greetings = context
                .multi_get(gets)
                .await?
                .iter()
                .map(|v| v.extract::<Greeting>().map(|g| g.0.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::new(Greetings(greetings)))
        },
    );
    tasks.query_add(TypeId::of::<Greetings>(), vec![TypeId::of::<Names>()]);
}

#[tokio::test]
async fn get_and_multi_get() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    add_greet_all_rule(&mut tasks);
    let engine = TestEngine::new(tasks);

    let names = Names(vec!["c".to_owned(), "a".to_owned(), "b".to_owned()]);
    let result = engine
        .run_one(vec![Value::new(names)], TypeId::of::<Greetings>())
        .await;
    assert_eq!(
        result,
        Ok(Value::new(Greetings(vec![
            "Hello, c!".to_owned(),
            "Hello, a!".to_owned(),
            "Hello, b!".to_owned(),
        ])))
    );
}

#[tokio::test]
async fn multi_get_results_are_in_request_order() {
    let _logger = env_logger::try_init();
    let completed = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Tasks::new();
    {
        let completed = completed.clone();
        add_rule(
            &mut tasks,
            "greet_eventually",
            TypeId::of::<Greeting>(),
            vec![TypeId::of::<Name>()],
            vec![],
            move |_, args| {
                let completed = completed.clone();
                async move {
                    let name = args[0].extract::<Name>()?.0.clone();
                    if name == "slow" {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    completed.lock().push(name.clone());
                    Ok(greeting(&name))
                }
            },
        );
    }
    add_greet_all_rule(&mut tasks);
    let engine = TestEngine::new(tasks);

    let names = Names(vec!["slow".to_owned(), "fast".to_owned()]);
    let result = engine
        .run_one(vec![Value::new(names)], TypeId::of::<Greetings>())
        .await;
    assert_eq!(
        result,
        Ok(Value::new(Greetings(vec!["slow".to_owned(), "fast".to_owned()])))
    );
    // The slow Get completed last, but its result is first.
    assert_eq!(*completed.lock(), vec!["fast".to_owned(), "slow".to_owned()]);
}

#[tokio::test]
async fn throws_are_catchable() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    add_rule(
        &mut tasks,
        "safe_greet",
        TypeId::of::<Greetings>(),
        vec![TypeId::of::<Names>()],
        vec![(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()])],
        |context, args| async move {
            let names = args[0].extract::<Names>()?.clone();
            let mut greetings = Vec::new();
            for n in names.0 {
                let get = Get::new(TypeId::of::<Greeting>(), vec![Value::new(Name(n))]);
                match context.get(get).await {
                    Ok(v) => greetings.push(v.extract::<Greeting>()?.0.clone()),
                    Err(Failure::Throw { message, .. }) => greetings.push(message),
                    Err(failure) => return Err(failure),
                }
            }
            Ok(Value::new(Greetings(greetings)))
        },
    );
    tasks.query_add(TypeId::of::<Greetings>(), vec![TypeId::of::<Names>()]);
    let engine = TestEngine::new(tasks);

    let names = Names(vec!["boom".to_owned(), "ok".to_owned()]);
    let result = engine
        .run_one(vec![Value::new(names)], TypeId::of::<Greetings>())
        .await;
    assert_eq!(
        result,
        Ok(Value::new(Greetings(vec![
            "Could not greet boom.".to_owned(),
            "Hello, ok!".to_owned(),
        ])))
    );
}

#[tokio::test]
async fn partial_failure_is_isolated() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let engine = TestEngine::new(tasks);

    let results = engine
        .run(vec![
            (vec![name("boom")], TypeId::of::<Greeting>()),
            (vec![name("fine")], TypeId::of::<Greeting>()),
        ])
        .await;
    assert_eq!(throw_message(&results[0]), "Could not greet boom.");
    assert_eq!(results[1], Ok(greeting("Hello, fine!")));
}

#[tokio::test]
async fn failures_carry_engine_tracebacks() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    add_rule(
        &mut tasks,
        "greet_first",
        TypeId::of::<Greetings>(),
        vec![TypeId::of::<Names>()],
        vec![(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()])],
        |context, args| async move {
            let names = args[0].extract::<Names>()?.clone();
            let get = Get::new(
                TypeId::of::<Greeting>(),
                vec![Value::new(Name(names.0[0].clone()))],
            );
            let greeting = context.get(get).await?;
            Ok(Value::new(Greetings(vec![greeting
                .extract::<Greeting>()?
                .0
                .clone()])))
        },
    );
    tasks.query_add(TypeId::of::<Greetings>(), vec![TypeId::of::<Names>()]);
    let engine = TestEngine::new(tasks);

    let result = engine
        .run_one(
            vec![Value::new(Names(vec!["boom".to_owned()]))],
            TypeId::of::<Greetings>(),
        )
        .await;
    let failure = result.unwrap_err();
    assert_eq!(failure.throw_kind(), Some(ThrowKind::Exception));
    assert_eq!(
        failure.engine_traceback(),
        vec![
            "greet".to_owned(),
            "greet_first".to_owned(),
            "root".to_owned()
        ]
    );
}

#[tokio::test]
async fn undeclared_get() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    add_rule(
        &mut tasks,
        "sneaky",
        TypeId::of::<Greetings>(),
        vec![TypeId::of::<Names>()],
        vec![],
        |context, _| async move {
            let get = Get::new(TypeId::of::<Greeting>(), vec![name("x")]);
            context.get(get).await?;
            Ok(Value::new(Greetings(vec![])))
        },
    );
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    tasks.query_add(TypeId::of::<Greetings>(), vec![TypeId::of::<Names>()]);
    let engine = TestEngine::new(tasks);

    let result = engine
        .run_one(vec![Value::new(Names(vec![]))], TypeId::of::<Greetings>())
        .await;
    let message = throw_message(&result);
    assert!(
        message.contains("was not declared by sneaky()"),
        "Unexpected message: {message}"
    );
}

#[tokio::test]
async fn incorrect_product() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_rule(
        &mut tasks,
        "confused",
        TypeId::of::<Greeting>(),
        vec![TypeId::of::<Name>()],
        vec![],
        |_, args| async move { Ok(args[0].clone()) },
    );
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let engine = TestEngine::new(tasks);

    let result = engine
        .run_one(vec![name("x")], TypeId::of::<Greeting>())
        .await;
    assert_eq!(
        result.as_ref().err().and_then(|f| f.throw_kind()),
        Some(ThrowKind::IncorrectProduct)
    );
    assert!(throw_message(&result).contains("did not satisfy its constraints"));
}

fn add_total_rule(tasks: &mut Tasks, counter: Arc<AtomicUsize>) {
    // Sums the depths from the given Depth to zero by recursing into itself.
    add_rule(
        tasks,
        "total",
        TypeId::of::<Total>(),
        vec![TypeId::of::<Depth>()],
        vec![(TypeId::of::<Total>(), vec![TypeId::of::<Depth>()])],
        move |context, args| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let depth = args[0].extract::<Depth>()?.0;
                if depth == 0 {
                    return Ok(Value::new(Total(0)));
                }
                let get = Get::new(TypeId::of::<Total>(), vec![Value::new(Depth(depth - 1))]);
                let total = context.get(get).await?;
                Ok(Value::new(Total(total.extract::<Total>()?.0 + depth)))
            }
        },
    );
}

#[tokio::test]
async fn recursive_rules() {
    let _logger = env_logger::try_init();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut tasks = Tasks::new();
    add_total_rule(&mut tasks, counter.clone());
    tasks.query_add(TypeId::of::<Total>(), vec![TypeId::of::<Depth>()]);
    let engine = TestEngine::new(tasks);

    let result = engine
        .run_one(vec![Value::new(Depth(4))], TypeId::of::<Total>())
        .await;
    assert_eq!(result, Ok(Value::new(Total(10))));
    assert_eq!(counter.load(Ordering::SeqCst), 5);

    // The smaller depths are already memoized.
    let result = engine
        .run_one(vec![Value::new(Depth(5))], TypeId::of::<Total>())
        .await;
    assert_eq!(result, Ok(Value::new(Total(15))));
    assert_eq!(counter.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn cycles_are_detected() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_rule(
        &mut tasks,
        "ouroboros",
        TypeId::of::<Total>(),
        vec![TypeId::of::<Depth>()],
        vec![(TypeId::of::<Total>(), vec![TypeId::of::<Depth>()])],
        |context, args| async move {
            // Requests itself, with an identical param.
            let get = Get::new(TypeId::of::<Total>(), vec![args[0].clone()]);
            context.get(get).await
        },
    );
    tasks.query_add(TypeId::of::<Total>(), vec![TypeId::of::<Depth>()]);
    let engine = TestEngine::new(tasks);

    let result = engine
        .run_one(vec![Value::new(Depth(1))], TypeId::of::<Total>())
        .await;
    assert_eq!(
        result.as_ref().err().and_then(|f| f.throw_kind()),
        Some(ThrowKind::Cycle)
    );
    assert!(throw_message(&result).starts_with("The dependency graph contained a cycle:"));
}

#[tokio::test]
async fn uncacheable_rules_rerun_per_run_id() {
    let _logger = env_logger::try_init();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut tasks = Tasks::new();
    {
        let counter = counter.clone();
        tasks.task_begin(
            Function::new("tick", move |_, _| {
                let counter = counter.clone();
                async move { Ok(Value::new(Tick(counter.fetch_add(1, Ordering::SeqCst)))) }
            }),
            TypeId::of::<Tick>(),
            false,
            None,
            Level::Debug,
        );
        tasks.task_end();
    }
    tasks.query_add(TypeId::of::<Tick>(), vec![]);
    let engine = TestEngine::new(tasks);

    assert_eq!(
        engine.run_one(vec![], TypeId::of::<Tick>()).await,
        Ok(Value::new(Tick(0)))
    );
    assert_eq!(
        engine.run_one(vec![], TypeId::of::<Tick>()).await,
        Ok(Value::new(Tick(0)))
    );

    engine.session.new_run_id();
    assert_eq!(
        engine.run_one(vec![], TypeId::of::<Tick>()).await,
        Ok(Value::new(Tick(1)))
    );
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn session_values_and_run_id() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    tasks.query_add(TypeId::of::<SessionValues>(), vec![]);
    tasks.query_add(TypeId::of::<BuildRunId>(), vec![]);
    let engine = TestEngine::new(tasks);

    let values = engine
        .run_one(vec![], TypeId::of::<SessionValues>())
        .await
        .unwrap();
    assert_eq!(
        values.extract::<SessionValues>().unwrap(),
        &SessionValues(Value::new(()))
    );

    let run_id = engine.session.run_id().0;
    let observed = engine
        .run_one(vec![], TypeId::of::<BuildRunId>())
        .await
        .unwrap();
    assert_eq!(observed, Value::new(BuildRunId(run_id)));

    engine.session.new_run_id();
    let observed = engine
        .run_one(vec![], TypeId::of::<BuildRunId>())
        .await
        .unwrap();
    assert_eq!(observed, Value::new(BuildRunId(engine.session.run_id().0)));
    assert_ne!(engine.session.run_id().0, run_id);
}

#[tokio::test]
async fn singletons() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    tasks.singleton_add(Value::new(Config(3)));
    add_rule(
        &mut tasks,
        "scale",
        TypeId::of::<Scaled>(),
        vec![TypeId::of::<Config>()],
        vec![],
        |_, args| async move {
            let config = args[0].extract::<Config>()?;
            Ok(Value::new(Scaled(config.0 * 2)))
        },
    );
    tasks.query_add(TypeId::of::<Scaled>(), vec![]);
    let engine = TestEngine::new(tasks);

    assert_eq!(
        engine.run_one(vec![], TypeId::of::<Scaled>()).await,
        Ok(Value::new(Scaled(6)))
    );
}

#[tokio::test]
async fn union_products() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    tasks.task_begin(
        Function::new("pick", |_, _| async move { Ok(Value::new(Banana(7))) }),
        TypeId::of::<Fruit>(),
        true,
        None,
        Level::Debug,
    );
    tasks.add_union_product(TypeId::of::<Banana>());
    tasks.task_end();
    tasks.query_add(TypeId::of::<Banana>(), vec![]);
    let engine = TestEngine::new(tasks);

    assert_eq!(
        engine.run_one(vec![], TypeId::of::<Banana>()).await,
        Ok(Value::new(Banana(7)))
    );
    let rule_index = &engine.scheduler.core.rule_index;
    assert_eq!(rule_index.rules_for(TypeId::of::<Banana>()).len(), 1);
    assert_eq!(rule_index.rules_for(TypeId::of::<Fruit>()).len(), 1);
}

#[tokio::test]
async fn root_types_provide_queries() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    tasks.root_type_add(TypeId::of::<Name>());
    let engine = TestEngine::new(tasks);
    assert!(engine
        .scheduler
        .core
        .rule_index
        .roots()
        .contains(&TypeId::of::<Name>()));

    assert_eq!(
        engine
            .run_one(vec![name("root")], TypeId::of::<Greeting>())
            .await,
        Ok(greeting("Hello, root!"))
    );
}

#[tokio::test]
async fn root_select_errors() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let engine = TestEngine::new(tasks);
    let mut request = ExecutionRequest::new();

    let err = engine
        .scheduler
        .add_root_select(
            &mut request,
            vec![name("a"), name("b")],
            TypeId::of::<Greeting>(),
        )
        .unwrap_err();
    assert!(err.contains("must have distinct types"), "{err}");

    let err = engine
        .scheduler
        .add_root_select(&mut request, vec![name("a")], TypeId::of::<Total>())
        .unwrap_err();
    assert!(err.contains("No installed QueryRules return the type Total"), "{err}");
    assert!(request.roots.is_empty());
}

#[test]
fn undecorated_functions_are_rejected() {
    let mut tasks = Tasks::new();
    tasks.entry_add(RuleEntry::Function {
        name: "helper".to_owned(),
        rule: None,
    });
    let err = RuleIndex::create(tasks.entries()).err().unwrap();
    assert_eq!(
        err,
        "TypeError: Expected function `helper` to be decorated with @rule"
    );
}

#[test]
fn ambiguous_rules_are_rejected() {
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    add_rule(
        &mut tasks,
        "greet_differently",
        TypeId::of::<Greeting>(),
        vec![TypeId::of::<Name>()],
        vec![],
        |_, _| async move { Ok(greeting("Hi.")) },
    );
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);

    let err = RuleIndex::create(tasks.entries()).err().unwrap();
    assert!(err.starts_with("Rules with errors: "), "{err}");
    assert!(err.contains("Ambiguous rules to compute Greeting"), "{err}");
}

#[test]
fn missing_providers_are_rejected() {
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    tasks.query_add(TypeId::of::<Greeting>(), vec![]);

    let err = RuleIndex::create(tasks.entries()).err().unwrap();
    assert!(err.contains("No source of dependency Name"), "{err}");
}

#[test]
fn duplicate_rules_are_deduplicated() {
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    add_greet_rule(&mut tasks, Arc::default());
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);

    let rule_index = RuleIndex::create(tasks.entries()).unwrap();
    assert_eq!(rule_index.rules_for(TypeId::of::<Greeting>()).len(), 1);
    assert_eq!(rule_index.queries().len(), 1);
}

///
/// Counts the lines of a file, recording how many times it ran for each path.
///
fn add_line_count_rule(tasks: &mut Tasks, runs: Arc<Mutex<Vec<PathBuf>>>) {
    add_rule(
        tasks,
        "count_lines",
        TypeId::of::<LineCount>(),
        vec![TypeId::of::<FileContent>()],
        vec![],
        move |_, args| {
            let runs = runs.clone();
            async move {
                let content = args[0].extract::<FileContent>()?;
                runs.lock().push(content.path.clone());
                Ok(Value::new(LineCount(
                    content.content.iter().filter(|b| **b == b'\n').count(),
                )))
            }
        },
    );
    tasks.query_add(
        TypeId::of::<LineCount>(),
        vec![TypeId::of::<ReadFileRequest>()],
    );
}

fn runs_for(runs: &Mutex<Vec<PathBuf>>, path: &str) -> usize {
    runs.lock().iter().filter(|p| *p == Path::new(path)).count()
}

fn line_count_roots(paths: &[&str]) -> Vec<(Vec<Value>, TypeId)> {
    paths
        .iter()
        .map(|p| {
            (
                vec![Value::new(ReadFileRequest::new(*p))],
                TypeId::of::<LineCount>(),
            )
        })
        .collect()
}

#[tokio::test]
async fn invalidation_is_precise() {
    let _logger = env_logger::try_init();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Tasks::new();
    add_line_count_rule(&mut tasks, runs.clone());
    let engine = TestEngine::new(tasks);
    engine.write_file("a.txt", "one\n");
    engine.write_file("b.txt", "one\ntwo\n");

    let results = engine.run(line_count_roots(&["a.txt", "b.txt"])).await;
    assert_eq!(
        results,
        vec![Ok(Value::new(LineCount(1))), Ok(Value::new(LineCount(2)))]
    );

    engine.write_file("a.txt", "one\ntwo\nthree\n");
    let invalidated = engine
        .scheduler
        .invalidate_files(&hashset! {PathBuf::from("a.txt")});
    assert!(invalidated > 0);

    let results = engine.run(line_count_roots(&["a.txt", "b.txt"])).await;
    assert_eq!(
        results,
        vec![Ok(Value::new(LineCount(3))), Ok(Value::new(LineCount(2)))]
    );
    assert_eq!(runs_for(&runs, "a.txt"), 2);
    assert_eq!(runs_for(&runs, "b.txt"), 1);

    // Paths which no Node has read invalidate nothing.
    let invalidated = engine
        .scheduler
        .invalidate_files(&hashset! {PathBuf::from("unrelated/c.txt")});
    assert_eq!(invalidated, 0);
}

#[tokio::test]
async fn file_paths_are_normalized() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_line_count_rule(&mut tasks, Arc::default());
    let engine = TestEngine::new(tasks);
    std::fs::create_dir(engine.build_root.path().join("sub")).unwrap();
    engine.write_file("a.txt", "one\n");

    let results = engine.run(line_count_roots(&["./a.txt", "sub/../a.txt"])).await;
    assert_eq!(
        results,
        vec![Ok(Value::new(LineCount(1))), Ok(Value::new(LineCount(1)))]
    );
    // Both spellings of the path share one read.
    assert_eq!(engine.metric("file_reads"), 1);

    engine.write_file("a.txt", "one\ntwo\n");
    let invalidated = engine
        .scheduler
        .invalidate_files(&hashset! {PathBuf::from("a.txt")});
    assert!(invalidated > 0);
    let results = engine.run(line_count_roots(&["./a.txt", "sub/../a.txt"])).await;
    assert_eq!(
        results,
        vec![Ok(Value::new(LineCount(2))), Ok(Value::new(LineCount(2)))]
    );

    let results = engine
        .run(line_count_roots(&["../outside.txt", "/etc/hosts"]))
        .await;
    assert!(throw_message(&results[0]).contains("escape the root"));
    assert!(throw_message(&results[1]).contains("Absolute paths are not allowed"));
}

#[tokio::test]
async fn unchanged_files_clean_their_dependents() {
    let _logger = env_logger::try_init();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Tasks::new();
    add_line_count_rule(&mut tasks, runs.clone());
    let engine = TestEngine::new(tasks);
    engine.write_file("a.txt", "one\n");

    engine.run(line_count_roots(&["a.txt"])).await;
    assert!(engine.scheduler.invalidate_all_files() > 0);
    let results = engine.run(line_count_roots(&["a.txt"])).await;

    assert_eq!(results, vec![Ok(Value::new(LineCount(1)))]);
    assert_eq!(runs_for(&runs, "a.txt"), 1);
    assert_eq!(engine.metric("file_reads"), 2);
}

#[tokio::test]
async fn invalidate_all_clears_the_graph() {
    let _logger = env_logger::try_init();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Tasks::new();
    add_line_count_rule(&mut tasks, runs.clone());
    let engine = TestEngine::new(tasks);
    engine.write_file("a.txt", "one\n");

    engine.run(line_count_roots(&["a.txt"])).await;
    assert!(engine.scheduler.graph_len() > 0);
    engine.scheduler.invalidate_all();
    assert_eq!(engine.scheduler.graph_len(), 0);

    engine.run(line_count_roots(&["a.txt"])).await;
    assert_eq!(runs_for(&runs, "a.txt"), 2);
}

#[tokio::test]
async fn scandir() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    tasks.query_add(
        TypeId::of::<DirectoryListing>(),
        vec![TypeId::of::<ScandirRequest>()],
    );
    let engine = TestEngine::new(tasks);
    engine.write_file("b.txt", "");
    engine.write_file("a.txt", "");
    std::fs::create_dir(engine.build_root.path().join("sub")).unwrap();

    let listing = engine
        .run_one(
            vec![Value::new(ScandirRequest::new(""))],
            TypeId::of::<DirectoryListing>(),
        )
        .await
        .unwrap();
    assert_eq!(
        listing.extract::<DirectoryListing>().unwrap(),
        &DirectoryListing(vec![
            Stat::File(PathBuf::from("a.txt")),
            Stat::File(PathBuf::from("b.txt")),
            Stat::Dir(PathBuf::from("sub")),
        ])
    );

    // Creating a file invalidates the listing of its parent directory.
    engine.write_file("c.txt", "");
    engine
        .scheduler
        .invalidate_files(&hashset! {PathBuf::from("c.txt")});
    let listing = engine
        .run_one(
            vec![Value::new(ScandirRequest::new(""))],
            TypeId::of::<DirectoryListing>(),
        )
        .await
        .unwrap();
    let listing = listing.extract::<DirectoryListing>().unwrap();
    assert_eq!(
        listing.paths().collect::<Vec<_>>(),
        vec![
            Path::new("a.txt"),
            Path::new("b.txt"),
            Path::new("c.txt"),
            Path::new("sub"),
        ]
    );
}

#[tokio::test]
async fn read_missing_file() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    tasks.query_add(
        TypeId::of::<FileContent>(),
        vec![TypeId::of::<ReadFileRequest>()],
    );
    let engine = TestEngine::new(tasks);

    let result = engine
        .run_one(
            vec![Value::new(ReadFileRequest::new("missing.txt"))],
            TypeId::of::<FileContent>(),
        )
        .await;
    assert!(throw_message(&result).starts_with("Failed to read file"));
}

#[tokio::test]
async fn invalidation_globs() {
    let _logger = env_logger::try_init();
    let options = ExecutionOptions {
        invalidation_globs: vec!["*.toml".to_owned()],
        ..ExecutionOptions::default()
    };
    let engine = TestEngine::with_options(Tasks::new(), options);

    let paths = hashset! {PathBuf::from("pants.toml"), PathBuf::from("a.txt")};
    assert_eq!(
        engine.scheduler.matching_invalidation_globs(&paths),
        vec![PathBuf::from("pants.toml")]
    );

    assert!(!engine.scheduler.invalidation_globs_triggered());
    engine
        .scheduler
        .invalidate_files(&hashset! {PathBuf::from("a.txt")});
    assert!(!engine.scheduler.invalidation_globs_triggered());
    engine
        .scheduler
        .invalidate_files(&hashset! {PathBuf::from("pants.toml")});
    assert!(engine.scheduler.invalidation_globs_triggered());
}

#[tokio::test]
async fn watched_files_invalidate_their_readers() {
    let _logger = env_logger::try_init();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Tasks::new();
    add_line_count_rule(&mut tasks, runs.clone());
    let options = ExecutionOptions {
        watch_filesystem: true,
        invalidation_globs: vec!["*.txt".to_owned()],
        ..ExecutionOptions::default()
    };
    let engine = TestEngine::with_options(tasks, options);
    engine.write_file("a.txt", "one\n");

    let results = engine.run(line_count_roots(&["a.txt"])).await;
    assert_eq!(results, vec![Ok(Value::new(LineCount(1)))]);

    // Only the watcher invalidates: wait for it to notice the change.
    engine.write_file("a.txt", "one\ntwo\n");
    let mut results = vec![];
    for _ in 0..100 {
        results = engine.run(line_count_roots(&["a.txt"])).await;
        if results == vec![Ok(Value::new(LineCount(2)))] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(results, vec![Ok(Value::new(LineCount(2)))]);
    assert!(runs_for(&runs, "a.txt") >= 2);
    assert!(engine.scheduler.invalidation_globs_triggered());
}

#[test]
fn invalid_invalidation_globs() {
    let executor = Executor::new_owned(1, 2).unwrap();
    let rule_index = RuleIndex::create(vec![]).unwrap();
    let options = ExecutionOptions {
        invalidation_globs: vec!["[".to_owned()],
        ..ExecutionOptions::default()
    };
    let err = Core::new(executor.clone(), rule_index, PathBuf::from("."), options)
        .err()
        .unwrap();
    assert!(err.starts_with("Invalid invalidation glob `[`"), "{err}");
    executor.shutdown(Duration::from_secs(1));
}

fn never_completing_rule(tasks: &mut Tasks) {
    add_rule(
        tasks,
        "wait_forever",
        TypeId::of::<Greeting>(),
        vec![TypeId::of::<Name>()],
        vec![],
        |_, _| async move {
            futures::future::pending::<()>().await;
            Ok(greeting("unreachable"))
        },
    );
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
}

#[tokio::test]
async fn cancelled_sessions_exit() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    never_completing_rule(&mut tasks);
    let engine = TestEngine::new(tasks);

    let request = engine.request(vec![(vec![name("x")], TypeId::of::<Greeting>())]);
    assert!(!engine.session.is_cancelled());
    engine.session.cancel();
    assert!(engine.session.is_cancelled());
    assert_eq!(
        engine.scheduler.run(&request, &engine.session).await,
        Err(ExecutionTermination::KeyboardInterrupt)
    );

    // An isolated clone of the Session is not cancelled.
    let clone = engine.session.isolated_shallow_clone("isolated".to_owned());
    assert!(!clone.is_cancelled());
    assert_eq!(clone.build_id(), "isolated");
    assert_eq!(engine.session.build_id(), "test_build");
    assert_eq!(clone.run_id(), engine.session.run_id());
}

#[tokio::test]
async fn cancelled_sessions_do_not_observe_memoized_results() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let engine = TestEngine::new(tasks);

    let request = engine.request(vec![(vec![name("x")], TypeId::of::<Greeting>())]);
    assert_eq!(
        engine.scheduler.run(&request, &engine.session).await,
        Ok(vec![Ok(greeting("Hello, x!"))])
    );
    engine.session.cancel();
    for _ in 0..10 {
        assert_eq!(
            engine.scheduler.run(&request, &engine.session).await,
            Err(ExecutionTermination::KeyboardInterrupt)
        );
    }
}

#[tokio::test]
async fn cancelling_one_session_leaves_shared_work_running() {
    let _logger = env_logger::try_init();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut tasks = Tasks::new();
    {
        let counter = counter.clone();
        add_rule(
            &mut tasks,
            "greet_slowly",
            TypeId::of::<Greeting>(),
            vec![TypeId::of::<Name>()],
            vec![],
            move |_, args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let name = args[0].extract::<Name>()?.0.clone();
                    Ok(greeting(&name))
                }
            },
        );
    }
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let engine = TestEngine::new(tasks);
    let other_session = Session::new(
        &engine.scheduler,
        "other_build".to_owned(),
        Value::new(()),
        AsyncLatch::new(),
    );

    let request = engine.request(vec![(vec![name("x")], TypeId::of::<Greeting>())]);
    let cancel_first = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.session.cancel();
    };
    let (first, second, ()) = tokio::join!(
        engine.scheduler.run(&request, &engine.session),
        engine.scheduler.run(&request, &other_session),
        cancel_first,
    );

    assert_eq!(first, Err(ExecutionTermination::KeyboardInterrupt));
    assert_eq!(second, Ok(vec![Ok(greeting("x"))]));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_timeouts() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    never_completing_rule(&mut tasks);
    let engine = TestEngine::new(tasks);

    let mut request = engine.request(vec![(vec![name("x")], TypeId::of::<Greeting>())]);
    request.timeout = Some(Duration::from_millis(50));
    assert_eq!(
        engine.scheduler.run(&request, &engine.session).await,
        Err(ExecutionTermination::PollTimeout)
    );
}

#[tokio::test]
async fn workunits_are_recorded() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let options = ExecutionOptions {
        workunit_level: Level::Debug,
        ..ExecutionOptions::default()
    };
    let engine = TestEngine::with_options(tasks, options);

    engine
        .run_one(vec![name("x")], TypeId::of::<Greeting>())
        .await
        .unwrap();
    let (_started, completed) = engine.session.poll_workunits(Level::Debug);
    assert!(completed.iter().any(|w| w.name == "greet"));
    assert_eq!(engine.metric("rule_executions"), 1);
}

#[cfg(unix)]
fn process_tasks() -> Tasks {
    let mut tasks = Tasks::new();
    tasks.query_add(
        TypeId::of::<ProcessResult>(),
        vec![TypeId::of::<Process>()],
    );
    tasks
}

#[cfg(unix)]
fn shell(script: &str) -> Process {
    Process::new(vec![
        "/bin/sh".to_owned(),
        "-c".to_owned(),
        script.to_owned(),
    ])
    .env(btreemap! {"PATH".to_owned() => "/usr/bin:/bin".to_owned()})
    .description(format!("Run `{script}`"))
}

#[cfg(unix)]
#[tokio::test]
async fn process_execution() {
    let _logger = env_logger::try_init();
    let engine = TestEngine::new(process_tasks());

    let result = engine
        .run_one(
            vec![Value::new(shell("echo hello; echo oops >&2; exit 3"))],
            TypeId::of::<ProcessResult>(),
        )
        .await
        .unwrap();
    let result = result.extract::<ProcessResult>().unwrap();
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout.as_ref(), b"hello\n");
    assert_eq!(result.stderr.as_ref(), b"oops\n");
    assert_eq!(engine.metric("local_process_execution_failures"), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn process_working_directory() {
    let _logger = env_logger::try_init();
    let engine = TestEngine::new(process_tasks());
    std::fs::create_dir(engine.build_root.path().join("sub")).unwrap();
    engine.write_file("sub/inner.txt", "");
    engine.write_file("outer.txt", "");

    let process = shell("echo *")
        .working_directory(Some(RelativePath::new("./other/../sub").unwrap()));
    let result = engine
        .run_one(vec![Value::new(process)], TypeId::of::<ProcessResult>())
        .await
        .unwrap();
    assert_eq!(
        result.extract::<ProcessResult>().unwrap().stdout.as_ref(),
        b"inner.txt\n"
    );
}

#[test]
fn relative_paths() {
    assert_eq!(
        RelativePath::new("a/./b/../c").unwrap().as_ref(),
        Path::new("a/c")
    );
    assert!(RelativePath::new("/abs").is_err());
    assert!(RelativePath::new("a/../../escape").is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn process_timeout() {
    let _logger = env_logger::try_init();
    let engine = TestEngine::new(process_tasks());

    let process = shell("sleep 10").timeout(Some(Duration::from_millis(100)));
    let result = engine
        .run_one(vec![Value::new(process)], TypeId::of::<ProcessResult>())
        .await;
    assert_eq!(
        result.as_ref().err().and_then(|f| f.throw_kind()),
        Some(ThrowKind::Timeout)
    );
    assert!(throw_message(&result).contains("Exceeded timeout of 0.1 seconds"));
    assert_eq!(engine.metric("local_process_execution_timeouts"), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn process_cache_scopes() {
    let _logger = env_logger::try_init();
    let engine = TestEngine::new(process_tasks());
    let run_in_new_run = |process: Process| {
        engine.session.new_run_id();
        engine.run_one(vec![Value::new(process)], TypeId::of::<ProcessResult>())
    };

    // Successful: only a zero exit code is memoized across runs.
    run_in_new_run(shell("exit 0")).await.unwrap();
    run_in_new_run(shell("exit 0")).await.unwrap();
    assert_eq!(engine.metric("local_process_execution_requests"), 1);
    run_in_new_run(shell("exit 1")).await.unwrap();
    run_in_new_run(shell("exit 1")).await.unwrap();
    assert_eq!(engine.metric("local_process_execution_requests"), 3);

    // Always: memoized regardless of the exit code.
    let always = || shell("exit 2").cache_scope(ProcessCacheScope::Always);
    run_in_new_run(always()).await.unwrap();
    run_in_new_run(always()).await.unwrap();
    assert_eq!(engine.metric("local_process_execution_requests"), 4);

    // PerSession: re-run for every run.
    let per_session = || shell("exit 0").cache_scope(ProcessCacheScope::PerSession);
    run_in_new_run(per_session()).await.unwrap();
    run_in_new_run(per_session()).await.unwrap();
    assert_eq!(engine.metric("local_process_execution_requests"), 6);
}

#[cfg(unix)]
#[tokio::test]
async fn process_parallelism_is_bounded() {
    let _logger = env_logger::try_init();
    let options = ExecutionOptions {
        process_parallelism: 1,
        ..ExecutionOptions::default()
    };
    let engine = TestEngine::with_options(process_tasks(), options);
    assert_eq!(engine.scheduler.core.process_semaphore.available_permits(), 1);

    let results = engine
        .run(
            (0..3)
                .map(|i| {
                    (
                        vec![Value::new(shell(&format!("echo {i}")))],
                        TypeId::of::<ProcessResult>(),
                    )
                })
                .collect(),
        )
        .await;
    for (i, result) in results.into_iter().enumerate() {
        let result = result.unwrap();
        let result = result.extract::<ProcessResult>().unwrap();
        assert_eq!(result.stdout.as_ref(), format!("{i}\n").as_bytes());
    }
    assert_eq!(engine.scheduler.core.process_semaphore.available_permits(), 1);
}

#[test]
fn params_reject_duplicate_types() {
    let interns = crate::interning::Interns::new();
    let err = crate::values::Params::new(vec![
        interns.key_insert(name("a")),
        interns.key_insert(name("b")),
    ])
    .unwrap_err();
    assert!(err.starts_with("Values used as `Params` must have distinct types"));

    // Structurally equal values intern to the same Key.
    assert_eq!(interns.key_insert(name("a")), interns.key_insert(name("a")));
    assert_eq!(interns.len(), 2);
}

#[test]
fn invalidated_failures_are_not_throws() {
    let failure = Failure::Invalidated.with_pushed_frame("frame", None);
    assert_eq!(failure, Failure::Invalidated);
    assert_eq!(failure.throw_kind(), None);
    assert!(failure.engine_traceback().is_empty());
}

#[tokio::test]
async fn visualize() {
    let _logger = env_logger::try_init();
    let mut tasks = Tasks::new();
    add_greet_rule(&mut tasks, Arc::default());
    tasks.query_add(TypeId::of::<Greeting>(), vec![TypeId::of::<Name>()]);
    let engine = TestEngine::new(tasks);
    engine
        .run_one(vec![name("x")], TypeId::of::<Greeting>())
        .await
        .unwrap();

    let dot = engine.build_root.path().join("graph.dot");
    engine.scheduler.visualize(&engine.session, &dot).unwrap();
    let rendered = std::fs::read_to_string(&dot).unwrap();
    assert!(rendered.contains("@rule(greet("), "{rendered}");

    let rule_dot = engine.build_root.path().join("rule_graph.dot");
    engine.scheduler.visualize_rule_graph(&rule_dot).unwrap();
    let rendered = std::fs::read_to_string(&rule_dot).unwrap();
    assert!(rendered.contains("greet("), "{rendered}");
}
