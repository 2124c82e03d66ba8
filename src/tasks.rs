// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use internment::Intern;
use log::Level;
use rule_graph::{DependencyKey, DisplayForGraph, DisplayForGraphArgs, Palette, Query};

use crate::nodes::TaskContext;
use crate::rules::RuleEntry;
use crate::values::{NodeResult, TypeId, Value};

type TaskFn =
    Arc<dyn Fn(TaskContext, Vec<Value>) -> BoxFuture<'static, NodeResult<Value>> + Send + Sync>;

///
/// The body of a rule: an async function of the rule's positional inputs, which may request
/// further values via its `TaskContext`.
///
/// Functions are identified by their canonical name: two Functions with the same name are
/// considered to be the same rule body.
///
#[derive(Clone, Derivative)]
#[derivative(Eq, PartialEq, Hash)]
pub struct Function {
    pub name: String,
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    func: TaskFn,
}

impl Function {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Function
    where
        F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NodeResult<Value>> + Send + 'static,
    {
        Function {
            name: name.into(),
            func: Arc::new(move |context, args| func(context, args).boxed()),
        }
    }

    pub(crate) fn call(
        &self,
        context: TaskContext,
        args: Vec<Value>,
    ) -> BoxFuture<'static, NodeResult<Value>> {
        (self.func)(context, args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}()", self.name)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DisplayInfo {
    pub name: String,
    pub desc: Option<String>,
    pub level: Level,
}

///
/// A rule: a Function, the product(s) that it computes, its positional inputs ("clause"), and the
/// Gets that its body may request.
///
/// The identity of a Task is its function, products, clause and gets: registering an identical
/// Task twice results in a single rule.
///
#[derive(Clone, Debug, Derivative)]
#[derivative(Eq, PartialEq, Hash)]
pub struct Task {
    pub product: TypeId,
    pub union_products: Vec<TypeId>,
    pub clause: Vec<DependencyKey<TypeId>>,
    pub gets: Vec<DependencyKey<TypeId>>,
    pub func: Function,
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    pub cacheable: bool,
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    pub display_info: DisplayInfo,
}

impl Task {
    ///
    /// The primary product of this Task, followed by any union products.
    ///
    pub fn products(&self) -> Vec<TypeId> {
        std::iter::once(self.product)
            .chain(self.union_products.iter().cloned())
            .collect()
    }
}

///
/// A rule which is implemented by the engine itself, rather than by a registered Function.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Intrinsic {
    pub name: &'static str,
    pub product: TypeId,
    pub inputs: Vec<DependencyKey<TypeId>>,
}

impl Intrinsic {
    pub fn new(name: &'static str, product: TypeId, input: TypeId) -> Self {
        Self {
            name,
            product,
            inputs: vec![DependencyKey::new(input)],
        }
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub enum Rule {
    // Intern the Task to avoid deep clones.
    Task(Intern<Task>),
    Intrinsic(Intern<Intrinsic>),
}

impl DisplayForGraph for Rule {
    fn fmt_for_graph(&self, display_args: DisplayForGraphArgs) -> String {
        match self {
            Rule::Task(ref task) => {
                let task_name = &task.func.name;
                let product = format!("{}", task.product);

                let clause_portion = Self::formatted_select_clause(&task.clause, display_args);

                let get_clauses = task
                    .gets
                    .iter()
                    .map(::std::string::ToString::to_string)
                    .collect::<Vec<_>>();

                let get_portion = if get_clauses.is_empty() {
                    "".to_string()
                } else if get_clauses.len() > 1 {
                    format!(
                        ",{}gets=[{}{}{}]",
                        display_args.line_separator(),
                        display_args.optional_line_separator(),
                        get_clauses.join(&format!(",{}", display_args.line_separator())),
                        display_args.optional_line_separator(),
                    )
                } else {
                    format!(", gets=[{}]", get_clauses.join(", "))
                };

                let rule_type = if task.cacheable {
                    "rule".to_string()
                } else {
                    "uncacheable_rule".to_string()
                };

                format!(
                    "@{}({}({}) -> {}{})",
                    rule_type, task_name, clause_portion, product, get_portion,
                )
            }
            Rule::Intrinsic(ref intrinsic) => format!(
                "@rule(<intrinsic>({}) -> {})",
                Self::formatted_select_clause(&intrinsic.inputs, display_args),
                intrinsic.product,
            ),
        }
    }
}

impl rule_graph::Rule for Rule {
    type TypeId = TypeId;

    fn products(&self) -> Vec<TypeId> {
        match self {
            Rule::Task(t) => t.products(),
            Rule::Intrinsic(i) => vec![i.product],
        }
    }

    fn dependency_keys(&self) -> Vec<&DependencyKey<Self::TypeId>> {
        match self {
            Rule::Task(ref task) => task.clause.iter().chain(task.gets.iter()).collect(),
            Rule::Intrinsic(ref intrinsic) => intrinsic.inputs.iter().collect(),
        }
    }

    fn require_reachable(&self) -> bool {
        match self {
            Rule::Task(_) => true,
            Rule::Intrinsic(_) => false,
        }
    }

    fn color(&self) -> Option<Palette> {
        match self {
            Rule::Task(_) => None,
            Rule::Intrinsic(_) => Some(Palette::Gray),
        }
    }
}

impl Rule {
    fn formatted_select_clause(
        clause: &[DependencyKey<TypeId>],
        display_args: DisplayForGraphArgs,
    ) -> String {
        let select_clauses = clause
            .iter()
            .map(|t| t.product().to_string())
            .collect::<Vec<_>>();

        if select_clauses.len() > 1 {
            format!(
                "{}{}{}",
                display_args.optional_line_separator(),
                select_clauses.join(&format!(",{}", display_args.line_separator())),
                display_args.optional_line_separator(),
            )
        } else {
            select_clauses.join(", ")
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            self.fmt_for_graph(DisplayForGraphArgs { multiline: false })
        )
    }
}

///
/// Registry of tasks able to produce each type, along with the singletons, root types and
/// queries which make up a complete set of rules.
///
/// Defines a stateful lifecycle for defining tasks. Call in order:
///   1. task_begin() - once per task
///   2. add_*() - zero or more times per task to add input clauses
///   3. task_end() - once per task
///
/// Singletons, queries and root types may be added at any point outside of a task definition.
///
#[derive(Default)]
pub struct Tasks {
    entries: Vec<RuleEntry>,
    // Used during the construction of a Task.
    preparing: Option<Task>,
}

impl Tasks {
    pub fn new() -> Tasks {
        Tasks::default()
    }

    pub fn task_begin(
        &mut self,
        func: Function,
        product: TypeId,
        cacheable: bool,
        desc: Option<String>,
        level: Level,
    ) {
        assert!(
            self.preparing.is_none(),
            "Must `end()` the previous task creation before beginning a new one!"
        );

        let name = func.name.clone();
        self.preparing = Some(Task {
            product,
            union_products: Vec::new(),
            clause: Vec::new(),
            gets: Vec::new(),
            func,
            cacheable,
            display_info: DisplayInfo { name, desc, level },
        });
    }

    pub fn add_union_product(&mut self, product: TypeId) {
        self.preparing_mut().union_products.push(product);
    }

    pub fn add_select(&mut self, product: TypeId) {
        self.preparing_mut().clause.push(DependencyKey::new(product));
    }

    pub fn add_get(&mut self, output: TypeId, inputs: Vec<TypeId>) {
        self.preparing_mut()
            .gets
            .push(DependencyKey::new_with_params(output, inputs));
    }

    fn preparing_mut(&mut self) -> &mut Task {
        self.preparing
            .as_mut()
            .expect("Must `begin()` a task creation before adding clauses!")
    }

    pub fn task_end(&mut self) {
        // Move the task from `preparing` to the entries.
        let task = self
            .preparing
            .take()
            .expect("Must `begin()` a task creation before ending it!");
        self.entries.push(RuleEntry::Task(task));
    }

    pub fn singleton_add(&mut self, value: Value) {
        self.entries.push(RuleEntry::Singleton(value));
    }

    pub fn query_add(&mut self, product: TypeId, params: Vec<TypeId>) {
        self.entries
            .push(RuleEntry::Query(Query::new(product, params)));
    }

    pub fn root_type_add(&mut self, type_id: TypeId) {
        self.entries.push(RuleEntry::Root(type_id));
    }

    ///
    /// Adds an arbitrary entry: used for registering functions which may not have been declared
    /// as rules.
    ///
    pub fn entry_add(&mut self, entry: RuleEntry) {
        self.entries.push(entry);
    }

    pub fn entries(self) -> Vec<RuleEntry> {
        assert!(
            self.preparing.is_none(),
            "Must `end()` the previous task creation before collecting entries!"
        );
        self.entries
    }
}
