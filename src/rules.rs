// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;

use indexmap::{IndexMap, IndexSet};
use internment::Intern;
use log::{debug, Level};
use rule_graph::{Query, RuleGraph};

use crate::intrinsics::Intrinsics;
use crate::tasks::{DisplayInfo, Function, Rule, Task};
use crate::values::{TypeId, Value};

///
/// One registration in a set of rules.
///
#[derive(Clone, Debug)]
pub enum RuleEntry {
    ///
    /// A function which was registered as a rule. If no rule declaration was attached to it (its
    /// products, inputs and Gets), the rule set is invalid.
    ///
    Function { name: String, rule: Option<Task> },
    Task(Task),
    /// A constant value, which becomes a rule without inputs that computes its type.
    Singleton(Value),
    /// A type that may be supplied directly by callers as a param.
    Root(TypeId),
    Query(Query<TypeId>),
}

///
/// An immutable and validated index of a set of rules.
///
/// Task rules are indexed under their product, and under each of their union products.
///
pub struct RuleIndex {
    rules: IndexMap<TypeId, Vec<Intern<Task>>>,
    roots: BTreeSet<TypeId>,
    queries: Vec<Query<TypeId>>,
    intrinsics: Intrinsics,
    rule_graph: RuleGraph<Rule>,
}

impl RuleIndex {
    ///
    /// Validates the given entries and solves their RuleGraph. Fails if any entry is malformed,
    /// or if the rules are ambiguous, unsatisfiable, or unreachable.
    ///
    pub fn create(rule_entries: Vec<RuleEntry>) -> Result<RuleIndex, String> {
        let mut tasks: IndexSet<Intern<Task>> = IndexSet::new();
        let mut roots = BTreeSet::new();
        let mut queries: IndexSet<Query<TypeId>> = IndexSet::new();

        for entry in rule_entries {
            match entry {
                RuleEntry::Function { name, rule: None } => {
                    return Err(format!(
                        "TypeError: Expected function `{name}` to be decorated with @rule"
                    ));
                }
                RuleEntry::Function {
                    rule: Some(task), ..
                }
                | RuleEntry::Task(task) => {
                    tasks.insert(Intern::new(task));
                }
                RuleEntry::Singleton(value) => {
                    tasks.insert(Intern::new(singleton_task(value)));
                }
                RuleEntry::Root(type_id) => {
                    roots.insert(type_id);
                }
                RuleEntry::Query(query) => {
                    queries.insert(query);
                }
            }
        }

        let mut rules: IndexMap<TypeId, Vec<Intern<Task>>> = IndexMap::new();
        for task in &tasks {
            for product in task.products() {
                rules.entry(product).or_default().push(*task);
            }
        }

        let intrinsics = Intrinsics::new();
        let graph_rules = tasks
            .iter()
            .map(|t| Rule::Task(*t))
            .chain(
                intrinsics
                    .keys()
                    .map(|i| Rule::Intrinsic(Intern::new(i.clone()))),
            )
            .collect::<Vec<_>>();
        let queries = queries.into_iter().collect::<Vec<_>>();

        let rule_graph = RuleGraph::new(graph_rules, queries.clone(), roots.clone())?;
        debug!(
            "Created a RuleIndex with {} rules, {} root types and {} queries.",
            tasks.len(),
            roots.len(),
            queries.len()
        );

        Ok(RuleIndex {
            rules,
            roots,
            queries,
            intrinsics,
            rule_graph,
        })
    }

    ///
    /// The candidate rules for the given product (including rules which declare it as a union
    /// product).
    ///
    pub fn rules_for(&self, product: TypeId) -> &[Intern<Task>] {
        self.rules
            .get(&product)
            .map(|tasks| tasks.as_slice())
            .unwrap_or(&[])
    }

    pub fn roots(&self) -> &BTreeSet<TypeId> {
        &self.roots
    }

    ///
    /// The declared queries. See `RuleGraph::queries` for the queries implied by root types.
    ///
    pub fn queries(&self) -> &[Query<TypeId>] {
        &self.queries
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub fn rule_graph(&self) -> &RuleGraph<Rule> {
        &self.rule_graph
    }
}

fn singleton_task(value: Value) -> Task {
    let product = value.type_id();
    let name = format!("singleton({value:?})");
    Task {
        product,
        union_products: vec![],
        clause: vec![],
        gets: vec![],
        func: Function::new(name.clone(), move |_, _| {
            let value = value.clone();
            async move { Ok(value) }
        }),
        cacheable: true,
        display_info: DisplayInfo {
            name,
            desc: None,
            level: Level::Trace,
        },
    }
}
