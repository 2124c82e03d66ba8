// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use internment::Intern;
use log::{debug, trace};

use crate::rules::{DependencyKey, ParamTypes, Query, Rule, TypeId};
use crate::{params_str, Entry, EntryWithDeps, RootEntry, RuleEdges, RuleEntry, RuleGraph};

/// The maximum number of passes used to solve recursive rules to a fixpoint.
const MAX_FIXPOINT_PASSES: usize = 32;

type Scoped<R> = (R, ParamTypes<<R as Rule>::TypeId>);

///
/// The source chosen for a DependencyKey: a Param which is in scope, or a Rule which consumes the
/// given params.
///
#[derive(Clone, Debug)]
enum Candidate<R: Rule> {
    Param(R::TypeId),
    Rule {
        rule: R,
        used: ParamTypes<R::TypeId>,
    },
}

impl<R: Rule> Candidate<R> {
    fn used_len(&self) -> usize {
        match self {
            Candidate::Param(_) => 1,
            Candidate::Rule { used, .. } => used.len(),
        }
    }

    fn entry(&self) -> Entry<R> {
        match self {
            Candidate::Param(type_id) => Entry::Param(*type_id),
            Candidate::Rule { rule, used } => {
                Entry::WithDeps(Intern::new(EntryWithDeps::Rule(RuleEntry {
                    params: used.clone(),
                    rule: rule.clone(),
                })))
            }
        }
    }
}

impl<R: Rule> std::fmt::Display for Candidate<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Candidate::Param(type_id) => write!(f, "Param({type_id})"),
            Candidate::Rule { rule, used } => write!(f, "{} for {}", rule, params_str(used)),
        }
    }
}

#[derive(Clone, Debug)]
struct Resolved<R: Rule> {
    /// The params consumed by this node and its transitive dependencies.
    used: ParamTypes<R::TypeId>,
    dependencies: Vec<(DependencyKey<R::TypeId>, Candidate<R>)>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Unsatisfiable {
    /// No source was available for a dependency. Eliminates the dependent from consideration.
    Missing(String),
    /// More than one equally good source was available. Always reported.
    Ambiguous(String),
}

impl Unsatisfiable {
    fn message(&self) -> &str {
        match self {
            Unsatisfiable::Missing(m) | Unsatisfiable::Ambiguous(m) => m,
        }
    }
}

///
/// Given the set of Rules and Queries, produce a RuleGraph that allows dependency nodes
/// to be found statically.
///
/// Each Rule is resolved within a "scope" of available params. For each of its DependencyKeys,
/// the candidate sources are a Param in scope (for keys which provide no params), and each Rule
/// for the key's product which is itself resolvable within the scope plus the key's provided
/// params. The candidate which consumes the fewest params is chosen, and ties are ambiguous.
///
/// Recursive Rules are resolved by assuming that a Rule which is already being resolved in a
/// scope consumes the entire scope, and then repeatedly re-resolving with the computed result
/// as the new assumption until the results stop changing.
///
pub(crate) struct Builder<R: Rule> {
    rules: Vec<R>,
    rules_by_product: IndexMap<R::TypeId, Vec<R>>,
    queries: Vec<Query<R::TypeId>>,
    root_types: ParamTypes<R::TypeId>,
    memo: HashMap<Scoped<R>, Result<Resolved<R>, Unsatisfiable>>,
    in_progress: HashSet<Scoped<R>>,
    assumptions: HashMap<Scoped<R>, Option<ParamTypes<R::TypeId>>>,
    cyclic: HashSet<Scoped<R>>,
}

impl<R: Rule> Builder<R> {
    pub(crate) fn new(
        rules: Vec<R>,
        queries: Vec<Query<R::TypeId>>,
        root_types: ParamTypes<R::TypeId>,
    ) -> Builder<R> {
        let mut rules_by_product: IndexMap<R::TypeId, Vec<R>> = IndexMap::new();
        for rule in &rules {
            for product in rule.products() {
                let candidates = rules_by_product.entry(product).or_default();
                if !candidates.contains(rule) {
                    candidates.push(rule.clone());
                }
            }
        }
        Builder {
            rules,
            rules_by_product,
            queries,
            root_types,
            memo: HashMap::new(),
            in_progress: HashSet::new(),
            assumptions: HashMap::new(),
            cyclic: HashSet::new(),
        }
    }

    pub(crate) fn graph(mut self) -> Result<RuleGraph<R>, String> {
        // Queries which must be satisfiable, followed by those implied by root types, which are
        // only included if they are satisfiable.
        let mut queries: Vec<(Query<R::TypeId>, bool)> =
            self.queries.iter().map(|q| (q.clone(), true)).collect();
        let products: Vec<R::TypeId> = self.rules_by_product.keys().cloned().collect();
        for root_type in &self.root_types {
            for product in &products {
                let query = Query::new(*product, vec![*root_type]);
                if !self.queries.contains(&query) {
                    queries.push((query, false));
                }
            }
        }

        let resolved_queries = self.solve(&queries);

        let mut errors = Vec::new();
        let mut satisfiable_queries = Vec::new();
        let mut rule_dependency_edges = HashMap::new();
        let mut to_visit = VecDeque::new();
        for ((query, required), result) in queries.into_iter().zip(resolved_queries) {
            match result {
                Ok(candidate) => {
                    let dependency_key = DependencyKey::new(query.product);
                    let root = Intern::new(EntryWithDeps::Root(RootEntry {
                        params: query.params.clone(),
                        dependency_key: dependency_key.clone(),
                    }));
                    let mut edges = RuleEdges::default();
                    let entry = candidate.entry();
                    to_visit.push_back(entry.clone());
                    edges.add_edge(dependency_key, entry);
                    rule_dependency_edges.insert(root, edges);
                    satisfiable_queries.push(query);
                }
                Err(e) if required => {
                    errors.push(format!("{}: {}", query, e.message()));
                }
                Err(e) => {
                    trace!("Optional {query} was not satisfiable: {}", e.message());
                }
            }
        }

        // Walk from the roots to produce edges for every reachable Rule entry.
        let mut reachable_rules = HashSet::new();
        while let Some(entry) = to_visit.pop_front() {
            let Entry::WithDeps(entry_with_deps) = entry else {
                continue;
            };
            if rule_dependency_edges.contains_key(&entry_with_deps) {
                continue;
            }
            let EntryWithDeps::Rule(RuleEntry { rule, params }) = &*entry_with_deps else {
                continue;
            };
            reachable_rules.insert(rule.clone());
            match self.resolve_rule(rule, params) {
                Ok(resolved) => {
                    let mut edges = RuleEdges::default();
                    for (key, candidate) in resolved.dependencies {
                        let dep = candidate.entry();
                        to_visit.push_back(dep.clone());
                        edges.add_edge(key, dep);
                    }
                    rule_dependency_edges.insert(entry_with_deps, edges);
                }
                Err(e) => {
                    errors.push(format!("{}: {}", *entry_with_deps, e.message()));
                }
            }
        }

        for rule in &self.rules {
            if rule.require_reachable() && !reachable_rules.contains(rule) {
                errors.push(format!(
                    "{rule}: Was not reachable, either because no rules could produce the params \
                     or because it was shadowed by another rule."
                ));
            }
        }

        if !errors.is_empty() {
            errors.sort();
            errors.dedup();
            return Err(format!(
                "Rules with errors: {}\n  {}",
                errors.len(),
                errors.join("\n  ")
            ));
        }

        debug!(
            "Solved rule graph with {} entries for {} queries.",
            rule_dependency_edges.len(),
            satisfiable_queries.len()
        );
        Ok(RuleGraph::from_edges(
            satisfiable_queries,
            rule_dependency_edges,
        ))
    }

    ///
    /// Resolves the given queries repeatedly, until the assumptions made for recursive rules
    /// reach a fixpoint.
    ///
    fn solve(
        &mut self,
        queries: &[(Query<R::TypeId>, bool)],
    ) -> Vec<Result<Candidate<R>, Unsatisfiable>> {
        let mut pass = 0;
        loop {
            pass += 1;
            self.memo.clear();
            self.cyclic.clear();

            let results = queries
                .iter()
                .map(|(query, _)| {
                    self.choose(
                        &DependencyKey::new(query.product),
                        &query.params,
                        &query.to_string(),
                    )
                })
                .collect::<Vec<_>>();

            let mut changed = false;
            for scoped in self.cyclic.clone() {
                let computed = match self.memo.get(&scoped) {
                    Some(Ok(resolved)) => Some(resolved.used.clone()),
                    _ => None,
                };
                let assumed = self
                    .assumptions
                    .get(&scoped)
                    .cloned()
                    .unwrap_or_else(|| Some(scoped.1.clone()));
                if computed != assumed {
                    self.assumptions.insert(scoped, computed);
                    changed = true;
                }
            }

            if !changed || pass >= MAX_FIXPOINT_PASSES {
                trace!("Rule graph solved after {pass} passes.");
                return results;
            }
        }
    }

    fn resolve_rule(
        &mut self,
        rule: &R,
        scope: &ParamTypes<R::TypeId>,
    ) -> Result<Resolved<R>, Unsatisfiable> {
        let scoped = (rule.clone(), scope.clone());
        if let Some(result) = self.memo.get(&scoped) {
            return result.clone();
        }
        if self.in_progress.contains(&scoped) {
            // A recursive use: use the current assumption for the params it consumes.
            let assumption = self
                .assumptions
                .get(&scoped)
                .cloned()
                .unwrap_or_else(|| Some(scope.clone()));
            self.cyclic.insert(scoped);
            return match assumption {
                Some(used) => Ok(Resolved {
                    used,
                    dependencies: vec![],
                }),
                None => Err(Unsatisfiable::Missing(format!(
                    "{rule} is recursive, but could not be satisfied for {}.",
                    params_str(scope)
                ))),
            };
        }

        self.in_progress.insert(scoped.clone());
        let mut result = Ok(Resolved {
            used: ParamTypes::new(),
            dependencies: Vec::new(),
        });
        let owner = rule.to_string();
        for key in rule.dependency_keys() {
            let candidate = match self.choose(key, scope, &owner) {
                Ok(candidate) => candidate,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            if let Ok(ref mut resolved) = result {
                match &candidate {
                    Candidate::Param(type_id) => {
                        resolved.used.insert(*type_id);
                    }
                    Candidate::Rule { used, .. } => resolved.used.extend(
                        used.iter()
                            .filter(|t| !key.provided_params().contains(*t))
                            .cloned(),
                    ),
                }
                resolved.dependencies.push((key.clone(), candidate));
            }
        }
        self.in_progress.remove(&scoped);
        self.memo.insert(scoped, result.clone());
        result
    }

    ///
    /// Chooses the source for the given DependencyKey of `owner`, which is resolved in `scope`.
    ///
    fn choose(
        &mut self,
        key: &DependencyKey<R::TypeId>,
        scope: &ParamTypes<R::TypeId>,
        owner: &str,
    ) -> Result<Candidate<R>, Unsatisfiable> {
        let mut candidates = Vec::new();
        let mut eliminated = Vec::new();

        // A Get must be computed by a Rule: a Param is only a candidate for a positional input.
        if key.provided_params().is_empty() && scope.contains(&key.product()) {
            candidates.push(Candidate::Param(key.product()));
        }

        let mut dep_scope = scope.clone();
        dep_scope.extend(key.provided_params().iter().cloned());
        let rules = self
            .rules_by_product
            .get(&key.product())
            .cloned()
            .unwrap_or_default();
        for rule in rules {
            match self.resolve_rule(&rule, &dep_scope) {
                Ok(resolved) => {
                    if key
                        .provided_params()
                        .iter()
                        .all(|p| resolved.used.contains(p))
                    {
                        candidates.push(Candidate::Rule {
                            rule,
                            used: resolved.used,
                        });
                    } else {
                        eliminated.push(format!(
                            "{rule} did not consume all of the provided params {}",
                            <R::TypeId as TypeId>::display(key.provided_params().iter().cloned())
                        ));
                    }
                }
                Err(e @ Unsatisfiable::Ambiguous(_)) => return Err(e),
                Err(Unsatisfiable::Missing(m)) => eliminated.push(m),
            }
        }

        let Some(min) = candidates.iter().map(|c| c.used_len()).min() else {
            let mut msg = format!(
                "No source of dependency {key} for {owner} with params ({}).",
                params_str(scope)
            );
            for e in eliminated {
                msg.push_str(&format!("\n    {}", e.replace('\n', "\n    ")));
            }
            return Err(Unsatisfiable::Missing(msg));
        };
        let mut best = candidates
            .into_iter()
            .filter(|c| c.used_len() == min)
            .collect::<Vec<_>>();
        if best.len() > 1 {
            let mut names = best.iter().map(|c| c.to_string()).collect::<Vec<_>>();
            names.sort();
            return Err(Unsatisfiable::Ambiguous(format!(
                "Ambiguous rules to compute {key} for {owner} with params ({}): {}",
                params_str(scope),
                names.join(", ")
            )));
        }
        Ok(best.remove(0))
    }
}
