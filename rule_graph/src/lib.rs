// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod builder;
mod rules;

use std::collections::HashMap;
use std::fmt;
use std::io;

use internment::Intern;

use crate::builder::Builder;
pub use crate::rules::{
    DependencyKey, DisplayForGraph, DisplayForGraphArgs, ParamTypes, Query, Rule, TypeId,
};

///
/// A node in the solved graph which has dependencies: either the root of a Query, or a Rule
/// bound to the set of params that it (transitively) consumes.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub enum EntryWithDeps<R: Rule> {
    Root(RootEntry<R>),
    Rule(RuleEntry<R>),
}

impl<R: Rule> EntryWithDeps<R> {
    pub fn rule(&self) -> Option<&R> {
        match self {
            EntryWithDeps::Rule(RuleEntry { rule, .. }) => Some(rule),
            EntryWithDeps::Root(_) => None,
        }
    }

    ///
    /// The params which are in scope for this entry. For a Rule, these are exactly the params
    /// that it consumes: for a Root, the params that the Query declared.
    ///
    pub fn params(&self) -> &ParamTypes<R::TypeId> {
        match self {
            EntryWithDeps::Rule(ref re) => &re.params,
            EntryWithDeps::Root(ref re) => &re.params,
        }
    }
}

impl<R: Rule> fmt::Display for EntryWithDeps<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryWithDeps::Rule(RuleEntry { rule, params }) => {
                write!(f, "{} for {}", rule, params_str(params))
            }
            EntryWithDeps::Root(RootEntry {
                params,
                dependency_key,
            }) => write!(f, "Query({} for {})", dependency_key, params_str(params)),
        }
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub enum Entry<R: Rule> {
    Param(R::TypeId),
    WithDeps(Intern<EntryWithDeps<R>>),
}

impl<R: Rule> fmt::Display for Entry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Param(type_id) => write!(f, "Param({type_id})"),
            Entry::WithDeps(e) => write!(f, "{}", **e),
        }
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct RootEntry<R: Rule> {
    params: ParamTypes<R::TypeId>,
    dependency_key: DependencyKey<R::TypeId>,
}

impl<R: Rule> RootEntry<R> {
    pub fn product(&self) -> R::TypeId {
        self.dependency_key.product()
    }

    pub fn dependency_key(&self) -> &DependencyKey<R::TypeId> {
        &self.dependency_key
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct RuleEntry<R: Rule> {
    params: ParamTypes<R::TypeId>,
    rule: R,
}

impl<R: Rule> RuleEntry<R> {
    pub fn rule(&self) -> &R {
        &self.rule
    }
}

type RuleDependencyEdges<R> = HashMap<Intern<EntryWithDeps<R>>, RuleEdges<R>>;

pub enum Palette {
    Olive,
    Gray,
    Orange,
    Blue,
}

impl Palette {
    // These color values are all in HSV. See https://www.graphviz.org/doc/info/colors.html.
    fn color_string(&self) -> &'static str {
        match self {
            Self::Olive => "0.2214,0.7179,0.8528",
            Self::Gray => "0.576,0,0.6242",
            Self::Orange => "0.08,0.5,0.976",
            Self::Blue => "0.5,1,0.9",
        }
    }

    fn attrs(&self) -> String {
        format!("[color=\"{}\",style=filled]", self.color_string())
    }
}

pub(crate) fn params_str<T: TypeId>(params: &ParamTypes<T>) -> String {
    T::display(params.iter().cloned())
}

///
/// The solved graph of Rules and Queries.
///
/// Each Rule appears once for each distinct set of params that it consumes, and each of its
/// DependencyKeys is bound to exactly one Entry (either a Param or another Rule).
///
#[derive(Debug)]
pub struct RuleGraph<R: Rule> {
    queries: Vec<Query<R::TypeId>>,
    rule_dependency_edges: RuleDependencyEdges<R>,
}

impl<R: Rule> RuleGraph<R> {
    ///
    /// Solves and validates a graph for the given Rules, which must satisfy all of the given
    /// Queries. Each root type additionally allows each product to be requested given only that
    /// type, if possible.
    ///
    pub fn new(
        rules: Vec<R>,
        queries: Vec<Query<R::TypeId>>,
        root_types: ParamTypes<R::TypeId>,
    ) -> Result<RuleGraph<R>, String> {
        Builder::new(rules, queries, root_types).graph()
    }

    pub(crate) fn from_edges(
        queries: Vec<Query<R::TypeId>>,
        rule_dependency_edges: RuleDependencyEdges<R>,
    ) -> RuleGraph<R> {
        RuleGraph {
            queries,
            rule_dependency_edges,
        }
    }

    ///
    /// The Queries which are satisfiable in this graph, including those implied by root types.
    ///
    pub fn queries(&self) -> &[Query<R::TypeId>] {
        &self.queries
    }

    ///
    /// Find the entrypoint in this RuleGraph for the given product and params.
    ///
    /// An exact match for the params is preferred: otherwise, exactly one Query must consume a
    /// subset of the given params.
    ///
    pub fn find_root<I: IntoIterator<Item = R::TypeId>>(
        &self,
        param_inputs: I,
        product: R::TypeId,
    ) -> Result<(Intern<EntryWithDeps<R>>, RuleEdges<R>), String> {
        let params: ParamTypes<_> = param_inputs.into_iter().collect();
        let dependency_key = DependencyKey::new(product);

        let exact = Intern::new(EntryWithDeps::Root(RootEntry {
            params: params.clone(),
            dependency_key: dependency_key.clone(),
        }));
        if let Some(edges) = self.rule_dependency_edges.get(&exact) {
            return Ok((exact, edges.clone()));
        }

        let mut subset_matches = self
            .rule_dependency_edges
            .iter()
            .filter(|(entry, _)| match ***entry {
                EntryWithDeps::Root(ref root_entry) => {
                    root_entry.dependency_key == dependency_key
                        && root_entry.params.is_subset(&params)
                }
                _ => false,
            })
            .collect::<Vec<_>>();

        match subset_matches.len() {
            1 => {
                let (entry, edges) = subset_matches.remove(0);
                Ok((*entry, edges.clone()))
            }
            0 => {
                let mut suggestions = self
                    .queries
                    .iter()
                    .filter(|q| q.product == product)
                    .map(|q| format!("Params({})", params_str(&q.params)))
                    .collect::<Vec<_>>();
                suggestions.sort();
                if suggestions.is_empty() {
                    Err(format!(
                        "No installed QueryRules return the type {product}. Try registering \
                         QueryRule({product}, [{}]).",
                        params_str(&params)
                    ))
                } else {
                    Err(format!(
                        "No installed QueryRules can compute {product} given input Params({}), \
                         but it can be produced using:\n  {}",
                        params_str(&params),
                        suggestions.join("\n  ")
                    ))
                }
            }
            _ => {
                let mut match_strs = subset_matches
                    .into_iter()
                    .map(|(e, _)| (**e).to_string())
                    .collect::<Vec<_>>();
                match_strs.sort();
                Err(format!(
                    "More than one set of rules can compute {product} for input Params({}):\n  {}",
                    params_str(&params),
                    match_strs.join("\n  ")
                ))
            }
        }
    }

    ///
    /// Returns the edges of the given Entry, or None if it is a Param (or not a member of this
    /// graph).
    ///
    pub fn edges_for_inner(&self, entry: &Entry<R>) -> Option<RuleEdges<R>> {
        match entry {
            Entry::WithDeps(e) => self.rule_dependency_edges.get(e).cloned(),
            Entry::Param(_) => None,
        }
    }

    ///
    /// Renders the solved graph in GraphViz DOT format.
    ///
    pub fn visualize(&self, f: &mut dyn io::Write) -> io::Result<()> {
        let display_args = DisplayForGraphArgs { multiline: true };
        let node_str = |entry: &Entry<R>| -> (String, Option<String>) {
            match entry {
                Entry::Param(type_id) => (
                    format!("Param({type_id})"),
                    Some(Palette::Orange.attrs()),
                ),
                Entry::WithDeps(e) => match **e {
                    EntryWithDeps::Root(_) => ((**e).to_string(), Some(Palette::Blue.attrs())),
                    EntryWithDeps::Rule(RuleEntry {
                        ref rule,
                        ref params,
                    }) => {
                        let label = format!(
                            "{}{}for {}",
                            rule.fmt_for_graph(display_args),
                            display_args.line_separator(),
                            params_str(params)
                        );
                        let attrs = if params.is_empty() {
                            // Singletons.
                            Some(Palette::Olive.attrs())
                        } else {
                            rule.color().map(|c| c.attrs())
                        };
                        (label, attrs)
                    }
                },
            }
        };

        let mut lines = Vec::new();
        for (entry, edges) in &self.rule_dependency_edges {
            let (src, src_attrs) = node_str(&Entry::WithDeps(*entry));
            if let Some(attrs) = src_attrs {
                lines.push(format!("  \"{}\" {}", escape(&src), attrs));
            }
            for dep in edges.all_dependencies() {
                let (dst, dst_attrs) = node_str(dep);
                if let (Entry::Param(_), Some(attrs)) = (dep, dst_attrs) {
                    lines.push(format!("  \"{}\" {}", escape(&dst), attrs));
                }
                lines.push(format!("  \"{}\" -> \"{}\"", escape(&src), escape(&dst)));
            }
        }
        lines.sort();
        lines.dedup();

        writeln!(f, "digraph {{")?;
        for line in lines {
            writeln!(f, "{line}")?;
        }
        writeln!(f, "}}")
    }
}

fn escape(s: &str) -> String {
    s.replace('"', "\\\"").replace('\n', "\\n")
}

///
/// Records the dependency rules for a rule.
///
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct RuleEdges<R: Rule> {
    dependencies: HashMap<DependencyKey<R::TypeId>, Entry<R>>,
}

impl<R: Rule> RuleEdges<R> {
    pub fn entry_for(&self, dependency_key: &DependencyKey<R::TypeId>) -> Option<&Entry<R>> {
        self.dependencies.get(dependency_key)
    }

    pub fn all_dependencies(&self) -> impl Iterator<Item = &Entry<R>> {
        self.dependencies.values()
    }

    pub(crate) fn add_edge(&mut self, dependency_key: DependencyKey<R::TypeId>, entry: Entry<R>) {
        self.dependencies.insert(dependency_key, entry);
    }
}

// Can't be derived, because that would require `R: Default`.
impl<R: Rule> Default for RuleEdges<R> {
    fn default() -> Self {
        RuleEdges {
            dependencies: HashMap::default(),
        }
    }
}
