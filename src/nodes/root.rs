// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use rule_graph::DependencyKey;

use super::{NodeKey, NodeResult};
use crate::context::Context;
use crate::tasks::Rule;
use crate::values::{Params, TypeId, Value};

///
/// A root Node in the execution graph.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Root {
    pub params: Params,
    pub(super) product: TypeId,
    entry: rule_graph::Entry<Rule>,
}

impl Root {
    pub fn new(
        mut params: Params,
        dependency_key: &DependencyKey<TypeId>,
        edges: &rule_graph::RuleEdges<Rule>,
    ) -> Result<Self, String> {
        let entry = edges
            .entry_for(dependency_key)
            .cloned()
            .ok_or_else(|| format!("No entry was solved for {dependency_key}"))?;
        params.retain(|k| match &entry {
            rule_graph::Entry::Param(type_id) => type_id == k.type_id(),
            rule_graph::Entry::WithDeps(with_deps) => with_deps.params().contains(k.type_id()),
        });
        Ok(Self {
            params,
            product: dependency_key.product(),
            entry,
        })
    }

    pub fn product(&self) -> TypeId {
        self.product
    }

    pub(super) async fn run_node(self, context: Context) -> NodeResult<Value> {
        super::select(context, self.params, self.entry).await
    }
}

impl From<Root> for NodeKey {
    fn from(n: Root) -> Self {
        NodeKey::Root(Box::new(n))
    }
}
