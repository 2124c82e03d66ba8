// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use graph::CompoundNode;

use super::{NodeKey, NodeResult};
use crate::context::Context;
use crate::intrinsics::BuildRunId;
use crate::values::Value;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RunId;

impl RunId {
    pub(super) async fn run_node(self, context: Context) -> NodeResult<Value> {
        Ok(Value::new(BuildRunId(context.session.run_id().0)))
    }
}

impl CompoundNode<NodeKey> for RunId {
    type Item = Value;
}

impl From<RunId> for NodeKey {
    fn from(n: RunId) -> Self {
        NodeKey::RunId(n)
    }
}
