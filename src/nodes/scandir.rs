// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use graph::CompoundNode;
use workunit_store::{Metric, RunningWorkunit};

use super::{NodeKey, NodeOutput, NodeResult};
use crate::context::Context;
use crate::fs::{self, DirectoryListing, RelativePath};
use crate::values::throw;

///
/// A Node that represents executing a directory listing that returns a Stat per directory
/// entry (generally in one syscall). No symlinks are expanded.
///
/// The empty path lists the build root.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Scandir(pub RelativePath);

impl Scandir {
    pub(super) async fn run_node(
        self,
        context: Context,
        workunit: &mut RunningWorkunit,
    ) -> NodeResult<DirectoryListing> {
        workunit.increment_counter(Metric::DirectoryScans, 1);
        fs::scandir(&context.core.build_root, self.0.as_ref())
            .await
            .map_err(throw)
    }
}

impl CompoundNode<NodeKey> for Scandir {
    type Item = Arc<DirectoryListing>;
}

impl From<Scandir> for NodeKey {
    fn from(n: Scandir) -> Self {
        NodeKey::Scandir(n)
    }
}

impl TryFrom<NodeOutput> for Arc<DirectoryListing> {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::DirectoryListing(v) => Ok(v),
            _ => Err(()),
        }
    }
}
