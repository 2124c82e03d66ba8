// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{Debug, Display};
use std::hash::Hash;

use async_trait::async_trait;
use petgraph::stable_graph;

use crate::context::Context;

// 2^32 Nodes ought to be more than enough for anyone!
pub type EntryId = stable_graph::NodeIndex<u32>;

///
/// Defines executing a cacheable/memoizable step within the given Context.
///
/// Nodes are keys in the Graph: two equal Nodes share a single Entry, and so a single (possibly
/// running) computation.
///
#[async_trait]
pub trait Node: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    /// An implementation-specific context required to run this Node.
    type Context: Send + Sync + 'static;

    type Item: Clone + Debug + Eq + Send + Sync + 'static;
    type Error: NodeError;

    async fn run(self, context: Context<Self>) -> Result<Self::Item, Self::Error>;

    ///
    /// True if this Node may be restarted (rather than allowed to complete as dirty) when one of
    /// its dependencies changes while it is running. Side-effecting Nodes return false.
    ///
    fn restartable(&self) -> bool {
        true
    }

    ///
    /// False if this Node should be re-run once per RunId, rather than memoized until invalidated.
    ///
    fn cacheable(&self) -> bool {
        true
    }

    ///
    /// Allows a cacheable Node to decline to memoize a particular output (for example, a process
    /// that exited unsuccessfully).
    ///
    fn cacheable_item(&self, _item: &Self::Item) -> bool {
        true
    }

    ///
    /// Creates an error for a dependency cycle. The path begins and ends with the same Node.
    ///
    fn cyclic_error(path: &[&Self]) -> Self::Error;
}

pub trait NodeError: Clone + Debug + Eq + Send + Sync + 'static {
    ///
    /// Creates an instance that represents that a Node was invalidated out of the Graph (generally
    /// while running). Never memoized.
    ///
    fn invalidated() -> Self;

    ///
    /// Creates an instance for a failure of the Graph itself, with the given message.
    ///
    fn generic(message: String) -> Self;
}

///
/// A Node type that wraps (and is wrapped by) a particular variant of `N`, allowing typed
/// requests against a Graph of an enum of Node types.
///
pub trait CompoundNode<N: Node>: Into<N> + Send {
    type Item: TryFrom<N::Item>;
}

impl<N: Node> CompoundNode<N> for N {
    type Item = N::Item;
}
