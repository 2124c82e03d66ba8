// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use smallvec::SmallVec;

use super::{params_str, Palette};

pub type ParamTypes<T> = BTreeSet<T>;

pub trait TypeId:
    Clone + Copy + Debug + Display + Hash + Eq + Ord + Sized + Send + Sync + 'static
{
    ///
    /// Render a string for a collection of TypeIds.
    ///
    fn display<I>(type_ids: I) -> String
    where
        I: Iterator<Item = Self>;
}

///
/// A dependency of a Rule: either a positional input (which provides no params), or a `Get`,
/// which provides the given params to the rule that computes its product.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct DependencyKey<T: TypeId> {
    product: T,
    provided_params: SmallVec<[T; 2]>,
}

impl<T: TypeId> DependencyKey<T> {
    pub fn new(product: T) -> Self {
        DependencyKey {
            product,
            provided_params: SmallVec::default(),
        }
    }

    ///
    /// Panics if the provided params are not distinct: a Get may provide at most one value of
    /// each type.
    ///
    pub fn new_with_params<I: IntoIterator<Item = T>>(product: T, provided_params: I) -> Self {
        let mut provided_params = provided_params.into_iter().collect::<SmallVec<[T; 2]>>();
        provided_params.sort();

        let original_len = provided_params.len();
        provided_params.dedup();
        if original_len != provided_params.len() {
            panic!("Expected unique provided params for a Get of {product}.");
        }

        DependencyKey {
            product,
            provided_params,
        }
    }

    ///
    /// Returns the product (output) type for this dependency.
    ///
    pub fn product(&self) -> T {
        self.product
    }

    ///
    /// Returns the Param (input) types that this dependency provides, in sorted order.
    ///
    pub fn provided_params(&self) -> &[T] {
        &self.provided_params
    }
}

impl<T: TypeId> Display for DependencyKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.provided_params.is_empty() {
            write!(f, "{}", self.product)
        } else {
            write!(
                f,
                "Get({}, [{}])",
                self.product,
                T::display(self.provided_params.iter().cloned())
            )
        }
    }
}

pub trait DisplayForGraph {
    ///
    /// Return a pretty-printed representation of this Rule's graph node, suitable for graphviz.
    ///
    fn fmt_for_graph(&self, display_args: DisplayForGraphArgs) -> String;
}

///
/// A struct to contain display options consumed by DisplayForGraph.
///
#[derive(Clone, Copy)]
pub struct DisplayForGraphArgs {
    pub multiline: bool,
}

impl DisplayForGraphArgs {
    pub fn line_separator(&self) -> &'static str {
        if self.multiline {
            "\n"
        } else {
            " "
        }
    }

    pub fn optional_line_separator(&self) -> &'static str {
        if self.multiline {
            "\n"
        } else {
            ""
        }
    }
}

pub trait Rule:
    Clone + Debug + Display + Hash + Eq + Sized + DisplayForGraph + Send + Sync + 'static
{
    type TypeId: TypeId;

    ///
    /// Returns the product (output) types for this Rule. The first is its primary product: any
    /// others are union members which the Rule may also produce.
    ///
    fn products(&self) -> Vec<Self::TypeId>;

    ///
    /// Return keys for the dependencies of this Rule.
    ///
    fn dependency_keys(&self) -> Vec<&DependencyKey<Self::TypeId>>;

    ///
    /// True if this rule implementation should be required to be reachable in the RuleGraph.
    ///
    fn require_reachable(&self) -> bool;

    ///
    /// Return any specific color this rule should be drawn with on the visualized graph.
    ///
    fn color(&self) -> Option<Palette>;
}

///
/// A declared entrypoint to the graph: a product which may be requested for the given params.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct Query<T: TypeId> {
    pub product: T,
    pub params: ParamTypes<T>,
}

impl<T: TypeId> Query<T> {
    pub fn new<I: IntoIterator<Item = T>>(product: T, params: I) -> Query<T> {
        Query {
            product,
            params: params.into_iter().collect(),
        }
    }
}

impl<T: TypeId> Display for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            self.fmt_for_graph(DisplayForGraphArgs { multiline: false })
        )
    }
}

impl<T: TypeId> DisplayForGraph for Query<T> {
    fn fmt_for_graph(&self, _: DisplayForGraphArgs) -> String {
        format!("Query({} for {})", self.product, params_str(&self.params))
    }
}
