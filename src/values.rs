// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::Any;
use std::fmt::{self, Debug};
use std::hash::{self, Hash, Hasher};
use std::sync::Arc;

use smallvec::SmallVec;

///
/// Identifies a Rust type which is used as a product or param.
///
/// Ordered (and displayed) by the short name of the type, which keeps error messages and graph
/// renderings stable across runs.
///
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TypeId {
    name: &'static str,
    id: std::any::TypeId,
}

impl TypeId {
    pub fn of<T: Any>() -> TypeId {
        TypeId {
            name: short_type_name(std::any::type_name::<T>()),
            id: std::any::TypeId::of::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

///
/// Strips the module path from a type name, so that `my_crate::fs::FileContent` renders as
/// `FileContent`. Type parameters are left as-is.
///
fn short_type_name(full_name: &'static str) -> &'static str {
    let base_end = full_name.find('<').unwrap_or(full_name.len());
    match full_name[..base_end].rfind("::") {
        Some(idx) => &full_name[idx + 2..],
        None => full_name,
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl rule_graph::TypeId for TypeId {
    /// Render a string for a collection of TypeIds.
    fn display<I>(type_ids: I) -> String
    where
        I: Iterator<Item = TypeId>,
    {
        display_sorted_in_parens(type_ids)
    }
}

pub fn display_sorted_in_parens<T>(items: T) -> String
where
    T: Iterator,
    T::Item: fmt::Display,
{
    let mut items: Vec<_> = items.map(|p| format!("{p}")).collect();
    match items.pop() {
        None => "()".to_string(),
        Some(item) if items.is_empty() => item,
        Some(item) => {
            items.push(item);
            items.sort();
            format!("({})", items.join(", "))
        }
    }
}

///
/// The bound for values which may flow through the engine: as products, as params, or as the
/// inputs of a Get.
///
/// Implemented for every `Debug + Eq + Hash + Send + Sync` type, so rule authors never implement
/// it directly. Equality is structural, which is what allows re-run Nodes to be compared with
/// their previous result.
///
pub trait EngineValue: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn type_id_of(&self) -> TypeId;

    fn dyn_eq(&self, other: &dyn EngineValue) -> bool;

    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T: Any + Debug + Eq + Hash + Send + Sync> EngineValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_id_of(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn dyn_eq(&self, other: &dyn EngineValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        std::any::TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

///
/// A type-erased, reference counted value.
///
#[derive(Clone)]
pub struct Value(Arc<dyn EngineValue>);

impl Value {
    pub fn new<T: EngineValue>(value: T) -> Value {
        Value(Arc::new(value))
    }

    pub fn type_id(&self) -> TypeId {
        self.0.type_id_of()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    ///
    /// Like `downcast_ref`, but fails with a Throw naming the expected type.
    ///
    pub fn extract<T: Any>(&self) -> Result<&T, Failure> {
        self.downcast_ref::<T>().ok_or_else(|| {
            throw(format!(
                "Expected a value of type {}, but got {:?} (of type {}).",
                TypeId::of::<T>(),
                self,
                self.type_id()
            ))
        })
    }
}

impl<T: EngineValue> From<Arc<T>> for Value {
    fn from(value: Arc<T>) -> Self {
        Value(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.dyn_eq(&*other.0)
    }
}

impl Eq for Value {}

impl hash::Hash for Value {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

pub type Id = u64;

/// An interned key for a Value for use as a key in HashMaps and sets.
#[derive(Clone)]
pub struct Key {
    id: Id,
    type_id: TypeId,
    pub value: Value,
}

impl Eq for Key {}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        self.id == other.id
    }
}

impl hash::Hash for Key {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Key {
    pub fn new(id: Id, type_id: TypeId, value: Value) -> Key {
        Key { id, type_id, value }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn type_id(&self) -> &TypeId {
        &self.type_id
    }

    pub fn to_value(&self) -> Value {
        self.value.clone()
    }
}

///
/// Params represent a TypeId->Key map.
///
/// For efficiency and hashability, they're stored as sorted Keys (with distinct TypeIds).
///
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Params(SmallVec<[Key; 4]>);

impl<'x> Params {
    pub fn new<I: IntoIterator<Item = Key>>(param_inputs: I) -> Result<Params, String> {
        let mut params = param_inputs.into_iter().collect::<SmallVec<[Key; 4]>>();
        params.sort_by_key(|k| *k.type_id());

        for pair in params.windows(2) {
            if pair[0].type_id() == pair[1].type_id() {
                return Err(format!(
                    "Values used as `Params` must have distinct types, but the following \
                     values had the same type (`{}`):\n  {}\n  {}",
                    pair[0].type_id(),
                    pair[0],
                    pair[1],
                ));
            }
        }

        Ok(Params(params))
    }

    pub fn keys(&'x self) -> impl Iterator<Item = &'x Key> {
        self.0.iter()
    }

    ///
    /// Adds the given param Keys to these Params, replacing existing params with the same type if
    /// they exist.
    ///
    pub fn extend(&mut self, params: impl IntoIterator<Item = Key>) {
        for param in params {
            match self.binary_search(param.type_id) {
                Ok(idx) => self.0[idx] = param,
                Err(idx) => self.0.insert(idx, param),
            }
        }
    }

    ///
    /// Filters this Params object in-place to contain only params matching the given predicate.
    ///
    pub fn retain<F: FnMut(&mut Key) -> bool>(&mut self, f: F) {
        self.0.retain(f)
    }

    ///
    /// Returns the Key for the given TypeId if it is represented in this set of Params.
    ///
    pub fn find(&self, type_id: TypeId) -> Option<&Key> {
        self.binary_search(type_id).ok().map(|idx| &self.0[idx])
    }

    fn binary_search(&self, type_id: TypeId) -> Result<usize, usize> {
        self.0
            .binary_search_by(|key| key.type_id().cmp(&type_id))
    }

    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.0.iter().map(|k| *k.type_id())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Params{}", display_sorted_in_parens(self.0.iter()))
    }
}

///
/// A short required name, and optional human readable description for a single frame of a Failure.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailureFrame {
    pub name: String,
    pub desc: Option<String>,
}

///
/// The category of a Throw, which callers may match on without parsing its message.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThrowKind {
    /// Raised by a rule body, or by the engine on behalf of a rule.
    Exception,
    /// The dependency graph contained a cycle.
    Cycle,
    /// A process exceeded its timeout.
    Timeout,
    /// A rule returned a value of a type other than its declared products.
    IncorrectProduct,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Failure {
    /// A Node failed because a filesystem change invalidated it or its inputs.
    /// A root requestor should usually immediately retry their request.
    Invalidated,
    /// An error was thrown.
    Throw {
        kind: ThrowKind,
        message: String,
        // A stack of FailureFrames.
        engine_traceback: Vec<FailureFrame>,
    },
}

impl Failure {
    ///
    /// Consumes this Failure to produce a new Failure with an additional engine_traceback entry.
    ///
    pub fn with_pushed_frame(self, name: &str, desc: Option<String>) -> Failure {
        match self {
            Failure::Invalidated => Failure::Invalidated,
            Failure::Throw {
                kind,
                message,
                mut engine_traceback,
            } => {
                engine_traceback.push(FailureFrame {
                    name: name.to_owned(),
                    desc,
                });
                Failure::Throw {
                    kind,
                    message,
                    engine_traceback,
                }
            }
        }
    }

    pub fn throw_kind(&self) -> Option<ThrowKind> {
        match self {
            Failure::Invalidated => None,
            Failure::Throw { kind, .. } => Some(*kind),
        }
    }

    ///
    /// Renders the engine traceback, innermost frame first.
    ///
    pub fn engine_traceback(&self) -> Vec<String> {
        match self {
            Failure::Invalidated => vec![],
            Failure::Throw {
                engine_traceback, ..
            } => engine_traceback
                .iter()
                .map(|frame| match frame.desc {
                    Some(ref desc) => format!("{} ({desc})", frame.name),
                    None => frame.name.clone(),
                })
                .collect(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Failure::Invalidated => write!(f, "Giving up on retrying due to changed files."),
            Failure::Throw { message, .. } => write!(f, "{message}"),
        }
    }
}

impl From<String> for Failure {
    fn from(err: String) -> Self {
        throw(err)
    }
}

pub fn throw(msg: String) -> Failure {
    throw_kind(ThrowKind::Exception, msg)
}

pub fn throw_kind(kind: ThrowKind, message: String) -> Failure {
    Failure::Throw {
        kind,
        message,
        engine_traceback: Vec::new(),
    }
}

pub type NodeResult<T> = Result<T, Failure>;
