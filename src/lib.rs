// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#[macro_use]
extern crate derivative;

mod context;
mod fs;
mod interning;
mod intrinsics;
mod nodes;
mod process;
mod rules;
mod scheduler;
mod session;
mod tasks;
mod values;

pub use crate::context::{Core, ExecutionOptions, InvalidatableGraph, SessionCore};
pub use crate::fs::{
    DirectoryListing, FileContent, ReadFileRequest, RelativePath, ScandirRequest, Stat,
};
pub use crate::intrinsics::{BuildRunId, SessionValues};
pub use crate::nodes::{Get, NodeKey, NodeOutput, TaskContext};
pub use crate::process::{Process, ProcessCacheScope, ProcessResult};
pub use crate::rules::{RuleEntry, RuleIndex};
pub use crate::scheduler::{ExecutionRequest, ExecutionTermination, Root, Scheduler};
pub use crate::session::{sessions_cancel, Session};
pub use crate::tasks::{DisplayInfo, Function, Intrinsic, Rule, Task, Tasks};
pub use crate::values::{
    throw, throw_kind, EngineValue, Failure, FailureFrame, Key, NodeResult, Params, ThrowKind,
    TypeId, Value,
};

pub use log::Level;

#[cfg(test)]
mod tests;
