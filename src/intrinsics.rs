// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;

use crate::context::Context;
use crate::fs::{DirectoryListing, FileContent, ReadFileRequest, RelativePath, ScandirRequest};
use crate::nodes::{self, ExecuteProcess, ReadFile, Scandir};
use crate::process::{Process, ProcessResult};
use crate::tasks::Intrinsic;
use crate::values::{throw, NodeResult, TypeId, Value};

///
/// The values of the Session that a request is running in, as provided by the caller.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SessionValues(pub Value);

///
/// The id of the current run of a Session: uncacheable rules re-run once per id.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BuildRunId(pub u32);

type IntrinsicFn =
    Box<dyn Fn(Context, Vec<Value>) -> BoxFuture<'static, NodeResult<Value>> + Send + Sync>;

pub struct Intrinsics {
    intrinsics: IndexMap<Intrinsic, IntrinsicFn>,
}

impl Intrinsics {
    pub fn new() -> Intrinsics {
        let mut intrinsics: IndexMap<Intrinsic, IntrinsicFn> = IndexMap::new();
        intrinsics.insert(
            Intrinsic::new(
                "read_file_request_to_file_content",
                TypeId::of::<FileContent>(),
                TypeId::of::<ReadFileRequest>(),
            ),
            Box::new(read_file_request_to_file_content),
        );
        intrinsics.insert(
            Intrinsic::new(
                "scandir_request_to_directory_listing",
                TypeId::of::<DirectoryListing>(),
                TypeId::of::<ScandirRequest>(),
            ),
            Box::new(scandir_request_to_directory_listing),
        );
        intrinsics.insert(
            Intrinsic::new(
                "process_request_to_process_result",
                TypeId::of::<ProcessResult>(),
                TypeId::of::<Process>(),
            ),
            Box::new(process_request_to_process_result),
        );
        intrinsics.insert(
            Intrinsic {
                name: "session_values",
                product: TypeId::of::<SessionValues>(),
                inputs: vec![],
            },
            Box::new(session_values),
        );
        intrinsics.insert(
            Intrinsic {
                name: "run_id",
                product: TypeId::of::<BuildRunId>(),
                inputs: vec![],
            },
            Box::new(run_id),
        );
        Intrinsics { intrinsics }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Intrinsic> {
        self.intrinsics.keys()
    }

    pub async fn run(
        &self,
        intrinsic: &Intrinsic,
        context: Context,
        args: Vec<Value>,
    ) -> NodeResult<Value> {
        let function = self
            .intrinsics
            .get(intrinsic)
            .unwrap_or_else(|| panic!("Unrecognized intrinsic: {intrinsic:?}"));
        function(context, args).await
    }
}

fn single_arg<T: Clone + 'static>(args: Vec<Value>) -> NodeResult<T> {
    let arg = args
        .into_iter()
        .next()
        .ok_or_else(|| throw("Expected exactly one argument for intrinsic.".to_owned()))?;
    arg.extract::<T>().cloned()
}

fn read_file_request_to_file_content(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let request: ReadFileRequest = single_arg(args)?;
        let path = RelativePath::new(&request.path).map_err(throw)?;
        let file_content = context.get(ReadFile(path)).await?;
        Ok(Value::from(file_content))
    }
    .boxed()
}

fn scandir_request_to_directory_listing(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let request: ScandirRequest = single_arg(args)?;
        let path = RelativePath::new(&request.path).map_err(throw)?;
        let listing = context.get(Scandir(path)).await?;
        Ok(Value::from(listing))
    }
    .boxed()
}

fn process_request_to_process_result(
    context: Context,
    args: Vec<Value>,
) -> BoxFuture<'static, NodeResult<Value>> {
    async move {
        let process: Process = single_arg(args)?;
        let result: Arc<ProcessResult> = context
            .get(ExecuteProcess {
                process: Box::new(process),
            })
            .await?;
        Ok(Value::from(result))
    }
    .boxed()
}

fn session_values(context: Context, _args: Vec<Value>) -> BoxFuture<'static, NodeResult<Value>> {
    async move { context.get(nodes::SessionValues).await }.boxed()
}

fn run_id(context: Context, _args: Vec<Value>) -> BoxFuture<'static, NodeResult<Value>> {
    async move { context.get(nodes::RunId).await }.boxed()
}
