//! Streaming batch API: emit each document as soon as it finishes.
//!
//! [`Dispatcher::convert_batch`](crate::convert::Dispatcher::convert_batch)
//! returns only after every file is done. [`convert_stream`] yields results
//! in completion order instead, which suits progress bars and incremental
//! writes. Each item carries its own run id, success or failure.

use crate::convert::Dispatcher;
use crate::error::ConvertFailure;
use crate::output::MarkdownResult;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of per-document results.
pub type ConversionStream = Pin<Box<dyn Stream<Item = Result<MarkdownResult, ConvertFailure>> + Send>>;

/// Convert `paths` with at most `config.concurrency` documents in flight.
/// Items arrive in completion order; use `source_path` to match them up.
pub fn convert_stream<I>(dispatcher: &Dispatcher, paths: I) -> ConversionStream
where
    I: IntoIterator<Item = PathBuf>,
{
    let paths: Vec<PathBuf> = paths.into_iter().collect();
    let concurrency = dispatcher.config().concurrency.max(1);
    info!(files = paths.len(), concurrency, "Starting streaming conversion");

    let dispatcher = dispatcher.clone();
    let s = stream::iter(paths)
        .map(move |path| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.convert(path, None).await }
        })
        .buffer_unordered(concurrency);
    Box::pin(s)
}
