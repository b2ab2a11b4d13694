use std::collections::VecDeque;

use futures::{stream, Stream};
use serde_json::json;
use shared_logging::LogLevel;

use super::{
    executor::{QueryError, QueryExecutor},
    template::{Binding, QueryTemplate},
};
use crate::telemetry::BotTelemetry;

/// Walks a sliced query page by page until the service returns nothing.
///
/// Single pass: once an empty page has been seen the slicer stays exhausted.
/// Starting over means building a new slicer, which begins at offset 0.
pub struct QuerySlicer<'a> {
    executor: &'a QueryExecutor,
    template: QueryTemplate,
    page_size: u64,
    offset: u64,
    buffer: VecDeque<Binding>,
    pages: u64,
    exhausted: bool,
    telemetry: Option<BotTelemetry>,
}

impl<'a> QuerySlicer<'a> {
    /// Creates a slicer positioned at offset 0.
    #[must_use]
    pub fn new(executor: &'a QueryExecutor, template: QueryTemplate, page_size: u64) -> Self {
        Self {
            executor,
            template,
            page_size: page_size.max(1),
            offset: 0,
            buffer: VecDeque::new(),
            pages: 0,
            exhausted: false,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<BotTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Offset of the next page to request.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Non-empty pages fetched so far.
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    /// Produces the next row, fetching a new page when the current one is
    /// drained. `None` means the sequence has ended.
    pub async fn next_row(&mut self) -> Result<Option<Binding>, QueryError> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            if self.exhausted {
                return Ok(None);
            }
            let query = self.template.render(self.offset, self.page_size);
            let chunk = self.executor.execute(&query).await?;
            if chunk.is_empty() {
                self.exhausted = true;
                self.log(
                    "query.slices.finished",
                    json!({ "offset": self.offset, "pages": self.pages }),
                );
                continue;
            }
            self.log(
                "query.slice.fetched",
                json!({ "offset": self.offset, "rows": chunk.len() }),
            );
            self.pages += 1;
            self.offset += self.page_size;
            self.buffer.extend(chunk);
        }
    }

    /// Consumes the slicer into a row stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Binding, QueryError>> + 'a {
        stream::try_unfold(self, |mut slicer| async move {
            let row = slicer.next_row().await?;
            Ok(row.map(|row| (row, slicer)))
        })
    }

    fn log(&self, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(LogLevel::Info, message, metadata);
        }
    }
}
