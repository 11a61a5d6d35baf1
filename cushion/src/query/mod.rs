//! Query engine: map every document, filter and order the emissions, hydrate rows.
//!
//! The index is never stored. Each query lists the current document ids, runs
//! the view's map function over them, then plans and materializes the result.
//! Documents are fetched one at a time, so a query running alongside writers
//! may observe any subset of those writes.

pub mod executor;
pub mod planner;
pub mod result;

pub use executor::MapSettings;
pub use result::{ViewResult, ViewRow};

use crate::document::Document;
use crate::error::Result;
use crate::view::CompiledView;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Read access to the documents a query runs over
pub trait DocumentSource {
    /// Ids of every stored document at the time of the call
    fn document_ids(&self) -> Result<Vec<String>>;

    /// The current body of `id`, or `None` if it no longer exists
    fn fetch(&self, id: &str) -> Result<Option<Document>>;
}

/// One `(key, value, id)` record produced by a map invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub key: Value,
    pub value: Value,
    pub id: String,
}

/// Options accepted by a view query.
///
/// A present `key` (even `null`) selects exact matches and the range bounds
/// are ignored. With `descending`, `startkey` is the upper bound and `endkey`
/// the lower one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    #[serde(deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub startkey: Option<Value>,
    #[serde(deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub endkey: Option<Value>,
    pub descending: bool,
    #[serde(alias = "includeDocs")]
    pub include_docs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Map phase aborts with `DeadlineExceeded` once this instant passes
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

/// Distinguishes an explicit `null` from an absent field
fn deserialize_some<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<Value>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn startkey(mut self, key: impl Into<Value>) -> Self {
        self.startkey = Some(key.into());
        self
    }

    pub fn endkey(mut self, key: impl Into<Value>) -> Self {
        self.endkey = Some(key.into());
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    pub fn include_docs(mut self, include_docs: bool) -> Self {
        self.include_docs = include_docs;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }
}

/// Run `view` over every document in `source` and answer `options`.
pub fn run_query<S>(
    source: &S,
    view: &CompiledView,
    options: &QueryOptions,
    settings: &MapSettings,
) -> Result<ViewResult>
where
    S: DocumentSource + Sync + ?Sized,
{
    let emissions = executor::map_documents(source, view, settings, options.deadline)?;
    let mapped = emissions.len();

    let rows = planner::plan(emissions, options);
    log::debug!(
        "query {}/{}: {} emitted, {} selected (key={:?} startkey={:?} endkey={:?} descending={} limit={:?})",
        view.design,
        view.name,
        mapped,
        rows.len(),
        options.key,
        options.startkey,
        options.endkey,
        options.descending,
        options.limit
    );

    result::materialize(source, rows, options.include_docs)
}
