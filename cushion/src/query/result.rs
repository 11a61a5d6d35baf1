use super::{DocumentSource, Emission};
use crate::document::Document;
use crate::error::{CushionError, Result};
use serde::Serialize;
use serde_json::Value;

/// One row of a view query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewRow {
    pub key: Value,
    pub value: Value,
    pub id: String,
    /// Present when the query asked for `include_docs`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

/// Ordered rows answering a view query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewResult {
    pub rows: Vec<ViewRow>,
    #[serde(skip)]
    pub include_docs: bool,
}

impl ViewResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ViewRow> {
        self.rows.iter()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.rows.iter().map(|r| r.key.clone()).collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.id.as_str()).collect()
    }
}

impl IntoIterator for ViewResult {
    type Item = ViewRow;
    type IntoIter = std::vec::IntoIter<ViewRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a ViewResult {
    type Item = &'a ViewRow;
    type IntoIter = std::slice::Iter<'a, ViewRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Turn planned emissions into rows, fetching each document when `include_docs` is set.
/// A document that vanished since it was mapped is a `DanglingReference`.
pub fn materialize<S>(source: &S, rows: Vec<Emission>, include_docs: bool) -> Result<ViewResult>
where
    S: DocumentSource + ?Sized,
{
    let mut out = Vec::with_capacity(rows.len());
    for Emission { key, value, id } in rows {
        let doc = if include_docs {
            match source.fetch(&id)? {
                Some(doc) => Some(doc),
                None => return Err(CushionError::DanglingReference(id)),
            }
        } else {
            None
        };
        out.push(ViewRow { key, value, id, doc });
    }

    Ok(ViewResult {
        rows: out,
        include_docs,
    })
}
