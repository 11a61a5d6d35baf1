//! Typed documents on top of a [`Connection`].
//!
//! A model is a plain serde struct with a document type tag. Saving writes the
//! struct's fields plus `type`; loading checks the tag and strips it again.

use crate::document::{into_document, Cas, Document};
use crate::error::{CushionError, Result};
use crate::persist::Connection;
use crate::query::{QueryOptions, ViewResult};
use crate::view::DesignDocument;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Field holding a document's model type
pub const TYPE_FIELD: &str = "type";

pub trait Model: Serialize + DeserializeOwned {
    /// Value stored in the `type` field
    const DOC_TYPE: &'static str;

    /// Views declared by this model, registered through [`sync_all`]
    fn views() -> Vec<View> {
        Vec::new()
    }
}

/// A model value together with its storage identity
#[derive(Debug, Clone, PartialEq)]
pub struct Instance<M> {
    pub id: Option<String>,
    /// Version token of the last save made through this instance
    pub cas: Option<Cas>,
    pub data: M,
}

impl<M: Model> Instance<M> {
    /// An unsaved instance; `save` assigns its id
    pub fn new(data: M) -> Self {
        Instance {
            id: None,
            cas: None,
            data,
        }
    }

    pub fn with_id(id: impl Into<String>, data: M) -> Self {
        Instance {
            id: Some(id.into()),
            cas: None,
            data,
        }
    }

    /// Write the instance, creating an id on first save.
    pub fn save(&mut self, conn: &dyn Connection) -> Result<&str> {
        let mut body = into_document(serde_json::to_value(&self.data)?)?;
        body.insert(
            TYPE_FIELD.to_string(),
            serde_json::Value::String(M::DOC_TYPE.to_string()),
        );

        let (id, cas) = conn.set(self.id.as_deref(), body)?;
        self.cas = Some(cas);
        Ok(self.id.insert(id).as_str())
    }

    pub fn load(conn: &dyn Connection, id: &str) -> Result<Self> {
        let doc = conn.get(id)?;
        Self::from_document(id, doc)
    }

    /// Build an instance from a stored body.
    ///
    /// Fails with `DocTypeNotFound` if the body has no `type`, and with
    /// `DocTypeMismatch` if it belongs to another model. Fields stored as
    /// `null` are dropped so serde defaults apply to them.
    pub fn from_document(id: &str, mut doc: Document) -> Result<Self> {
        match doc.remove(TYPE_FIELD) {
            None => return Err(CushionError::DocTypeNotFound(id.to_string())),
            Some(serde_json::Value::String(found)) if found == M::DOC_TYPE => {}
            Some(other) => {
                let found = match other {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                return Err(CushionError::DocTypeMismatch {
                    expected: M::DOC_TYPE.to_string(),
                    found,
                });
            }
        }
        doc.retain(|_, v| !v.is_null());

        let data = serde_json::from_value(serde_json::Value::Object(doc))?;
        Ok(Instance::with_id(id, data))
    }

    pub fn delete(self, conn: &dyn Connection) -> Result<()> {
        match &self.id {
            Some(id) => conn.delete(id),
            None => Err(CushionError::NotFound("instance was never saved".into())),
        }
    }
}

/// A view declaration: where it lives and how it maps
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub design: String,
    pub name: String,
    pub map: String,
    pub reduce: Option<String>,
}

impl View {
    pub fn new(design: &str, name: &str, map: &str) -> Self {
        View {
            design: design.to_string(),
            name: name.to_string(),
            map: map.to_string(),
            reduce: None,
        }
    }

    pub fn with_reduce(mut self, reduce: &str) -> Self {
        self.reduce = Some(reduce.to_string());
        self
    }

    /// Raw rows of the view
    pub fn query(&self, conn: &dyn Connection, options: &QueryOptions) -> Result<ViewResult> {
        conn.query(&self.design, &self.name, options)
    }

    /// Rows hydrated into model instances; `include_docs` is forced on.
    pub fn fetch<M: Model>(
        &self,
        conn: &dyn Connection,
        options: &QueryOptions,
    ) -> Result<Vec<Instance<M>>> {
        let options = options.clone().include_docs(true);
        let result = self.query(conn, &options)?;

        let mut out = Vec::with_capacity(result.len());
        for row in result {
            let doc = row
                .doc
                .ok_or_else(|| CushionError::DanglingReference(row.id.clone()))?;
            out.push(Instance::from_document(&row.id, doc)?);
        }
        Ok(out)
    }
}

/// Group view declarations by design and register each design once.
pub fn sync_all(conn: &dyn Connection, views: &[View]) -> Result<()> {
    let mut designs: BTreeMap<&str, DesignDocument> = BTreeMap::new();
    for view in views {
        let doc = designs.remove(view.design.as_str()).unwrap_or_default();
        let doc = doc.with_view(&view.name, &view.map, view.reduce.as_deref());
        designs.insert(view.design.as_str(), doc);
    }

    for (design, doc) in &designs {
        log::debug!("syncing design {design} ({} views)", doc.views.len());
        conn.register_design(design, doc)?;
    }
    Ok(())
}
