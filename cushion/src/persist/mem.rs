// In-memory backend: documents in a map, views in a registry

use super::Connection;
use crate::document::{Cas, Document, IdStrategy};
use crate::error::{CushionError, Result};
use crate::query::{run_query, DocumentSource, MapSettings, QueryOptions, ViewResult};
use crate::view::{DesignDocument, MapFn, ViewRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// A volatile store, mainly for tests and embedding.
///
/// Writers to the same id race; the last write wins.
pub struct MemConnection {
    docs: RwLock<HashMap<String, Document>>,
    registry: ViewRegistry,
    next_cas: AtomicU64,
    id_strategy: IdStrategy,
    settings: MapSettings,
}

impl Default for MemConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MemConnection {
    pub fn new() -> Self {
        Self::with_settings(IdStrategy::default(), MapSettings::default())
    }

    pub fn with_settings(id_strategy: IdStrategy, settings: MapSettings) -> Self {
        MemConnection {
            docs: RwLock::new(HashMap::new()),
            registry: ViewRegistry::new(),
            next_cas: AtomicU64::new(1),
            id_strategy,
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentSource for MemConnection {
    fn document_ids(&self) -> Result<Vec<String>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = docs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn fetch(&self, id: &str) -> Result<Option<Document>> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }
}

impl Connection for MemConnection {
    fn get(&self, id: &str) -> Result<Document> {
        self.fetch(id)?
            .ok_or_else(|| CushionError::NotFound(id.to_string()))
    }

    fn set(&self, id: Option<&str>, doc: Document) -> Result<(String, Cas)> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.id_strategy.generate(),
        };
        let cas = Cas(self.next_cas.fetch_add(1, Ordering::Relaxed));
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), doc);
        Ok((id, cas))
    }

    fn delete(&self, id: &str) -> Result<()> {
        match self
            .docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
        {
            Some(_) => Ok(()),
            None => Err(CushionError::NotFound(id.to_string())),
        }
    }

    fn query(&self, design: &str, view: &str, options: &QueryOptions) -> Result<ViewResult> {
        let view = self.registry.get(design, view)?;
        run_query(self, &view, options, &self.settings)
    }

    fn register_design(&self, design: &str, doc: &DesignDocument) -> Result<()> {
        self.registry.register_design(design, doc)
    }

    fn register_native(&self, design: &str, name: &str, map: MapFn) -> Result<()> {
        self.registry.register_native(design, name, map)
    }

    fn unregister_design(&self, design: &str) -> Result<usize> {
        Ok(self.registry.unregister_design(design))
    }

    fn view_keys(&self) -> Vec<String> {
        self.registry.view_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::tests::{
        check_boogie_scenario, check_overwrite_changes_cas, check_round_trip,
        check_views_lifecycle, doc,
    };
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        check_round_trip(&MemConnection::new());
    }

    #[test]
    fn test_overwrite_changes_cas() {
        check_overwrite_changes_cas(&MemConnection::new());
    }

    #[test]
    fn test_boogie_scenario() {
        check_boogie_scenario(&MemConnection::new());
    }

    #[test]
    fn test_views_lifecycle() {
        check_views_lifecycle(&MemConnection::new());
    }

    #[test]
    fn test_generated_ids_follow_strategy() {
        let conn = MemConnection::with_settings(IdStrategy::Ulid, MapSettings::default());
        let (id, _) = conn.set(None, doc(json!({}))).unwrap();
        assert_eq!(id.len(), 26);

        let conn = MemConnection::new();
        let (a, _) = conn.set(None, doc(json!({}))).unwrap();
        let (b, _) = conn.set(None, doc(json!({}))).unwrap();
        assert_ne!(a, b);
        assert_eq!(conn.len(), 2);
    }

    #[test]
    fn test_point_query_sees_every_write() {
        let conn = MemConnection::new();
        conn.register_view("t", "by_n", "function(doc) { emit(doc.n, doc.v) }", None)
            .unwrap();

        for v in 0..5 {
            let (id, _) = conn.set(None, doc(json!({"n": "k", "v": v}))).unwrap();
            let result = conn
                .query("t", "by_n", &QueryOptions::new().key("k"))
                .unwrap();
            assert!(result.ids().contains(&id.as_str()));
            assert_eq!(result.len(), v + 1);
        }
    }

    #[test]
    fn test_hydration_after_delete_is_dangling() {
        // The map phase and hydration read the store separately, so a row can
        // outlive its document when a native map function deletes mid-query.
        let conn = std::sync::Arc::new(MemConnection::new());
        conn.set(Some("victim"), doc(json!({}))).unwrap();

        let handle = std::sync::Arc::downgrade(&conn);
        conn.register_native(
            "t",
            "v",
            std::sync::Arc::new(move |_: &Document, id: &str, emit: &mut crate::view::Emitter| {
                emit.emit(id, serde_json::Value::Null);
                if let Some(conn) = handle.upgrade() {
                    conn.docs.write().unwrap().remove(id);
                }
                Ok(())
            }),
        )
        .unwrap();

        let err = conn
            .query("t", "v", &QueryOptions::new().include_docs(true))
            .unwrap_err();
        assert!(matches!(err, CushionError::DanglingReference(id) if id == "victim"));
    }
}
