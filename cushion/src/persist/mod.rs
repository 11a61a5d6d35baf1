//! Storage interface and its backends.
//!
//! A [`Connection`] owns the documents and the registered views. Query
//! execution is shared: every backend hands itself to
//! [`run_query`](crate::query::run_query) as a [`DocumentSource`].

pub mod mem;
pub mod sqlite;

pub use mem::MemConnection;
pub use sqlite::SqliteConnection;

use crate::config::{BackendConfig, CushionConfig};
use crate::document::{Cas, Document};
use crate::error::Result;
use crate::query::{DocumentSource, QueryOptions, ViewResult};
use crate::view::{DesignDocument, MapFn};
use std::sync::Arc;

/// A handle to a document store with views.
///
/// Handles are passed explicitly; there is no process-wide active connection.
pub trait Connection: DocumentSource + Send + Sync {
    /// Fetch a document, failing with `NotFound` if it does not exist
    fn get(&self, id: &str) -> Result<Document>;

    /// Store `doc` under `id`, or under a fresh id when `id` is `None`.
    /// Existing documents are overwritten.
    fn set(&self, id: Option<&str>, doc: Document) -> Result<(String, Cas)>;

    /// Remove a document, failing with `NotFound` if it does not exist
    fn delete(&self, id: &str) -> Result<()>;

    fn query(&self, design: &str, view: &str, options: &QueryOptions) -> Result<ViewResult>;

    /// Compile and register every view of `doc` under `design`
    fn register_design(&self, design: &str, doc: &DesignDocument) -> Result<()>;

    fn register_view(
        &self,
        design: &str,
        name: &str,
        map: &str,
        reduce: Option<&str>,
    ) -> Result<()> {
        let doc = DesignDocument::new().with_view(name, map, reduce);
        self.register_design(design, &doc)
    }

    /// Register a view whose map function is a Rust closure
    fn register_native(&self, design: &str, name: &str, map: MapFn) -> Result<()>;

    /// Drop every view of `design`; returns how many views were removed
    fn unregister_design(&self, design: &str) -> Result<usize>;

    /// Registered views as `design/view` keys
    fn view_keys(&self) -> Vec<String>;
}

/// Open the backend described by `config`.
pub fn open(config: &CushionConfig) -> Result<Arc<dyn Connection>> {
    config.validate()?;
    let settings = config.map_settings();

    let conn: Arc<dyn Connection> = match &config.backend {
        BackendConfig::Memory => {
            Arc::new(MemConnection::with_settings(config.id_strategy, settings))
        }
        BackendConfig::Sqlite { path } => {
            log::debug!("opening sqlite store at {}", path.display());
            Arc::new(SqliteConnection::open(path, config.id_strategy, settings)?)
        }
    };
    Ok(conn)
}

#[cfg(test)]
pub(crate) mod tests {
    //! Behaviour every backend must share

    use super::*;
    use crate::error::CushionError;
    use crate::view::Emitter;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    pub(crate) fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    pub(crate) fn check_round_trip(conn: &dyn Connection) {
        let body = doc(json!({"n": "one", "tags": ["a", "b"], "nested": {"x": 1.5}}));
        let (id, _) = conn.set(None, body.clone()).unwrap();
        assert_eq!(conn.get(&id).unwrap(), body);

        conn.delete(&id).unwrap();
        assert!(matches!(conn.get(&id), Err(CushionError::NotFound(_))));
        assert!(matches!(conn.delete(&id), Err(CushionError::NotFound(_))));
    }

    pub(crate) fn check_overwrite_changes_cas(conn: &dyn Connection) {
        let (id, first) = conn.set(Some("fixed"), doc(json!({"v": 1}))).unwrap();
        assert_eq!(id, "fixed");
        let (_, second) = conn.set(Some("fixed"), doc(json!({"v": 2}))).unwrap();
        assert_ne!(first, second);
        assert_eq!(conn.get("fixed").unwrap(), doc(json!({"v": 2})));
    }

    pub(crate) fn check_boogie_scenario(conn: &dyn Connection) {
        let (a, _) = conn
            .set(None, doc(json!({"type": "boogie", "n": "one"})))
            .unwrap();
        conn.set(None, doc(json!({"type": "boogie", "n": "two"})))
            .unwrap();
        conn.register_view(
            "boogie",
            "by_n",
            "function(doc, meta) { if (doc.type == 'boogie') { emit(doc.n, null); } }",
            None,
        )
        .unwrap();

        let options = QueryOptions::new()
            .startkey("one")
            .endkey("one")
            .include_docs(true);
        let result = conn.query("boogie", "by_n", &options).unwrap();
        assert_eq!(result.len(), 1);
        let row = &result.rows[0];
        assert_eq!(row.key, json!("one"));
        assert_eq!(row.id, a);
        assert_eq!(row.doc, Some(doc(json!({"type": "boogie", "n": "one"}))));
    }

    pub(crate) fn check_views_lifecycle(conn: &dyn Connection) {
        conn.register_view("d", "a", "function(doc) { emit(1) }", None)
            .unwrap();
        conn.register_native(
            "d",
            "native",
            Arc::new(|_: &Document, id: &str, emit: &mut Emitter| {
                emit.emit(id, Value::Null);
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(conn.view_keys(), vec!["d/a".to_string(), "d/native".to_string()]);

        assert_eq!(conn.unregister_design("d").unwrap(), 2);
        let err = conn.query("d", "a", &QueryOptions::new()).unwrap_err();
        assert!(matches!(err, CushionError::ViewNotFound { .. }));
    }

    #[test]
    fn test_open_memory_backend() {
        let conn = open(&CushionConfig::default()).unwrap();
        check_round_trip(conn.as_ref());
        check_boogie_scenario(conn.as_ref());
    }

    #[test]
    fn test_open_sqlite_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = CushionConfig::sqlite(dir.path().join("store.db"));
        let conn = open(&config).unwrap();
        check_round_trip(conn.as_ref());
        check_views_lifecycle(conn.as_ref());
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let config = CushionConfig {
            map_workers: 0,
            ..CushionConfig::default()
        };
        assert!(matches!(open(&config), Err(CushionError::Config(_))));
    }
}
