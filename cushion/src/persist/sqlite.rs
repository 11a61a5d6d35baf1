// SQLite backend: documents and design sources survive restarts

use super::Connection;
use crate::document::{into_document, Cas, Document, IdStrategy};
use crate::error::{CushionError, Result};
use crate::query::{run_query, DocumentSource, MapSettings, QueryOptions, ViewResult};
use crate::view::{DesignDocument, MapFn, ViewRegistry, ViewSource};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A durable store backed by one SQLite database.
///
/// Script views are persisted and recompiled when the database is reopened.
/// Native views live only as long as the connection.
pub struct SqliteConnection {
    conn: Mutex<rusqlite::Connection>,
    registry: ViewRegistry,
    id_strategy: IdStrategy,
    settings: MapSettings,
}

impl SqliteConnection {
    /// Open or create the database at the given path.
    pub fn open(path: &Path, id_strategy: IdStrategy, settings: MapSettings) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(rusqlite::Connection::open(path)?, id_strategy, settings)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(
            rusqlite::Connection::open_in_memory()?,
            IdStrategy::default(),
            MapSettings::default(),
        )
    }

    fn from_connection(
        conn: rusqlite::Connection,
        id_strategy: IdStrategy,
        settings: MapSettings,
    ) -> Result<Self> {
        let db = SqliteConnection {
            conn: Mutex::new(conn),
            registry: ViewRegistry::new(),
            id_strategy,
            settings,
        };
        db.initialize_tables()?;
        db.load_designs()?;
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                data_json TEXT NOT NULL,
                cas INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS designs (
                design TEXT NOT NULL,
                view TEXT NOT NULL,
                map_src TEXT NOT NULL,
                reduce_src TEXT,
                PRIMARY KEY (design, view)
            );

            CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Recompile every stored design into the registry
    fn load_designs(&self) -> Result<()> {
        let mut designs: BTreeMap<String, DesignDocument> = BTreeMap::new();
        {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT design, view, map_src, reduce_src FROM designs ORDER BY design, view",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;
            for row in rows {
                let (design, view, map, reduce) = row?;
                designs
                    .entry(design)
                    .or_default()
                    .views
                    .insert(view, ViewSource { map, reduce });
            }
        }

        for (name, doc) in &designs {
            self.registry.register_design(name, doc)?;
        }
        if !designs.is_empty() {
            log::debug!("loaded {} stored designs", designs.len());
        }
        Ok(())
    }

    /// Stored source of one design, if any view of it was persisted
    pub fn design_document(&self, design: &str) -> Result<Option<DesignDocument>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT view, map_src, reduce_src FROM designs WHERE design = ?1")?;
        let rows = stmt.query_map(params![design], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ViewSource {
                    map: row.get(1)?,
                    reduce: row.get(2)?,
                },
            ))
        })?;

        let mut doc = DesignDocument::new();
        for row in rows {
            let (view, source) = row?;
            doc.views.insert(view, source);
        }
        Ok(if doc.views.is_empty() { None } else { Some(doc) })
    }

    fn next_cas(conn: &rusqlite::Connection) -> Result<Cas> {
        let value: i64 = conn.query_row(
            "INSERT INTO counters (name, value) VALUES ('cas', 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1
             RETURNING value",
            [],
            |row| row.get(0),
        )?;
        Ok(Cas(value as u64))
    }
}

impl DocumentSource for SqliteConnection {
    fn document_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id FROM documents ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn fetch(&self, id: &str) -> Result<Option<Document>> {
        let data_json: Option<String> = self
            .lock()
            .query_row(
                "SELECT data_json FROM documents WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match data_json {
            Some(json) => Ok(Some(into_document(serde_json::from_str(&json)?)?)),
            None => Ok(None),
        }
    }
}

impl Connection for SqliteConnection {
    fn get(&self, id: &str) -> Result<Document> {
        self.fetch(id)?
            .ok_or_else(|| CushionError::NotFound(id.to_string()))
    }

    fn set(&self, id: Option<&str>, doc: Document) -> Result<(String, Cas)> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.id_strategy.generate(),
        };
        let data_json = serde_json::to_string(&doc)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let cas = Self::next_cas(&tx)?;
        tx.execute(
            "INSERT OR REPLACE INTO documents (id, data_json, cas) VALUES (?1, ?2, ?3)",
            params![id, data_json, cas.0 as i64],
        )?;
        tx.commit()?;
        Ok((id, cas))
    }

    fn delete(&self, id: &str) -> Result<()> {
        let removed = self
            .lock()
            .execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(CushionError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn query(&self, design: &str, view: &str, options: &QueryOptions) -> Result<ViewResult> {
        let view = self.registry.get(design, view)?;
        run_query(self, &view, options, &self.settings)
    }

    fn register_design(&self, design: &str, doc: &DesignDocument) -> Result<()> {
        // compile first so a bad design is never persisted, publish only once stored
        let compiled = ViewRegistry::compile_design(design, doc)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for (view, source) in &doc.views {
            tx.execute(
                "INSERT OR REPLACE INTO designs (design, view, map_src, reduce_src) VALUES (?1, ?2, ?3, ?4)",
                params![design, view, source.map, source.reduce],
            )?;
        }
        tx.commit()?;
        drop(conn);

        self.registry.insert_compiled(compiled);
        Ok(())
    }

    fn register_native(&self, design: &str, name: &str, map: MapFn) -> Result<()> {
        self.registry.register_native(design, name, map)
    }

    fn unregister_design(&self, design: &str) -> Result<usize> {
        self.lock()
            .execute("DELETE FROM designs WHERE design = ?1", params![design])?;
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
        check_round_trip(&SqliteConnection::open_in_memory().unwrap());
    }

    #[test]
    fn test_overwrite_changes_cas() {
        check_overwrite_changes_cas(&SqliteConnection::open_in_memory().unwrap());
    }

    #[test]
    fn test_boogie_scenario() {
        check_boogie_scenario(&SqliteConnection::open_in_memory().unwrap());
    }

    #[test]
    fn test_views_lifecycle() {
        check_views_lifecycle(&SqliteConnection::open_in_memory().unwrap());
    }

    #[test]
    fn test_documents_and_designs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cushion.db");

        {
            let db = SqliteConnection::open(&path, IdStrategy::Nanoid, MapSettings::default())
                .unwrap();
            db.set(Some("a"), doc(json!({"n": "one"}))).unwrap();
            db.register_view("d", "by_n", "function(doc) { emit(doc.n) }", Some("_count"))
                .unwrap();
        }

        let db = SqliteConnection::open(&path, IdStrategy::Nanoid, MapSettings::default()).unwrap();
        assert_eq!(db.get("a").unwrap(), doc(json!({"n": "one"})));
        let result = db.query("d", "by_n", &QueryOptions::new().key("one")).unwrap();
        assert_eq!(result.ids(), vec!["a"]);

        let stored = db.design_document("d").unwrap().unwrap();
        assert_eq!(stored.views["by_n"].reduce.as_deref(), Some("_count"));
    }

    #[test]
    fn test_bad_design_is_not_persisted() {
        let db = SqliteConnection::open_in_memory().unwrap();
        let err = db
            .register_view("d", "broken", "function(doc {", None)
            .unwrap_err();
        assert!(matches!(err, CushionError::Compile { .. }));
        assert!(db.design_document("d").unwrap().is_none());
    }

    #[test]
    fn test_failed_persist_registers_nothing() {
        let db = SqliteConnection::open_in_memory().unwrap();
        db.lock().execute_batch("DROP TABLE designs").unwrap();

        let err = db
            .register_view("d", "v", "function(doc) { emit(1) }", None)
            .unwrap_err();
        assert!(matches!(err, CushionError::Sqlite(_)), "{err}");
        assert!(db.view_keys().is_empty());
        assert!(matches!(
            db.query("d", "v", &QueryOptions::new()),
            Err(CushionError::ViewNotFound { .. })
        ));
    }

    #[test]
    fn test_unregister_removes_stored_sources() {
        let db = SqliteConnection::open_in_memory().unwrap();
        db.register_view("d", "v", "function(doc) { emit(1) }", None)
            .unwrap();
        assert_eq!(db.unregister_design("d").unwrap(), 1);
        assert!(db.design_document("d").unwrap().is_none());
    }

    #[test]
    fn test_cas_is_monotonic() {
        let db = SqliteConnection::open_in_memory().unwrap();
        let (_, a) = db.set(None, doc(json!({}))).unwrap();
        let (_, b) = db.set(None, doc(json!({}))).unwrap();
        assert!(b > a);
    }
}
