//! View registry: design documents, compiled map functions and lookup by `design/view`.

use crate::document::Document;
use crate::error::{CushionError, Result};
use crate::script::Script;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// A design document as stored or loaded from a file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesignDocument {
    #[serde(default)]
    pub views: BTreeMap<String, ViewSource>,
}

/// Source of one view inside a design document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSource {
    pub map: String,
    /// Accepted and stored, never executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

impl DesignDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper adding one view
    pub fn with_view(mut self, name: &str, map: &str, reduce: Option<&str>) -> Self {
        self.views.insert(
            name.to_string(),
            ViewSource {
                map: map.to_string(),
                reduce: reduce.map(str::to_string),
            },
        );
        self
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Err(CushionError::Config(format!(
                "unsupported design file extension: {}",
                path.display()
            ))),
        }
    }
}

// ── Map functions ───────────────────────────────────────────────

/// Collects the pairs a native map function emits for one document
#[derive(Debug, Default)]
pub struct Emitter {
    rows: Vec<(serde_json::Value, serde_json::Value)>,
}

impl Emitter {
    pub fn emit(&mut self, key: impl Into<serde_json::Value>, value: impl Into<serde_json::Value>) {
        self.rows.push((key.into(), value.into()));
    }

    pub fn into_rows(self) -> Vec<(serde_json::Value, serde_json::Value)> {
        self.rows
    }
}

/// A map function written in Rust: `(doc, id, emitter)`
pub type MapFn =
    Arc<dyn Fn(&Document, &str, &mut Emitter) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub enum Mapper {
    Script(Script),
    Native(MapFn),
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mapper::Script(script) => f.debug_tuple("Script").field(&script.source()).finish(),
            Mapper::Native(_) => f.write_str("Native(..)"),
        }
    }
}

/// A registered view, ready to be run against documents
#[derive(Debug, Clone)]
pub struct CompiledView {
    pub design: String,
    pub name: String,
    pub mapper: Mapper,
    pub reduce: Option<String>,
}

impl CompiledView {
    /// Run the map function against one document.
    pub fn map_document(
        &self,
        doc_id: &str,
        doc: &Document,
        step_limit: u64,
    ) -> Result<Vec<(serde_json::Value, serde_json::Value)>> {
        log::trace!("mapping {} with {}/{}", doc_id, self.design, self.name);

        let outcome = match &self.mapper {
            Mapper::Script(script) => script
                .invoke(doc, doc_id, step_limit)
                .map_err(|e| e.to_string()),
            Mapper::Native(f) => {
                let mut emitter = Emitter::default();
                f(doc, doc_id, &mut emitter).map(|_| emitter.into_rows())
            }
        };

        outcome.map_err(|message| CushionError::MapExecution {
            design: self.design.clone(),
            view: self.name.clone(),
            doc_id: doc_id.to_string(),
            message,
        })
    }

    /// The map source, when the view was registered from script
    pub fn map_source(&self) -> Option<&str> {
        match &self.mapper {
            Mapper::Script(script) => Some(script.source()),
            Mapper::Native(_) => None,
        }
    }
}

// ── Registry ────────────────────────────────────────────────────

const NAME_PATTERN: &str = r"^[A-Za-z0-9_.\-]+$";

fn name_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(pattern) = PATTERN.get() {
        return Ok(pattern);
    }
    let pattern = Regex::new(NAME_PATTERN).map_err(|e| CushionError::Config(e.to_string()))?;
    Ok(PATTERN.get_or_init(|| pattern))
}

/// Design and view names become `design/view` keys, so they may not contain `/`.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name_pattern()?.is_match(name) {
        Ok(())
    } else {
        Err(CushionError::InvalidName(format!(
            "{kind} name '{name}' must match [A-Za-z0-9_.-]+"
        )))
    }
}

fn view_key(design: &str, view: &str) -> String {
    format!("{design}/{view}")
}

/// Compiled views keyed by `design/view`
#[derive(Default)]
pub struct ViewRegistry {
    views: RwLock<HashMap<String, Arc<CompiledView>>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every view of `doc` and register them under `design`.
    /// Nothing is registered if any view fails to compile.
    pub fn register_design(&self, design: &str, doc: &DesignDocument) -> Result<()> {
        let compiled = Self::compile_design(design, doc)?;
        self.insert_compiled(compiled);
        Ok(())
    }

    /// Compile every view of `doc` without touching the registry.
    pub fn compile_design(design: &str, doc: &DesignDocument) -> Result<Vec<CompiledView>> {
        validate_name("design", design)?;

        let mut compiled = Vec::with_capacity(doc.views.len());
        for (name, source) in &doc.views {
            validate_name("view", name)?;
            let script = Script::compile(source.map.trim()).map_err(|e| CushionError::Compile {
                design: design.to_string(),
                view: name.clone(),
                message: e.to_string(),
            })?;
            if source.reduce.is_some() {
                log::warn!("reduce function for {design}/{name} is stored but never executed");
            }
            compiled.push(CompiledView {
                design: design.to_string(),
                name: name.clone(),
                mapper: Mapper::Script(script),
                reduce: source.reduce.clone(),
            });
        }
        Ok(compiled)
    }

    /// Make views produced by [`ViewRegistry::compile_design`] visible to queries.
    pub fn insert_compiled(&self, compiled: Vec<CompiledView>) {
        let mut views = self.views.write().unwrap_or_else(PoisonError::into_inner);
        for view in compiled {
            log::debug!("registered view {}/{}", view.design, view.name);
            views.insert(view_key(&view.design, &view.name), Arc::new(view));
        }
    }

    /// Register a single script view; shorthand for a one-view design
    pub fn register_view(
        &self,
        design: &str,
        name: &str,
        map: &str,
        reduce: Option<&str>,
    ) -> Result<()> {
        let doc = DesignDocument::new().with_view(name, map, reduce);
        self.register_design(design, &doc)
    }

    /// Register a view backed by a Rust closure
    pub fn register_native(&self, design: &str, name: &str, map: MapFn) -> Result<()> {
        validate_name("design", design)?;
        validate_name("view", name)?;

        let view = CompiledView {
            design: design.to_string(),
            name: name.to_string(),
            mapper: Mapper::Native(map),
            reduce: None,
        };
        log::debug!("registered native view {design}/{name}");
        self.views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(view_key(design, name), Arc::new(view));
        Ok(())
    }

    /// Remove every view of `design`; returns how many were removed
    pub fn unregister_design(&self, design: &str) -> usize {
        let prefix = format!("{design}/");
        let mut views = self.views.write().unwrap_or_else(PoisonError::into_inner);
        let before = views.len();
        views.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - views.len();
        log::debug!("unregistered design {design} ({removed} views)");
        removed
    }

    pub fn get(&self, design: &str, view: &str) -> Result<Arc<CompiledView>> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&view_key(design, view))
            .cloned()
            .ok_or_else(|| CushionError::ViewNotFound {
                design: design.to_string(),
                view: view.to_string(),
            })
    }

    /// All registered `design/view` keys, sorted
    pub fn view_keys(&self) -> Vec<String> {
        let views = self.views.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = views.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BY_N: &str = "function(doc) { if (doc.type == 'boogie') emit(doc.n, null) }";

    #[test]
    fn test_register_and_lookup() {
        let registry = ViewRegistry::new();
        registry.register_view("boogie", "by_n", BY_N, None).unwrap();

        let view = registry.get("boogie", "by_n").unwrap();
        assert_eq!(view.map_source(), Some(BY_N));

        let err = registry.get("boogie", "missing").unwrap_err();
        assert!(matches!(err, CushionError::ViewNotFound { .. }));
    }

    #[test]
    fn test_compile_error_registers_nothing() {
        let registry = ViewRegistry::new();
        let doc = DesignDocument::new()
            .with_view("good", BY_N, None)
            .with_view("bad", "function(doc { emit(1) }", None);

        let err = registry.register_design("d", &doc).unwrap_err();
        match err {
            CushionError::Compile { design, view, .. } => {
                assert_eq!(design, "d");
                assert_eq!(view, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.view_keys().is_empty());
    }

    #[test]
    fn test_deeply_nested_source_is_a_compile_error() {
        let registry = ViewRegistry::new();
        let map = format!(
            "function(doc) {{ emit({}1{}) }}",
            "(".repeat(20_000),
            ")".repeat(20_000)
        );
        let err = registry.register_view("d", "v", &map, None).unwrap_err();
        match err {
            CushionError::Compile { message, .. } => {
                assert!(message.contains("nesting exceeds"), "{message}")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.view_keys().is_empty());
    }

    #[test]
    fn test_compile_design_stages_without_registering() {
        let registry = ViewRegistry::new();
        let doc = DesignDocument::new().with_view("by_n", BY_N, None);
        let compiled = ViewRegistry::compile_design("d", &doc).unwrap();
        assert_eq!(compiled.len(), 1);
        assert!(registry.view_keys().is_empty());

        registry.insert_compiled(compiled);
        assert_eq!(registry.view_keys(), vec!["d/by_n".to_string()]);
    }

    #[test]
    fn test_unregister_design_uses_prefix() {
        let registry = ViewRegistry::new();
        registry.register_view("a", "one", BY_N, None).unwrap();
        registry.register_view("a", "two", BY_N, None).unwrap();
        registry.register_view("ab", "one", BY_N, None).unwrap();

        assert_eq!(registry.unregister_design("a"), 2);
        assert_eq!(registry.view_keys(), vec!["ab/one".to_string()]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let registry = ViewRegistry::new();
        let err = registry.register_view("a/b", "v", BY_N, None).unwrap_err();
        assert!(matches!(err, CushionError::InvalidName(_)));
        let err = registry.register_view("a", "", BY_N, None).unwrap_err();
        assert!(matches!(err, CushionError::InvalidName(_)));
    }

    #[test]
    fn test_native_view_and_map_errors() {
        let registry = ViewRegistry::new();
        let map: MapFn = Arc::new(|doc: &Document, id: &str, emit: &mut Emitter| -> std::result::Result<(), String> {
            let n = doc.get("n").ok_or("missing n")?;
            emit.emit(n.clone(), id);
            Ok(())
        });
        registry.register_native("native", "by_n", map).unwrap();
        let view = registry.get("native", "by_n").unwrap();

        let doc = json!({"n": 1});
        let rows = view.map_document("x", doc.as_object().unwrap(), 100).unwrap();
        assert_eq!(rows, vec![(json!(1), json!("x"))]);

        let err = view.map_document("y", &Document::new(), 100).unwrap_err();
        match err {
            CushionError::MapExecution { doc_id, message, .. } => {
                assert_eq!(doc_id, "y");
                assert_eq!(message, "missing n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_design_document_formats() {
        let yaml = "views:\n  by_n:\n    map: \"function(doc) { emit(doc.n) }\"\n    reduce: _count\n";
        let doc = DesignDocument::from_yaml_str(yaml).unwrap();
        assert_eq!(doc.views["by_n"].reduce.as_deref(), Some("_count"));

        let json = serde_json::to_string(&doc).unwrap();
        assert_eq!(DesignDocument::from_json_str(&json).unwrap(), doc);
    }
}
