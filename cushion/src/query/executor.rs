// Map phase: run a view over every document, optionally across worker threads

use super::{DocumentSource, Emission};
use crate::error::{CushionError, Result};
use crate::view::CompiledView;
use std::time::Instant;

pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

/// Tuning for the map phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSettings {
    /// Worker threads; 1 maps on the calling thread
    pub workers: usize,
    /// Interpreter steps allowed per document invocation
    pub step_limit: u64,
}

impl Default for MapSettings {
    fn default() -> Self {
        MapSettings {
            workers: 1,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }
}

/// Emissions of `view` over every document of `source`.
///
/// Ids are listed once and each document is fetched on its own, so documents
/// removed in between are skipped. Per-document emission order is kept and
/// chunks are concatenated in id-list order.
pub fn map_documents<S>(
    source: &S,
    view: &CompiledView,
    settings: &MapSettings,
    deadline: Option<Instant>,
) -> Result<Vec<Emission>>
where
    S: DocumentSource + Sync + ?Sized,
{
    let ids = source.document_ids()?;
    let workers = settings.workers.clamp(1, ids.len().max(1));

    if workers == 1 {
        return map_chunk(source, view, &ids, settings.step_limit, deadline);
    }

    let chunk_size = ids.len().div_ceil(workers);
    let step_limit = settings.step_limit;
    log::debug!(
        "mapping {} documents with {} workers for {}/{}",
        ids.len(),
        workers,
        view.design,
        view.name
    );

    let chunks: Vec<Result<Vec<Emission>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = ids
            .chunks(chunk_size)
            .map(|chunk| scope.spawn(move || map_chunk(source, view, chunk, step_limit, deadline)))
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });

    let mut out = Vec::new();
    for chunk in chunks {
        out.extend(chunk?);
    }
    Ok(out)
}

fn map_chunk<S>(
    source: &S,
    view: &CompiledView,
    ids: &[String],
    step_limit: u64,
    deadline: Option<Instant>,
) -> Result<Vec<Emission>>
where
    S: DocumentSource + ?Sized,
{
    let mut out = Vec::new();
    for id in ids {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CushionError::DeadlineExceeded {
                design: view.design.clone(),
                view: view.name.clone(),
            });
        }

        let Some(doc) = source.fetch(id)? else {
            log::debug!("document {id} disappeared before it could be mapped");
            continue;
        };

        for (key, value) in view.map_document(id, &doc, step_limit)? {
            out.push(Emission {
                key,
                value,
                id: id.clone(),
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::query::tests::Docs;
    use crate::view::{Emitter, MapFn, ViewRegistry};
    use serde_json::json;
    use std::sync::Arc;

    fn native_view(map: MapFn) -> Arc<CompiledView> {
        let registry = ViewRegistry::new();
        registry.register_native("t", "v", map).unwrap();
        registry.get("t", "v").unwrap()
    }

    /// Deletes a document the first time its neighbour is mapped
    struct Vanishing(Docs);

    impl DocumentSource for Vanishing {
        fn document_ids(&self) -> Result<Vec<String>> {
            self.0.document_ids()
        }

        fn fetch(&self, id: &str) -> Result<Option<Document>> {
            if id == "a" {
                self.0 .0.lock().unwrap().remove("b");
            }
            self.0.fetch(id)
        }
    }

    #[test]
    fn test_document_removed_before_fetch_is_skipped() {
        let docs = Vanishing(Docs::with(&[
            ("a", json!({"n": 1})),
            ("b", json!({"n": 2})),
            ("c", json!({"n": 3})),
        ]));
        let view = native_view(Arc::new(|doc: &Document, _: &str, emit: &mut Emitter| {
            emit.emit(doc["n"].clone(), json!(null));
            Ok(())
        }));

        let emissions = map_documents(&docs, &view, &MapSettings::default(), None).unwrap();
        let ids: Vec<&str> = emissions.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_emission_order_within_document_is_kept() {
        let docs = Docs::with(&[("a", json!({})), ("b", json!({}))]);
        let view = native_view(Arc::new(|_: &Document, id: &str, emit: &mut Emitter| {
            emit.emit(format!("{id}-2"), 0);
            emit.emit(format!("{id}-1"), 1);
            Ok(())
        }));

        let settings = MapSettings {
            workers: 2,
            ..MapSettings::default()
        };
        let emissions = map_documents(&docs, &view, &settings, None).unwrap();
        let keys: Vec<_> = emissions.into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![json!("a-2"), json!("a-1"), json!("b-2"), json!("b-1")]);
    }

    #[test]
    fn test_step_limit_reported_as_map_failure() {
        let docs = Docs::with(&[("spin", json!({}))]);
        let registry = ViewRegistry::new();
        registry
            .register_view("t", "v", "function(doc) { for (;;) {} }", None)
            .unwrap();
        let view = registry.get("t", "v").unwrap();

        let settings = MapSettings {
            step_limit: 500,
            ..MapSettings::default()
        };
        let err = map_documents(&docs, &view, &settings, None).unwrap_err();
        match err {
            CushionError::MapExecution { doc_id, message, .. } => {
                assert_eq!(doc_id, "spin");
                assert!(message.contains("step limit"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_store_maps_nothing() {
        let docs = Docs::default();
        let view = native_view(Arc::new(|_: &Document, _: &str, _: &mut Emitter| Ok(())));
        let settings = MapSettings {
            workers: 8,
            ..MapSettings::default()
        };
        assert!(map_documents(&docs, &view, &settings, None).unwrap().is_empty());
    }
}
