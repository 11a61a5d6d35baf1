//! Sandboxed interpreter for map functions written in a small JavaScript subset.
//!
//! Source is parsed once into an [`ast::FunctionDef`]; each document is then
//! mapped by a fresh evaluation with its own copy of the document. The only
//! globals are `emit` and a handful of pure builtins.

pub mod ast;
mod eval;
pub mod lexer;
mod parser;
mod value;

pub use eval::{Emitted, RuntimeError};
pub use lexer::SyntaxError;

use std::sync::Arc;

/// A compiled map function, shareable across worker threads
#[derive(Debug, Clone)]
pub struct Script {
    def: Arc<ast::FunctionDef>,
    source: String,
}

impl Script {
    /// Parse `source`, which must be a single `function (doc, meta) { ... }` expression.
    pub fn compile(source: &str) -> Result<Self, SyntaxError> {
        let def = parser::parse_map_function(source)?;
        Ok(Script {
            def: Arc::new(def),
            source: source.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn params(&self) -> &[String] {
        &self.def.params
    }

    /// Run the function against one document and return what it emitted, in call order.
    pub fn invoke(
        &self,
        doc: &serde_json::Map<String, serde_json::Value>,
        doc_id: &str,
        step_limit: u64,
    ) -> Result<Emitted, RuntimeError> {
        eval::invoke_map(&self.def, doc, doc_id, step_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compile_and_invoke() {
        let script = Script::compile("function (doc, meta) { emit(doc.n, meta._id); };").unwrap();
        assert_eq!(script.params(), ["doc".to_string(), "meta".to_string()]);
        let doc = json!({"n": "one"});
        let emitted = script.invoke(doc.as_object().unwrap(), "a", 1_000).unwrap();
        assert_eq!(emitted, vec![(json!("one"), json!("a"))]);
    }

    #[test]
    fn test_compile_rejects_non_function_source() {
        assert!(Script::compile("emit(1)").is_err());
        assert!(Script::compile("").is_err());
        assert!(Script::compile("function(doc) { emit(1) } extra").is_err());
    }

    #[test]
    fn test_script_is_shareable_across_threads() {
        let script = Script::compile("function(doc) { emit(doc.i * 2) }").unwrap();
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let script = &script;
                    scope.spawn(move || {
                        let doc = json!({ "i": i });
                        script.invoke(doc.as_object().unwrap(), "x", 1_000).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[3], vec![(json!(6), json!(null))]);
    }
}
