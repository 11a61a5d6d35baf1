pub mod collate;
pub mod config;
pub mod document;
pub mod error;
pub mod model;
pub mod persist;
pub mod query;
pub mod script;
pub mod view;

pub use collate::{collate, MAX_STRING};
pub use config::{BackendConfig, CushionConfig};
pub use document::{Cas, Document, IdStrategy};
pub use error::{CushionError, Result};
pub use model::{sync_all, Instance, Model, View};
pub use persist::{open, Connection, MemConnection, SqliteConnection};
pub use query::{DocumentSource, MapSettings, QueryOptions, ViewResult, ViewRow};
pub use view::{DesignDocument, Emitter, MapFn, ViewRegistry};
