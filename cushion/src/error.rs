use thiserror::Error;

#[derive(Error, Debug)]
pub enum CushionError {
    #[error("View not found: {design}/{view}")]
    ViewNotFound { design: String, view: String },

    #[error("Compile error in {design}/{view}: {message}")]
    Compile {
        design: String,
        view: String,
        message: String,
    },

    #[error("Map function {design}/{view} failed on document {doc_id}: {message}")]
    MapExecution {
        design: String,
        view: String,
        doc_id: String,
        message: String,
    },

    #[error("Dangling reference: view row points at missing document {0}")]
    DanglingReference(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Query deadline exceeded while mapping {design}/{view}")]
    DeadlineExceeded { design: String, view: String },

    #[error("Document type mismatch: expected '{expected}', found '{found}'")]
    DocTypeMismatch { expected: String, found: String },

    #[error("Document {0} has no type field")]
    DocTypeNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, CushionError>;
