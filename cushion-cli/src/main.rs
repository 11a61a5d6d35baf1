use clap::{Parser, Subcommand, ValueEnum};
use cushion::{Connection, CushionConfig, DesignDocument, QueryOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// cushion: store documents and query them through map views
#[derive(Parser)]
#[command(name = "cushion", version, about)]
struct Cli {
    /// SQLite database file
    #[arg(long, default_value = "cushion.db")]
    db: PathBuf,

    /// YAML config file; takes precedence over --db
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Store a document, generating an id unless one is given
    Put {
        /// Document id
        #[arg(long)]
        id: Option<String>,
        /// Document body as a JSON object
        doc: Option<String>,
        /// Field values (e.g. --field n=one --field i=37)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Read the JSON body from stdin
        #[arg(long)]
        stdin: bool,
    },

    /// Get a single document by id
    Get {
        /// Document id
        id: String,
    },

    /// Delete a document
    Delete {
        /// Document id
        id: String,
    },

    /// Manage design documents
    Design {
        #[command(subcommand)]
        command: DesignCommand,
    },

    /// Query a view
    Query {
        /// Design name
        design: String,
        /// View name
        view: String,
        /// Exact key (JSON, or a bare string)
        #[arg(long, value_parser = parse_key)]
        key: Option<serde_json::Value>,
        /// Range start (JSON, or a bare string)
        #[arg(long, value_parser = parse_key)]
        startkey: Option<serde_json::Value>,
        /// Range end (JSON, or a bare string)
        #[arg(long, value_parser = parse_key)]
        endkey: Option<serde_json::Value>,
        #[arg(long)]
        descending: bool,
        /// Attach each row's document
        #[arg(long)]
        include_docs: bool,
        #[arg(long)]
        limit: Option<usize>,
        /// Abort the map phase after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum DesignCommand {
    /// Register a design from a JSON or YAML file
    Load {
        /// Design name
        name: String,
        /// Design file
        file: PathBuf,
    },

    /// Register every *.json / *.yaml / *.yml file in a directory, named by file stem
    Sync {
        /// Directory of design files
        dir: PathBuf,
    },

    /// Remove every view of a design
    Drop {
        /// Design name
        name: String,
    },

    /// List registered views
    List,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// JSON when it parses, otherwise the raw text as a string key
fn parse_key(s: &str) -> Result<serde_json::Value, String> {
    Ok(json_or_string(s))
}

fn json_or_string(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn open(cli: &Cli) -> CliResult<Arc<dyn Connection>> {
    let config = match &cli.config {
        Some(path) => CushionConfig::load(path)?,
        None => CushionConfig::sqlite(&cli.db),
    };
    Ok(cushion::open(&config)?)
}

fn run(cli: Cli) -> CliResult<()> {
    let conn = open(&cli)?;

    match cli.command {
        Command::Put {
            id,
            doc,
            fields,
            stdin,
        } => {
            let body = read_body(doc, &fields, stdin)?;
            let (id, cas) = conn.set(id.as_deref(), body)?;
            print_output(
                &serde_json::json!({ "id": id, "cas": cas.to_string() }),
                &cli.format,
            )?;
        }

        Command::Get { id } => {
            let doc = conn.get(&id)?;
            print_output(&serde_json::Value::Object(doc), &cli.format)?;
        }

        Command::Delete { id } => {
            conn.delete(&id)?;
            print_output(&serde_json::json!({ "ok": true, "deleted": id }), &cli.format)?;
        }

        Command::Design { command } => match command {
            DesignCommand::Load { name, file } => {
                let doc = DesignDocument::load(&file)?;
                conn.register_design(&name, &doc)?;
                let views: Vec<&String> = doc.views.keys().collect();
                print_output(
                    &serde_json::json!({ "ok": true, "design": name, "views": views }),
                    &cli.format,
                )?;
            }
            DesignCommand::Sync { dir } => {
                let loaded = sync_designs(conn.as_ref(), &dir)?;
                print_output(&serde_json::json!({ "ok": true, "designs": loaded }), &cli.format)?;
            }
            DesignCommand::Drop { name } => {
                let removed = conn.unregister_design(&name)?;
                print_output(
                    &serde_json::json!({ "ok": true, "design": name, "removed": removed }),
                    &cli.format,
                )?;
            }
            DesignCommand::List => {
                print_output(&serde_json::json!(conn.view_keys()), &cli.format)?;
            }
        },

        Command::Query {
            design,
            view,
            key,
            startkey,
            endkey,
            descending,
            include_docs,
            limit,
            timeout_ms,
        } => {
            let mut options = QueryOptions {
                key,
                startkey,
                endkey,
                descending,
                include_docs,
                limit,
                deadline: None,
            };
            if let Some(ms) = timeout_ms {
                options = options.timeout(Duration::from_millis(ms));
            }

            let result = conn.query(&design, &view, &options)?;
            print_output(&serde_json::to_value(&result)?, &cli.format)?;
        }
    }

    Ok(())
}

/// Register each design file in `dir`; returns the design names
fn sync_designs(conn: &dyn Connection, dir: &Path) -> CliResult<Vec<String>> {
    let mut files = Vec::new();
    for ext in ["json", "yaml", "yml"] {
        let pattern = dir.join(format!("*.{ext}"));
        for entry in glob::glob(&pattern.to_string_lossy())? {
            files.push(entry?);
        }
    }
    files.sort();

    let mut names = Vec::new();
    for file in files {
        let Some(name) = file.file_stem().and_then(|s| s.to_str()) else {
            log::warn!("skipping design file with unusable name: {}", file.display());
            continue;
        };
        let doc = DesignDocument::load(&file)
            .map_err(|e| format!("Failed to load design file '{}': {e}", file.display()))?;
        conn.register_design(name, &doc)?;
        log::info!("synced design {name} from {}", file.display());
        names.push(name.to_string());
    }
    Ok(names)
}

fn read_body(
    doc: Option<String>,
    fields: &[(String, String)],
    stdin: bool,
) -> CliResult<cushion::Document> {
    let mut body = match (doc, stdin) {
        (Some(text), _) => parse_object(&text)?,
        (None, true) => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            parse_object(&text)?
        }
        (None, false) => cushion::Document::new(),
    };

    for (key, val) in fields {
        // numbers, booleans, arrays and objects are taken as JSON
        body.insert(key.clone(), json_or_string(val));
    }
    Ok(body)
}

fn parse_object(text: &str) -> CliResult<cushion::Document> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    Ok(cushion::document::into_document(value)?)
}

fn print_output(value: &serde_json::Value, format: &OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key_accepts_json_and_bare_strings() {
        assert_eq!(parse_key(r#"["z9", 37]"#).unwrap(), json!(["z9", 37]));
        assert_eq!(parse_key("37").unwrap(), json!(37));
        assert_eq!(parse_key("one").unwrap(), json!("one"));
        assert_eq!(parse_key("null").unwrap(), json!(null));
    }

    #[test]
    fn test_read_body_merges_fields() {
        let fields = vec![
            ("i".to_string(), "37".to_string()),
            ("n".to_string(), "one".to_string()),
        ];
        let body = read_body(Some(r#"{"type": "boogie"}"#.into()), &fields, false).unwrap();
        assert_eq!(
            serde_json::Value::Object(body),
            json!({"type": "boogie", "n": "one", "i": 37})
        );

        assert!(read_body(Some("[1, 2]".into()), &[], false).is_err());
    }

    #[test]
    fn test_sync_designs_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("boogie.yaml"),
            "views:\n  by_n:\n    map: \"function(doc) { emit(doc.n) }\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("other.json"),
            r#"{"views": {"all": {"map": "function(doc, meta) { emit(meta._id) }"}}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let conn = cushion::MemConnection::new();
        let names = sync_designs(&conn, dir.path()).unwrap();
        assert_eq!(names, vec!["boogie", "other"]);
        assert_eq!(conn.view_keys(), vec!["boogie/by_n", "other/all"]);
    }

    #[test]
    fn test_cli_parses_query_flags() {
        let cli = Cli::try_parse_from([
            "cushion",
            "--format",
            "json",
            "query",
            "boogie",
            "by_n",
            "--startkey",
            "one",
            "--endkey",
            "one",
            "--include-docs",
            "--limit",
            "5",
        ])
        .unwrap();
        match cli.command {
            Command::Query {
                startkey,
                include_docs,
                limit,
                ..
            } => {
                assert_eq!(startkey, Some(json!("one")));
                assert!(include_docs);
                assert_eq!(limit, Some(5));
            }
            _ => panic!("expected query command"),
        }
    }
}
