use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::retrieval::RetrievalStrategy;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: "data/sqlcrew.duckdb".to_string(),
            pool_size: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// USD per thousand tokens, split by direction.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct PricingConfig {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_1k: 0.00015,
            output_per_1k: 0.0006,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String, // "remote", "ollama" or "local"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
    pub pricing: PricingConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            model: "sqlcoder".to_string(),
            api_key: None,
            api_url: None,
            temperature: 0.1,
            max_tokens: 2000,
            timeout_secs: 60,
            pricing: PricingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CatalogConfig {
    /// Database schema to introspect.
    pub schema: String,
    /// Substrings (or whole `_`-separated tokens for short patterns) marking PII columns.
    pub sensitive_patterns: Vec<String>,
    /// Exact column names that are always sensitive.
    pub sensitive_columns: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        let patterns = [
            "email",
            "phone",
            "mobile",
            "ssn",
            "social_security",
            "password",
            "passwd",
            "secret",
            "token",
            "api_key",
            "credit_card",
            "card_number",
            "cvv",
            "iban",
            "account_number",
            "tax_id",
            "passport",
            "date_of_birth",
            "dob",
            "birth",
            "salary",
            "street",
            "address_line",
        ];
        Self {
            schema: "main".to_string(),
            sensitive_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            sensitive_columns: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbedderConfig {
    pub backend: String, // "hashing" or "ollama"
    pub model: String,
    pub api_url: Option<String>,
    pub dimensions: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            backend: "hashing".to_string(),
            model: "all-minilm".to_string(),
            api_url: None,
            dimensions: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub strategy: RetrievalStrategy,
    pub max_tables: usize,
    pub similarity_threshold: f32,
    pub index_path: String,
    pub embedder: EmbedderConfig,
    /// Extra synonyms merged into the built-in list, keyed by canonical schema term.
    pub synonyms: HashMap<String, Vec<String>>,
    /// Optional business descriptions used in the text each table is embedded from.
    pub table_descriptions: HashMap<String, String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            strategy: RetrievalStrategy::Keyword,
            max_tables: 5,
            similarity_threshold: 0.1,
            index_path: "data/schema_index.duckdb".to_string(),
            embedder: EmbedderConfig::default(),
            synonyms: HashMap::new(),
            table_descriptions: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ComplianceConfig {
    pub denied_verbs: Vec<String>,
    /// Verbs that read or write outside the database file: files, other databases, extensions.
    pub external_verbs: Vec<String>,
    /// Verbs removed from both lists, e.g. `["UPDATE"]`.
    pub permitted_verbs: Vec<String>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            denied_verbs: ["DROP", "DELETE", "ALTER", "TRUNCATE", "UPDATE"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            external_verbs: ["COPY", "ATTACH", "DETACH", "INSTALL", "LOAD", "EXPORT", "IMPORT"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            permitted_verbs: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub row_cap: usize,
    pub time_cap_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            row_cap: 1000,
            time_cap_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub catalog: CatalogConfig,
    pub retrieval: RetrievalConfig,
    pub compliance: ComplianceConfig,
    pub execution: ExecutionConfig,
    pub history: HistoryConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// DuckDB database file (or ":memory:")
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP API (default)
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one question through the pipeline and print every stage
    Ask {
        question: String,

        /// Retrieval strategy: full, keyword, vector, persistent_vector
        #[arg(short, long)]
        strategy: Option<RetrievalStrategy>,

        /// Model override for this request
        #[arg(short, long)]
        model: Option<String>,

        /// Abort the whole run after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the introspected schema
    Schema,
    /// Compare all retrieval strategies for a question
    Compare { question: String },
    /// Rebuild the persistent vector index from the live schema
    RebuildIndex,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = [
                "config.toml",
                "config/config.toml",
                "/etc/sqlcrew/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("SQLCREW")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Command line overrides
        if let Some(database) = &args.database {
            config.database.connection_string = database.clone();
        }
        if let Some(Command::Serve { host, port }) = &args.command {
            if let Some(host) = host {
                config.web.host = host.clone();
            }
            if let Some(port) = port {
                config.web.port = *port;
            }
        }
        if config.llm.api_key.is_none() {
            config.llm.api_key = std::env::var("OPENAI_API_KEY").ok();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig = Config::builder()
            .add_source(config::File::from_str(
                "[execution]\nrow_cap = 10\n\n[retrieval]\nstrategy = \"vector\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.execution.row_cap, 10);
        assert_eq!(config.execution.time_cap_ms, 30_000);
        assert_eq!(config.retrieval.strategy, RetrievalStrategy::Vector);
        assert_eq!(config.retrieval.max_tables, 5);
        assert_eq!(config.compliance.denied_verbs.len(), 5);
        assert_eq!(config.web.port, 3000);
    }

    #[test]
    fn cli_parses_ask_with_strategy() {
        let args = CliArgs::parse_from([
            "sqlcrew",
            "--database",
            ":memory:",
            "ask",
            "show me all customers",
            "--strategy",
            "keyword",
        ]);
        match args.command {
            Some(Command::Ask { question, strategy, .. }) => {
                assert_eq!(question, "show me all customers");
                assert_eq!(strategy, Some(RetrievalStrategy::Keyword));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(args.database.as_deref(), Some(":memory:"));
    }
}
