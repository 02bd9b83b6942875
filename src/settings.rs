use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use config::{builder::DefaultState, ConfigBuilder, ConfigError, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{analytics::ReformulationPolicy, database::Interface};

const DEFAULT_DB_DIR: &str = "movie-study-db";
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(version, about = "Movie search study core")]
pub(crate) struct Args {
    /// Path to the local configuration TOML file.
    #[arg(short, long, value_name = "CONFIG_PATH")]
    pub(crate) config: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct SessionArgs {
    #[arg(long, value_name = "ID")]
    pub(crate) participant: String,

    #[arg(long, value_name = "ID")]
    pub(crate) task: Option<String>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Load movies from a JSON array into the catalog.
    Import { path: PathBuf },
    /// List the distinct genres in the catalog.
    Genres,
    /// Show catalog records by id.
    Movies {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// Show catalog statistics.
    Stats,
    /// Run a structured query in the faceted condition.
    Search {
        #[command(flatten)]
        session: SessionArgs,
        /// Filters and sort as JSON.
        #[arg(long, default_value = "{}")]
        query: String,
    },
    /// Parse free text into filters in the assisted condition.
    Parse {
        #[command(flatten)]
        session: SessionArgs,
        text: String,
    },
    /// Run a confirmed query in the assisted condition.
    Execute {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long, default_value = "{}")]
        query: String,
    },
    /// Ask a question in the conversational condition.
    Ask {
        #[command(flatten)]
        session: SessionArgs,
        text: String,
    },
    StartTask {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long, value_enum)]
        interface: Interface,
    },
    CompleteTask {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long, value_enum)]
        interface: Interface,
        /// Submission as JSON.
        #[arg(long, default_value = "{}")]
        submission: String,
    },
    /// Record an arbitrary event.
    Log {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long, value_enum)]
        interface: Interface,
        #[arg(long)]
        event_type: String,
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Derive task performance records from the event log.
    Analyze {
        #[arg(long, value_enum)]
        policy: Option<ReformulationPolicy>,
        #[arg(long)]
        participant: Option<String>,
        #[arg(long, value_enum)]
        interface: Option<Interface>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DatabaseSettings {
    pub(crate) path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LlmProvider {
    Openai,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LlmSettings {
    pub(crate) provider: LlmProvider,
    pub(crate) api_base: String,
    pub(crate) model: String,
    /// Name of the environment variable holding the API key.
    pub(crate) api_key_env: String,
    pub(crate) timeout_secs: u64,
}

impl LlmSettings {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Openai,
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SearchSettings {
    pub(crate) structured_limit: usize,
    pub(crate) retrieval_limit: usize,
    pub(crate) evidence_rows: usize,
    pub(crate) citation_check: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AnalyticsSettings {
    pub(crate) reformulation_policy: ReformulationPolicy,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LogSettings {
    pub(crate) level: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Settings {
    pub(crate) database: DatabaseSettings,
    pub(crate) llm: LlmSettings,
    pub(crate) search: SearchSettings,
    pub(crate) analytics: AnalyticsSettings,
    pub(crate) log: LogSettings,
}

impl Settings {
    /// Loads settings from defaults, the optional TOML file, then
    /// `MOVIE_STUDY_*` environment variables (`__` separates sections).
    pub(crate) fn from_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::build(path, Some(Environment::with_prefix("MOVIE_STUDY")))
    }

    fn build(path: Option<&Path>, env: Option<Environment>) -> Result<Self, ConfigError> {
        let defaults = LlmSettings::default();
        let mut builder = ConfigBuilder::<DefaultState>::default()
            .set_default("database.path", default_db_path())?
            .set_default("llm.provider", "openai")?
            .set_default("llm.api_base", defaults.api_base)?
            .set_default("llm.model", defaults.model)?
            .set_default("llm.api_key_env", defaults.api_key_env)?
            .set_default("llm.timeout_secs", 30_i64)?
            .set_default("search.structured_limit", 1000_i64)?
            .set_default("search.retrieval_limit", 100_i64)?
            .set_default("search.evidence_rows", 50_i64)?
            .set_default("search.citation_check", true)?
            .set_default("analytics.reformulation_policy", "nl_queries")?
            .set_default("log.level", "info")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        if let Some(env) = env {
            builder = builder.add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        builder.build()?.try_deserialize()
    }
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "movie-search-study").map_or_else(
        || DEFAULT_DB_DIR.to_string(),
        |dirs| dirs.data_dir().join("db").to_string_lossy().into_owned(),
    )
}
