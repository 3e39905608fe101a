use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub services: ServicesConfig,
    pub assistant: AssistantConfig,
    pub timeouts: TimeoutConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct ServicesConfig {
    pub catalog_url: String,
    pub safety_url: String,
}

#[derive(Clone, Debug)]
pub struct AssistantConfig {
    pub memory_length: usize,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub categories: Vec<String>,
    pub routing_prompt: String,
    pub chatter_prompt: String,
    pub summary_prompt: String,
    pub unsafe_message: String,
    pub error_message: String,
    pub image_only_query: String,
}

/// Per-call deadlines, in milliseconds, for every external collaborator.
#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    pub context_store_ms: u64,
    pub catalog_ms: u64,
    pub safety_ms: u64,
    pub generation_ms: u64,
    pub turn_ms: u64,
}

impl TimeoutConfig {
    pub fn context_store(&self) -> Duration {
        Duration::from_millis(self.context_store_ms)
    }

    pub fn catalog(&self) -> Duration {
        Duration::from_millis(self.catalog_ms)
    }

    pub fn safety(&self) -> Duration {
        Duration::from_millis(self.safety_ms)
    }

    pub fn generation(&self) -> Duration {
        Duration::from_millis(self.generation_ms)
    }

    pub fn turn(&self) -> Duration {
        Duration::from_millis(self.turn_ms)
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub catalog_url: Option<String>,
    pub safety_url: Option<String>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("`{path}` is not valid TOML: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("config file `{0}` is required but does not exist")]
    MissingConfigFile(PathBuf),
    #[error("`${{{var}}}` is referenced in the config file but not set")]
    MissingEnvInterpolation { var: String },
    #[error("`${{` without a closing `}}` in the config file")]
    UnterminatedInterpolation,
    #[error("`{key}` has an unusable value `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

const DEFAULT_ROUTING_PROMPT: &str = "You route messages for a retail shopping assistant. \
Answer with exactly one word from this list: cart, retriever, chatter.\n\
- cart: the user wants to add items to, remove items from, or view their shopping cart.\n\
- retriever: the user is searching for products or asking about items not yet in the context.\n\
- chatter: anything else, including follow-up questions about products already discussed.";

const DEFAULT_CHATTER_PROMPT: &str = "You are a friendly shopping assistant for an online \
retail catalog. Answer using only the products and cart details present in the provided \
context. Keep answers short, mention product names exactly as given, and never invent prices \
or availability.";

const DEFAULT_SUMMARY_PROMPT: &str = "You are a conversation summarizer for a shopping \
assistant. Preserve every product name, specification, material, care instruction, price, \
color and size the user showed interest in. Condense only greetings and conversational filler.";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://aisle.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                api_key: None,
                base_url: "http://localhost:8000/v1".to_string(),
                model: "meta/llama-3.1-70b-instruct".to_string(),
                max_tokens: 2048,
            },
            services: ServicesConfig {
                catalog_url: "http://localhost:8010".to_string(),
                safety_url: "http://localhost:8012".to_string(),
            },
            assistant: AssistantConfig {
                memory_length: 16_384,
                top_k: 4,
                similarity_threshold: 0.8,
                categories: ["bag", "dress", "shirt", "shoes", "accessory"]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                routing_prompt: DEFAULT_ROUTING_PROMPT.to_string(),
                chatter_prompt: DEFAULT_CHATTER_PROMPT.to_string(),
                summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
                unsafe_message: "Sorry, I cannot help with that.".to_string(),
                error_message: "Sorry, something went wrong while answering. Please try again."
                    .to_string(),
                image_only_query: "The user has submitted an image, and is looking for items \
                                   from the catalog that appear similar."
                    .to_string(),
            },
            timeouts: TimeoutConfig {
                context_store_ms: 2_000,
                catalog_ms: 10_000,
                safety_ms: 5_000,
                generation_ms: 60_000,
                turn_ms: 120_000,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8009,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "logging.format `{other}` is not one of compact, pretty, json"
            ))),
        }
    }
}

const SEARCH_PATHS: [&str; 2] = ["aisle.toml", "config/aisle.toml"];

impl AppConfig {
    /// Layers, lowest to highest: defaults, TOML file, `AISLE_*` environment, `options.overrides`.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let located = locate_file(options.config_path.as_deref());
        match located {
            Some(path) => read_file_layer(&path)?.apply_to(&mut config),
            None if options.require_file => {
                let expected =
                    options.config_path.unwrap_or_else(|| PathBuf::from(SEARCH_PATHS[0]));
                return Err(ConfigError::MissingConfigFile(expected));
            }
            None => {}
        }

        config.apply_env()?;
        options.overrides.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        let database = &mut self.database;
        merge(&mut database.url, env_string("AISLE_DATABASE_URL"));
        merge(&mut database.max_connections, env_parsed("AISLE_DATABASE_MAX_CONNECTIONS")?);
        merge(&mut database.timeout_secs, env_parsed("AISLE_DATABASE_TIMEOUT_SECS")?);

        let llm = &mut self.llm;
        if let Some(key) = env_string("AISLE_LLM_API_KEY").or_else(|| env_string("LLM_API_KEY")) {
            llm.api_key = Some(SecretString::from(key));
        }
        merge(&mut llm.base_url, env_string("AISLE_LLM_BASE_URL"));
        merge(&mut llm.model, env_string("AISLE_LLM_MODEL"));
        merge(&mut llm.max_tokens, env_parsed("AISLE_LLM_MAX_TOKENS")?);

        merge(&mut self.services.catalog_url, env_string("AISLE_CATALOG_URL"));
        merge(&mut self.services.safety_url, env_string("AISLE_SAFETY_URL"));

        let assistant = &mut self.assistant;
        merge(&mut assistant.memory_length, env_parsed("AISLE_ASSISTANT_MEMORY_LENGTH")?);
        merge(&mut assistant.top_k, env_parsed("AISLE_ASSISTANT_TOP_K")?);
        merge(
            &mut assistant.similarity_threshold,
            env_parsed("AISLE_ASSISTANT_SIMILARITY_THRESHOLD")?,
        );
        merge(
            &mut assistant.categories,
            env_string("AISLE_ASSISTANT_CATEGORIES").map(|raw| split_list(&raw)),
        );

        let timeouts = &mut self.timeouts;
        merge(&mut timeouts.context_store_ms, env_parsed("AISLE_TIMEOUT_CONTEXT_STORE_MS")?);
        merge(&mut timeouts.catalog_ms, env_parsed("AISLE_TIMEOUT_CATALOG_MS")?);
        merge(&mut timeouts.safety_ms, env_parsed("AISLE_TIMEOUT_SAFETY_MS")?);
        merge(&mut timeouts.generation_ms, env_parsed("AISLE_TIMEOUT_GENERATION_MS")?);
        merge(&mut timeouts.turn_ms, env_parsed("AISLE_TIMEOUT_TURN_MS")?);

        let server = &mut self.server;
        merge(&mut server.bind_address, env_string("AISLE_SERVER_BIND_ADDRESS"));
        merge(&mut server.port, env_parsed("AISLE_SERVER_PORT")?);
        merge(
            &mut server.graceful_shutdown_secs,
            env_parsed("AISLE_SERVER_GRACEFUL_SHUTDOWN_SECS")?,
        );

        // Short aliases are accepted for the two logging keys.
        merge(
            &mut self.logging.level,
            env_string("AISLE_LOGGING_LEVEL").or_else(|| env_string("AISLE_LOG_LEVEL")),
        );
        if let Some(raw) =
            env_string("AISLE_LOGGING_FORMAT").or_else(|| env_string("AISLE_LOG_FORMAT"))
        {
            self.logging.format = raw.parse()?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let database = &self.database;
        let url = database.url.trim();
        require(
            url.starts_with("sqlite:") || url == ":memory:",
            "database.url must be a sqlite URL such as `sqlite://aisle.db` or `sqlite::memory:`",
        )?;
        require(database.max_connections > 0, "database.max_connections must be positive")?;
        require(
            (1..=300).contains(&database.timeout_secs),
            "database.timeout_secs must be between 1 and 300",
        )?;

        require_http("llm.base_url", &self.llm.base_url)?;
        require(!self.llm.model.trim().is_empty(), "llm.model is empty")?;
        require(self.llm.max_tokens > 0, "llm.max_tokens must be positive")?;

        require_http("services.catalog_url", &self.services.catalog_url)?;
        require_http("services.safety_url", &self.services.safety_url)?;

        let assistant = &self.assistant;
        require(assistant.memory_length > 0, "assistant.memory_length must be positive")?;
        require(assistant.top_k > 0, "assistant.top_k must be positive")?;
        require(
            (0.0..=1.0).contains(&assistant.similarity_threshold),
            "assistant.similarity_threshold must be between 0.0 and 1.0",
        )?;
        require(!assistant.categories.is_empty(), "assistant.categories is empty")?;
        for (key, text) in [
            ("assistant.routing_prompt", &assistant.routing_prompt),
            ("assistant.chatter_prompt", &assistant.chatter_prompt),
            ("assistant.summary_prompt", &assistant.summary_prompt),
            ("assistant.unsafe_message", &assistant.unsafe_message),
            ("assistant.error_message", &assistant.error_message),
        ] {
            require(!text.trim().is_empty(), format!("{key} is empty"))?;
        }

        let timeouts = &self.timeouts;
        for (key, millis) in [
            ("timeouts.context_store_ms", timeouts.context_store_ms),
            ("timeouts.catalog_ms", timeouts.catalog_ms),
            ("timeouts.safety_ms", timeouts.safety_ms),
            ("timeouts.generation_ms", timeouts.generation_ms),
            ("timeouts.turn_ms", timeouts.turn_ms),
        ] {
            require(millis > 0, format!("{key} must be positive"))?;
        }
        require(
            timeouts.turn_ms >= timeouts.generation_ms,
            "timeouts.turn_ms must be at least timeouts.generation_ms",
        )?;

        require(self.server.port > 0, "server.port must be positive")?;
        require(
            self.server.graceful_shutdown_secs > 0,
            "server.graceful_shutdown_secs must be positive",
        )?;

        require(
            matches!(
                self.logging.level.trim().to_ascii_lowercase().as_str(),
                "trace" | "debug" | "info" | "warn" | "error"
            ),
            format!("logging.level `{}` is not a tracing level", self.logging.level),
        )
    }

    pub fn llm_api_key(&self) -> Option<&str> {
        self.llm.api_key.as_ref().map(|key| key.expose_secret())
    }
}

impl ConfigOverrides {
    fn apply_to(self, config: &mut AppConfig) {
        merge(&mut config.database.url, self.database_url);
        merge(&mut config.logging.level, self.log_level);
        merge(&mut config.llm.base_url, self.llm_base_url);
        merge(&mut config.llm.model, self.llm_model);
        if let Some(key) = self.llm_api_key {
            config.llm.api_key = Some(SecretString::from(key));
        }
        merge(&mut config.services.catalog_url, self.catalog_url);
        merge(&mut config.services.safety_url, self.safety_url);
        merge(&mut config.server.port, self.server_port);
    }
}

fn merge<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn require(condition: bool, message: impl Into<String>) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Validation(message.into()))
    }
}

fn require_http(key: &str, value: &str) -> Result<(), ConfigError> {
    require(
        value.starts_with("http://") || value.starts_with("https://"),
        format!("{key} must be an http(s) URL, got `{value}`"),
    )
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty()).map(str::to_string).collect()
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    env_string(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
                key: key.to_string(),
                value: raw.clone(),
            })
        })
        .transpose()
}

fn locate_file(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => path.exists().then(|| path.to_path_buf()),
        None => SEARCH_PATHS.iter().map(PathBuf::from).find(|path| path.exists()),
    }
}

fn read_file_layer(path: &Path) -> Result<FileLayer, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&expand_env_refs(&raw)?)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

/// Replaces every `${NAME}` with the value of the environment variable `NAME`.
fn expand_env_refs(input: &str) -> Result<String, ConfigError> {
    let mut expanded = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let close = after_open.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let name = &after_open[..close];
        let value = env::var(name)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: name.to_string() })?;
        expanded.push_str(&value);
        rest = &after_open[close + 1..];
    }

    expanded.push_str(rest);
    Ok(expanded)
}

/// Every key optional; absent keys keep the lower layer's value.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileLayer {
    database: DatabaseLayer,
    llm: LlmLayer,
    services: ServicesLayer,
    assistant: AssistantLayer,
    timeouts: TimeoutLayer,
    server: ServerLayer,
    logging: LoggingLayer,
}

impl FileLayer {
    fn apply_to(self, config: &mut AppConfig) {
        let Self { database, llm, services, assistant, timeouts, server, logging } = self;

        merge(&mut config.database.url, database.url);
        merge(&mut config.database.max_connections, database.max_connections);
        merge(&mut config.database.timeout_secs, database.timeout_secs);

        if let Some(key) = llm.api_key {
            config.llm.api_key = Some(SecretString::from(key));
        }
        merge(&mut config.llm.base_url, llm.base_url);
        merge(&mut config.llm.model, llm.model);
        merge(&mut config.llm.max_tokens, llm.max_tokens);

        merge(&mut config.services.catalog_url, services.catalog_url);
        merge(&mut config.services.safety_url, services.safety_url);

        let target = &mut config.assistant;
        merge(&mut target.memory_length, assistant.memory_length);
        merge(&mut target.top_k, assistant.top_k);
        merge(&mut target.similarity_threshold, assistant.similarity_threshold);
        merge(&mut target.categories, assistant.categories);
        merge(&mut target.routing_prompt, assistant.routing_prompt);
        merge(&mut target.chatter_prompt, assistant.chatter_prompt);
        merge(&mut target.summary_prompt, assistant.summary_prompt);
        merge(&mut target.unsafe_message, assistant.unsafe_message);
        merge(&mut target.error_message, assistant.error_message);
        merge(&mut target.image_only_query, assistant.image_only_query);

        merge(&mut config.timeouts.context_store_ms, timeouts.context_store_ms);
        merge(&mut config.timeouts.catalog_ms, timeouts.catalog_ms);
        merge(&mut config.timeouts.safety_ms, timeouts.safety_ms);
        merge(&mut config.timeouts.generation_ms, timeouts.generation_ms);
        merge(&mut config.timeouts.turn_ms, timeouts.turn_ms);

        merge(&mut config.server.bind_address, server.bind_address);
        merge(&mut config.server.port, server.port);
        merge(&mut config.server.graceful_shutdown_secs, server.graceful_shutdown_secs);

        merge(&mut config.logging.level, logging.level);
        merge(&mut config.logging.format, logging.format);
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DatabaseLayer {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LlmLayer {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServicesLayer {
    catalog_url: Option<String>,
    safety_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AssistantLayer {
    memory_length: Option<usize>,
    top_k: Option<usize>,
    similarity_threshold: Option<f32>,
    categories: Option<Vec<String>>,
    routing_prompt: Option<String>,
    chatter_prompt: Option<String>,
    summary_prompt: Option<String>,
    unsafe_message: Option<String>,
    error_message: Option<String>,
    image_only_query: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TimeoutLayer {
    context_store_ms: Option<u64>,
    catalog_ms: Option<u64>,
    safety_ms: Option<u64>,
    generation_ms: Option<u64>,
    turn_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerLayer {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LoggingLayer {
    level: Option<String>,
    format: Option<LogFormat>,
}
