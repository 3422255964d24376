use crate::error::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// LLM endpoint settings
    #[serde(default)]
    pub llm: LlmConfig,

    /// Knowledge base / retrieval settings
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Preprocessing phase settings
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,

    /// Formatter settings
    #[serde(default)]
    pub formatting: FormattingConfig,

    /// Planner loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// External process execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Data directory (sandboxes, databases, checkpoints)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// When false, retrieval returns empty and prompts omit context.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default = "default_top_k_contracts")]
    pub top_k_contracts: usize,

    #[serde(default = "default_top_k_bugs")]
    pub top_k_bugs: usize,

    /// Weight of the semantic score in hybrid ranking; keyword score
    /// gets `1 - alpha`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding endpoint; defaults to the LLM base URL when empty.
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

/// Formatter style selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatStyle {
    #[serde(rename = "GOOGLE")]
    Google,
    #[serde(rename = "AOSP")]
    Aosp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattingConfig {
    #[serde(default = "default_format_style")]
    pub style: FormatStyle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_budget_llm_calls")]
    pub budget_llm_calls: u32,

    #[serde(default = "default_no_improvement_rounds")]
    pub stop_on_no_improvement_rounds: u32,

    /// How many targets may evaluate mutants concurrently.
    #[serde(default = "default_parallel_targets")]
    pub parallel_targets: usize,

    #[serde(default)]
    pub excellence_thresholds: ExcellenceThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcellenceThresholds {
    #[serde(default = "default_excellent_mutation_score")]
    pub mutation_score: f64,

    #[serde(default = "default_excellent_line_coverage")]
    pub line_coverage: f64,

    #[serde(default = "default_excellent_branch_coverage")]
    pub branch_coverage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout for compile and analyzer invocations (seconds)
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Timeout for a test phase run (seconds)
    #[serde(default = "default_test_timeout")]
    pub test_timeout_seconds: u64,

    /// Timeout for a coverage run (seconds)
    #[serde(default = "default_coverage_timeout")]
    pub coverage_timeout_seconds: u64,

    /// Path to the structural analyzer jar
    #[serde(default = "default_analyzer_jar")]
    pub analyzer_jar: PathBuf,

    /// Path to the google-java-format jar
    #[serde(default = "default_formatter_jar")]
    pub formatter_jar: PathBuf,

    /// Java command used to launch the analyzer and formatter
    #[serde(default = "default_java_cmd")]
    pub java_cmd: String,
}

// Default value functions
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_true() -> bool {
    true
}

fn default_top_k_contracts() -> usize {
    5
}

fn default_top_k_bugs() -> usize {
    3
}

fn default_alpha() -> f64 {
    0.7
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_max_workers() -> usize {
    4
}

fn default_format_style() -> FormatStyle {
    FormatStyle::Google
}

fn default_max_iterations() -> u32 {
    10
}

fn default_budget_llm_calls() -> u32 {
    1000
}

fn default_no_improvement_rounds() -> u32 {
    3
}

fn default_parallel_targets() -> usize {
    1
}

fn default_excellent_mutation_score() -> f64 {
    0.95
}

fn default_excellent_line_coverage() -> f64 {
    0.90
}

fn default_excellent_branch_coverage() -> f64 {
    0.85
}

fn default_timeout() -> u64 {
    300
}

fn default_test_timeout() -> u64 {
    120
}

fn default_coverage_timeout() -> u64 {
    300
}

fn default_analyzer_jar() -> PathBuf {
    PathBuf::from("analyzer/target/coevo-analyzer.jar")
}

fn default_formatter_jar() -> PathBuf {
    PathBuf::from("tools/google-java-format.jar")
}

fn default_java_cmd() -> String {
    "java".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            temperature: default_temperature(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            embedding: EmbeddingConfig::default(),
            top_k_contracts: default_top_k_contracts(),
            top_k_bugs: default_top_k_bugs(),
            alpha: default_alpha(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: default_embedding_model(),
        }
    }
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: default_max_workers(),
        }
    }
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            style: default_format_style(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            budget_llm_calls: default_budget_llm_calls(),
            stop_on_no_improvement_rounds: default_no_improvement_rounds(),
            parallel_targets: default_parallel_targets(),
            excellence_thresholds: ExcellenceThresholds::default(),
        }
    }
}

impl Default for ExcellenceThresholds {
    fn default() -> Self {
        Self {
            mutation_score: default_excellent_mutation_score(),
            line_coverage: default_excellent_line_coverage(),
            branch_coverage: default_excellent_branch_coverage(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            test_timeout_seconds: default_test_timeout(),
            coverage_timeout_seconds: default_coverage_timeout(),
            analyzer_jar: default_analyzer_jar(),
            formatter_jar: default_formatter_jar(),
            java_cmd: default_java_cmd(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            knowledge: KnowledgeConfig::default(),
            preprocessing: PreprocessingConfig::default(),
            formatting: FormattingConfig::default(),
            agent: AgentConfig::default(),
            execution: ExecutionConfig::default(),
            data_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);

        let config = match config_path {
            Some(ref path) if path.exists() => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("failed to read config from {path:?}: {e}"))
                })?;
                toml::from_str(&contents).map_err(|e| {
                    Error::config(format!("failed to parse config from {path:?}: {e}"))
                })?
            }
            _ => Config::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values before any component sees them.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.knowledge.alpha) {
            return Err(Error::config(format!(
                "knowledge.alpha must be in [0, 1], got {}",
                self.knowledge.alpha
            )));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(Error::config(format!(
                "llm.temperature must be in [0, 2], got {}",
                self.llm.temperature
            )));
        }
        if self.preprocessing.max_workers == 0 {
            return Err(Error::config("preprocessing.max_workers must be >= 1"));
        }
        if self.agent.parallel_targets == 0 {
            return Err(Error::config("agent.parallel_targets must be >= 1"));
        }
        let thresholds = &self.agent.excellence_thresholds;
        for (name, value) in [
            ("mutation_score", thresholds.mutation_score),
            ("line_coverage", thresholds.line_coverage),
            ("branch_coverage", thresholds.branch_coverage),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config(format!(
                    "agent.excellence_thresholds.{name} must be in [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "coevo", "coevo")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("dev", "coevo", "coevo")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".coevo"))
        })
    }

    /// Get the relational store file path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("coevo.db")
    }

    /// Get the vector store file path
    pub fn knowledge_db_path(&self) -> PathBuf {
        self.data_dir().join("knowledge.db")
    }

    /// Get the sandbox root directory
    pub fn sandbox_root(&self) -> PathBuf {
        self.data_dir().join("sandbox")
    }

    /// Get the embedding cache directory
    pub fn embedding_cache_dir(&self) -> PathBuf {
        self.data_dir().join("cache")
    }

    /// Get the per-round checkpoint file path
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir().join("checkpoint.json")
    }

    /// Embedding endpoint, falling back to the LLM endpoint.
    pub fn embedding_base_url(&self) -> &str {
        if self.knowledge.embedding.base_url.is_empty() {
            &self.llm.base_url
        } else {
            &self.knowledge.embedding.base_url
        }
    }
}
