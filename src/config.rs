use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub subagents: SubagentsConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Global cap on turns past the semaphore at once.
    #[serde(default = "default_max_concurrent_messages")]
    pub max_concurrent_messages: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Most recent messages handed to the provider per turn; one slot is
    /// reserved for the summary once compaction has run.
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
    #[serde(default = "default_base_prompt")]
    pub base_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_messages: default_max_concurrent_messages(),
            max_iterations: default_max_iterations(),
            memory_window: default_memory_window(),
            base_prompt: default_base_prompt(),
        }
    }
}

fn default_max_concurrent_messages() -> usize {
    5
}
fn default_max_iterations() -> usize {
    12
}
fn default_memory_window() -> usize {
    50
}
fn default_base_prompt() -> String {
    "You are switchboard, a personal assistant reachable from several chat \
     channels. You have tools; use them when they help. Be concise."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_tasks_per_session")]
    pub max_tasks_per_session: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_tasks_per_session: default_max_tasks_per_session(),
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    30
}
fn default_max_tasks_per_session() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubagentsConfig {
    #[serde(default = "default_subagents_enabled")]
    pub enabled: bool,
    #[serde(default = "default_subagents_max_concurrent")]
    pub max_concurrent: usize,
    /// Strictly lower than the main loop's ceiling.
    #[serde(default = "default_subagents_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_subagents_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_subagents_max_response_chars")]
    pub max_response_chars: usize,
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            enabled: default_subagents_enabled(),
            max_concurrent: default_subagents_max_concurrent(),
            max_iterations: default_subagents_max_iterations(),
            timeout_secs: default_subagents_timeout_secs(),
            max_response_chars: default_subagents_max_response_chars(),
        }
    }
}

fn default_subagents_enabled() -> bool {
    true
}
fn default_subagents_max_concurrent() -> usize {
    3
}
fn default_subagents_max_iterations() -> usize {
    6
}
fn default_subagents_timeout_secs() -> u64 {
    180
}
fn default_subagents_max_response_chars() -> usize {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workspace_root: default_workspace_root(),
        }
    }
}

fn default_db_path() -> String {
    "switchboard.db".to_string()
}
fn default_workspace_root() -> String {
    "workspaces".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SkillsConfig {
    #[serde(default = "default_skills_dir")]
    pub dir: String,
    #[serde(default = "default_skills_enabled")]
    pub enabled: bool,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dir: default_skills_dir(),
            enabled: default_skills_enabled(),
        }
    }
}

fn default_skills_dir() -> String {
    "skills".to_string()
}
fn default_skills_enabled() -> bool {
    true
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
