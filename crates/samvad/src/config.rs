use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatConfig {
    pub completion: CompletionConfig,
    pub search: SearchBackendConfig,
    pub crawl: CrawlConfig,
    pub server: ServerConfig,
}

/// OpenAI-compatible completion endpoint. For azure-style deployments the
/// endpoint already includes the deployment segment and `api_version` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub api_version: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4-turbo-preview".to_string(),
            api_version: None,
            request_timeout_secs: 60,
        }
    }
}

/// SERP backend with basic-auth credentials and a separate status endpoint
/// for the pre-flight connectivity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchBackendConfig {
    pub endpoint: String,
    pub status_endpoint: String,
    pub login: String,
    pub password: String,
    pub language_code: String,
    pub location_name: String,
    pub request_timeout_secs: u64,
}

impl Default for SearchBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.dataforseo.com/v3/serp/google/organic/live/advanced"
                .to_string(),
            status_endpoint: "https://api.dataforseo.com/v3/appendix/status".to_string(),
            login: String::new(),
            password: String::new(),
            language_code: "en".to_string(),
            location_name: "United States".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub max_content_chars: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: "Mozilla/5.0 (compatible; Samvad-Crawler/1.0)".to_string(),
            max_content_chars: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8790".to_string(),
        }
    }
}

impl ChatConfig {
    /// Validate config values, returning errors for clearly broken
    /// configurations. Missing credentials are not errors here; they become
    /// ConfigurationErrors at request time, named per credential.
    pub fn validate(&self) -> Result<(), String> {
        if self.completion.endpoint.is_empty() {
            return Err("completion.endpoint must not be empty".into());
        }
        if self.completion.model.is_empty() {
            return Err("completion.model must not be empty".into());
        }
        if self.completion.request_timeout_secs == 0 {
            return Err("completion.request_timeout_secs must be > 0".into());
        }
        if self.search.endpoint.is_empty() || self.search.status_endpoint.is_empty() {
            return Err("search.endpoint and search.status_endpoint must not be empty".into());
        }
        if self.crawl.timeout_secs == 0 {
            return Err("crawl.timeout_secs must be > 0".into());
        }
        if self.crawl.max_content_chars < 1000 {
            return Err("crawl.max_content_chars must be >= 1000".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing
    /// sections.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file location under the platform config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("samvad")
            .join("config.json")
    }

    /// Overlay credentials and endpoints from the environment. Used by the
    /// server binary so deployments can keep secrets out of the config file.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("SAMVAD_COMPLETION_ENDPOINT") {
            self.completion.endpoint = v;
        }
        if let Ok(v) = std::env::var("SAMVAD_COMPLETION_API_KEY") {
            self.completion.api_key = v;
        }
        if let Ok(v) = std::env::var("SAMVAD_COMPLETION_MODEL") {
            self.completion.model = v;
        }
        if let Ok(v) = std::env::var("SAMVAD_COMPLETION_API_VERSION") {
            self.completion.api_version = Some(v);
        }
        if let Ok(v) = std::env::var("SAMVAD_SEARCH_LOGIN") {
            self.search.login = v;
        }
        if let Ok(v) = std::env::var("SAMVAD_SEARCH_PASSWORD") {
            self.search.password = v;
        }
        if let Ok(v) = std::env::var("SAMVAD_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        self
    }
}
