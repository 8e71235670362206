use std::env;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,
    pub env: String,
    pub llm_provider: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub round3_debate_llm: bool,
    pub bind_addr: String,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: "plenary.sqlite".to_string(),
            env: "dev".to_string(),
            llm_provider: "fake".to_string(),
            openai_api_key: String::new(),
            openai_model: default_model(),
            round3_debate_llm: true,
            bind_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            env: env::var("PLENARY_ENV").unwrap_or(defaults.env),
            llm_provider: env::var("LLM_PROVIDER").unwrap_or(defaults.llm_provider),
            openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            openai_model: env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            round3_debate_llm: env::var("ROUND3_DEBATE_LLM")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.round3_debate_llm),
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
        }
    }

    pub fn is_test(&self) -> bool {
        self.env == "test"
    }

    /// Settings used by the test suite: test mode, fake provider.
    pub fn for_tests() -> Self {
        Self {
            env: "test".to_string(),
            ..Settings::default()
        }
    }
}

/// Resolved once per process and shared read-only.
pub fn get_settings() -> &'static Settings {
    static SETTINGS: OnceLock<Settings> = OnceLock::new();
    SETTINGS.get_or_init(Settings::from_env)
}
