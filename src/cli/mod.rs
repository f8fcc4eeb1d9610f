use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Upstream Args ---
    /// API key for the OpenRouter chat-completions API.
    #[arg(long, env = "OPENROUTER_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Base URL of the OpenRouter API (the `/chat/completions` route is appended).
    #[arg(long, env = "OPENROUTER_BASE_URL", default_value = "https://openrouter.ai/api/v1")]
    pub base_url: String,

    /// Value sent in the HTTP-Referer header for OpenRouter attribution.
    #[arg(long, env = "OPENROUTER_REFERER", default_value = "https://claude.ai")]
    pub referer: String,

    /// Value sent in the X-Title header for OpenRouter attribution.
    #[arg(long, env = "OPENROUTER_TITLE", default_value = "OpenRouter MCP Server")]
    pub title: String,

    /// Model used when a chat request names none.
    #[arg(long, env = "DEFAULT_MODEL", default_value = "deepseek/deepseek-r1-0528")]
    pub default_model: String,

    /// Sampling temperature used when a chat request names none (0.0 to 2.0).
    #[arg(long, env = "DEFAULT_TEMPERATURE", default_value = "0.7")]
    pub default_temperature: f32,

    /// Switch internet-capable models to their web-search (`:online`) variant.
    #[arg(long, env = "FORCE_INTERNET_SEARCH", default_value = "true", action = clap::ArgAction::Set)]
    pub force_internet_search: bool,

    /// Upper bound for reasoning tokens; effort levels take a fraction of this.
    #[arg(long, env = "MAX_REASONING_TOKENS", default_value = "64000")]
    pub max_reasoning_tokens: u32,

    /// Request timeout in seconds for standard models.
    #[arg(long, env = "STANDARD_TIMEOUT_SECS", default_value = "60")]
    pub standard_timeout_secs: u64,

    /// Request timeout in seconds for reasoning-capable models.
    #[arg(long, env = "REASONING_TIMEOUT_SECS", default_value = "180")]
    pub reasoning_timeout_secs: u64,

    /// Upstream requests allowed per minute. 0 disables rate limiting.
    #[arg(long, env = "RATE_LIMIT_REQUESTS_PER_MINUTE", default_value = "60")]
    pub rate_limit_per_minute: u32,

    /// Optional JSON file adding or overriding model aliases, capabilities and context windows.
    #[arg(long, env = "MODELS_PATH")]
    pub models_path: Option<String>,

    // --- History Store Args ---
    /// History chat store type (file, redis, memory)
    #[arg(long, env = "HISTORY_TYPE", default_value = "file")]
    pub history_type: String,

    /// Directory holding one JSON file per conversation (file store).
    #[arg(long, env = "STORAGE_DIR", default_value = "/tmp/openrouter_conversations")]
    pub storage_dir: String,

    /// History chat store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "HISTORY_HOST", default_value = "redis://127.0.0.1:6379")]
    pub history_host: String,

    /// Prefix for Redis history keys.
    #[arg(long, env = "HISTORY_REDIS_PREFIX", default_value = "conversation:")]
    pub history_redis_prefix: String,

    /// Batch size for Redis SCAN command when listing history.
    #[arg(long, env = "HISTORY_REDIS_SCAN_COUNT", default_value = "100")]
    pub history_redis_scan_count: usize,

    /// Purge conversations not updated for this many days at start-up. 0 keeps everything.
    #[arg(long, env = "CLEANUP_DAYS", default_value = "0")]
    pub cleanup_days: i64,

    // --- Transport Args ---
    /// Largest accepted JSON-RPC line, in bytes.
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value = "10485760")]
    pub max_message_size: usize,

    /// Tool calls processed at the same time.
    #[arg(long, env = "MAX_CONCURRENT_REQUESTS", default_value = "10")]
    pub max_concurrent_requests: usize,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    /// Checks the settings that would otherwise fail on the first tool call.
    pub fn validate(&self) -> Result<(), String> {
        if self.api_key.trim().is_empty() {
            return Err("OPENROUTER_API_KEY is required".to_string());
        }
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(
                format!("DEFAULT_TEMPERATURE must be between 0 and 2, got {}", self.default_temperature)
            );
        }
        if self.max_concurrent_requests == 0 {
            return Err("MAX_CONCURRENT_REQUESTS must be at least 1".to_string());
        }
        if self.cleanup_days < 0 {
            return Err("CLEANUP_DAYS must not be negative".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["openrouter-mcp", "--api-key", "sk-test"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_validate() {
        let args = parse(&[]);
        assert_eq!(args.history_type, "file");
        assert_eq!(args.max_message_size, 10 * 1024 * 1024);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let args = parse(&["--default-temperature", "2.5"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn force_search_can_be_switched_off() {
        let args = parse(&["--force-internet-search", "false"]);
        assert!(!args.force_internet_search);
    }
}
