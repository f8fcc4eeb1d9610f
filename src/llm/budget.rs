use log::warn;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use crate::llm::directory::DEFAULT_CONTEXT_WINDOW;

pub const MIN_OUTPUT_TOKENS: u32 = 1000;
pub const THINKING_OUTPUT_CEILING: u32 = 16000;
pub const ANTHROPIC_REASONING_CEILING: u32 = 32000;
pub const ONLINE_SUFFIX: &str = ":online";

const REASONING_KEYWORDS: [&str; 8] = [
    "deepseek-r1",
    "thinking",
    "anthropic/claude",
    "gemini-2.5",
    "grok-4",
    "openai/o1",
    "openai/o3",
    "openai/o4",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    #[default]
    High,
    Medium,
    Low,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::High => "high",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::Low => "low",
        }
    }

    fn fraction(&self) -> f64 {
        match self {
            ReasoningEffort::High => 0.8,
            ReasoningEffort::Medium => 0.5,
            ReasoningEffort::Low => 0.2,
        }
    }

    /// Missing or unrecognized values fall back to `High`.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        match value {
            None => ReasoningEffort::High,
            Some(raw) =>
                raw.parse().unwrap_or_else(|_| {
                    warn!("Invalid thinking effort '{}', using high", raw);
                    ReasoningEffort::High
                }),
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasoningEffort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" => Ok(ReasoningEffort::High),
            "medium" => Ok(ReasoningEffort::Medium),
            "low" => Ok(ReasoningEffort::Low),
            _ => Err(format!("Invalid reasoning effort: '{}'", s)),
        }
    }
}

/// The `reasoning` object of an upstream request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReasoningOptions {
    Budget {
        max_tokens: u32,
    },
    Effort {
        effort: ReasoningEffort,
        #[serde(skip)]
        max_tokens: u32,
    },
}

impl ReasoningOptions {
    pub fn max_tokens(&self) -> u32 {
        match self {
            ReasoningOptions::Budget { max_tokens } => *max_tokens,
            ReasoningOptions::Effort { max_tokens, .. } => *max_tokens,
        }
    }
}

/// Strips the web-search marker so table lookups see the plain id.
pub fn base_model(model: &str) -> &str {
    model.strip_suffix(ONLINE_SUFFIX).unwrap_or(model)
}

pub fn is_reasoning_model(model: &str) -> bool {
    let lower = model.to_lowercase();
    REASONING_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn is_thinking_model(model: &str) -> bool {
    model.to_lowercase().contains("thinking")
}

/// Output budget: window minus estimated input minus a 10% margin, clamped to
/// `[1000, 80% of window]`. Thinking variants never exceed 16000.
pub fn compute_max_output_tokens(model: &str, window: Option<u32>, input_tokens: usize) -> u32 {
    let window = i64::from(window.unwrap_or(DEFAULT_CONTEXT_WINDOW));
    let input = i64::try_from(input_tokens).unwrap_or(i64::MAX);
    let budget = window.saturating_sub(input).saturating_sub(window / 10);
    let ceiling = (window * 8) / 10;
    let mut tokens = budget.min(ceiling).max(i64::from(MIN_OUTPUT_TOKENS)) as u32;
    if is_thinking_model(model) {
        tokens = tokens.min(THINKING_OUTPUT_CEILING);
    }
    tokens
}

/// Caller-provided output limit, still bounded for thinking variants.
pub fn cap_requested_output_tokens(model: &str, requested: u32) -> u32 {
    if is_thinking_model(model) { requested.min(THINKING_OUTPUT_CEILING) } else { requested }
}

pub fn compute_reasoning_budget(
    model: &str,
    effort: ReasoningEffort,
    max_reasoning_tokens: u32
) -> Option<u32> {
    if !is_reasoning_model(model) {
        return None;
    }
    let mut budget = (f64::from(max_reasoning_tokens) * effort.fraction()) as u32;
    if model.to_lowercase().starts_with("anthropic/") {
        budget = budget.min(ANTHROPIC_REASONING_CEILING);
    }
    Some(budget)
}

/// Anthropic, Gemini and Qwen take an explicit token budget; other vendors take an effort level.
pub fn reasoning_options(
    model: &str,
    effort: ReasoningEffort,
    max_reasoning_tokens: u32
) -> Option<ReasoningOptions> {
    let max_tokens = compute_reasoning_budget(model, effort, max_reasoning_tokens)?;
    let lower = model.to_lowercase();
    if lower.contains("anthropic") || lower.contains("gemini") || lower.contains("qwen") {
        Some(ReasoningOptions::Budget { max_tokens })
    } else {
        Some(ReasoningOptions::Effort { effort, max_tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_budget_clamps_to_eighty_percent() {
        assert_eq!(compute_max_output_tokens("acme/model", Some(32000), 0), 25600);
        assert_eq!(compute_max_output_tokens("acme/model", None, 0), 25600);
    }

    #[test]
    fn output_budget_subtracts_input_and_margin() {
        // 32000 - 10000 - 3200
        assert_eq!(compute_max_output_tokens("acme/model", Some(32000), 10000), 18800);
    }

    #[test]
    fn output_budget_never_drops_below_floor() {
        assert_eq!(compute_max_output_tokens("acme/model", Some(32000), 32000), MIN_OUTPUT_TOKENS);
        assert_eq!(compute_max_output_tokens("acme/model", Some(32000), usize::MAX), MIN_OUTPUT_TOKENS);
    }

    #[test]
    fn thinking_models_are_capped() {
        let id = "qwen/qwen3-235b-a22b-thinking-2507";
        assert_eq!(compute_max_output_tokens(id, Some(262_144), 0), THINKING_OUTPUT_CEILING);
        assert_eq!(cap_requested_output_tokens(id, 50_000), THINKING_OUTPUT_CEILING);
        assert_eq!(cap_requested_output_tokens("x-ai/grok-4", 50_000), 50_000);
    }

    #[test]
    fn reasoning_budget_follows_effort() {
        let id = "deepseek/deepseek-r1-0528";
        assert_eq!(compute_reasoning_budget(id, ReasoningEffort::High, 64000), Some(51200));
        assert_eq!(compute_reasoning_budget(id, ReasoningEffort::Medium, 64000), Some(32000));
        assert_eq!(compute_reasoning_budget(id, ReasoningEffort::Low, 64000), Some(12800));
        assert_eq!(compute_reasoning_budget("moonshotai/kimi-k2", ReasoningEffort::High, 64000), None);
    }

    #[test]
    fn anthropic_reasoning_budget_is_capped() {
        let id = "anthropic/claude-opus-4";
        assert_eq!(compute_reasoning_budget(id, ReasoningEffort::High, 64000), Some(32000));
        assert_eq!(compute_reasoning_budget(id, ReasoningEffort::Low, 64000), Some(12800));
    }

    #[test]
    fn invalid_effort_means_high() {
        assert_eq!(ReasoningEffort::parse_or_default(Some("extreme")), ReasoningEffort::High);
        assert_eq!(ReasoningEffort::parse_or_default(None), ReasoningEffort::High);
        assert_eq!(ReasoningEffort::parse_or_default(Some("LOW")), ReasoningEffort::Low);
    }

    #[test]
    fn reasoning_options_use_vendor_shape() {
        let gemini = reasoning_options("google/gemini-2.5-pro", ReasoningEffort::Medium, 64000);
        assert_eq!(gemini, Some(ReasoningOptions::Budget { max_tokens: 32000 }));
        assert_eq!(
            serde_json::to_value(gemini.unwrap()).unwrap(),
            serde_json::json!({"max_tokens": 32000})
        );

        let grok = reasoning_options("x-ai/grok-4", ReasoningEffort::Low, 64000).unwrap();
        assert_eq!(grok.max_tokens(), 12800);
        assert_eq!(serde_json::to_value(grok).unwrap(), serde_json::json!({"effort": "low"}));
    }

    #[test]
    fn online_suffix_is_stripped_for_lookup() {
        assert_eq!(base_model("google/gemini-2.5-pro:online"), "google/gemini-2.5-pro");
        assert_eq!(base_model("x-ai/grok-4"), "x-ai/grok-4");
    }
}
