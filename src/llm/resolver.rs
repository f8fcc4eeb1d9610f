use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use crate::llm::budget::{
    self,
    ReasoningEffort,
    ReasoningOptions,
    base_model,
    is_reasoning_model,
    ONLINE_SUFFIX,
};
use crate::llm::directory::{ Capability, ModelDirectory };
use crate::models::chat::{ HistoryEntry, estimate_tokens };

const FILLER_WORDS: [&str; 7] = ["model", "the", "use", "with", "ai", "assistant", "please"];

struct Variant {
    keywords: &'static [&'static str],
    canonical: &'static str,
}

/// A model family recognized by keyword. Variants are checked in order against the
/// request, then against the prompt hint.
struct FamilyRule {
    keywords: &'static [&'static str],
    variants: &'static [Variant],
    default: Option<&'static str>,
}

const FAMILY_RULES: &[FamilyRule] = &[
    FamilyRule {
        keywords: &["qwen"],
        variants: &[
            Variant { keywords: &["coder", "coding", "code"], canonical: "qwen/qwen3-coder" },
            Variant { keywords: &["max"], canonical: "qwen/qwen3-max" },
            Variant {
                keywords: &["thinking", "reasoning"],
                canonical: "qwen/qwen3-235b-a22b-thinking-2507",
            },
        ],
        default: None,
    },
    FamilyRule {
        keywords: &["claude", "anthropic", "opus", "sonnet"],
        variants: &[Variant { keywords: &["opus"], canonical: "anthropic/claude-opus-4" }],
        default: Some("anthropic/claude-sonnet-4"),
    },
    FamilyRule {
        keywords: &["gemini", "google"],
        variants: &[Variant { keywords: &["flash"], canonical: "google/gemini-2.5-flash" }],
        default: Some("google/gemini-2.5-pro"),
    },
    FamilyRule {
        keywords: &["deepseek", "r1"],
        variants: &[
            Variant { keywords: &["v3", "latest", "chat"], canonical: "deepseek/deepseek-chat-v3-0324" },
        ],
        default: Some("deepseek/deepseek-r1-0528"),
    },
    FamilyRule {
        keywords: &["kimi", "moonshot", "k2"],
        variants: &[],
        default: Some("moonshotai/kimi-k2"),
    },
    FamilyRule {
        keywords: &["grok", "x-ai", "xai"],
        variants: &[],
        default: Some("x-ai/grok-4"),
    },
];

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub default_model: String,
    pub force_internet_search: bool,
    pub max_reasoning_tokens: u32,
    pub standard_timeout: Duration,
    pub reasoning_timeout: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            default_model: "deepseek/deepseek-r1-0528".to_string(),
            force_internet_search: true,
            max_reasoning_tokens: 64000,
            standard_timeout: Duration::from_secs(60),
            reasoning_timeout: Duration::from_secs(180),
        }
    }
}

/// Turns user-supplied model names into canonical ids and sizes requests for them.
pub struct ModelResolver {
    directory: Arc<ModelDirectory>,
    lowercase_aliases: HashMap<String, String>,
    settings: ResolverSettings,
}

/// Lowercases, drops filler words and joins the remaining words with `-`.
fn clean_request(requested: &str) -> String {
    requested
        .to_lowercase()
        .split_whitespace()
        .filter(|word| !FILLER_WORDS.contains(word))
        .collect::<Vec<_>>()
        .join("-")
}

fn hint_words(hint: &str) -> Vec<String> {
    hint.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

impl ModelResolver {
    pub fn new(directory: Arc<ModelDirectory>, settings: ResolverSettings) -> Self {
        let lowercase_aliases = directory
            .aliases()
            .into_iter()
            .map(|(alias, canonical)| (alias.to_lowercase(), canonical.to_string()))
            .collect();
        Self {
            directory,
            lowercase_aliases,
            settings,
        }
    }

    pub fn directory(&self) -> &ModelDirectory {
        &self.directory
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Canonical id for `requested`. Never fails: unknown names come back unchanged.
    pub fn resolve(&self, requested: &str, prompt_hint: &str) -> String {
        let trimmed = requested.trim();
        if trimmed.is_empty() {
            return self.settings.default_model.clone();
        }

        if let Some(canonical) = self.directory.resolve_exact(trimmed) {
            return canonical.to_string();
        }

        let cleaned = clean_request(trimmed);
        for candidate in [trimmed.to_lowercase(), cleaned.clone()] {
            if let Some(canonical) = self.lowercase_aliases.get(&candidate) {
                return canonical.clone();
            }
        }

        if trimmed.contains('/') {
            return trimmed.to_string();
        }

        if let Some(canonical) = self.match_family(&cleaned, prompt_hint) {
            debug!("Resolved model '{}' by family keywords to {}", requested, canonical);
            return canonical.to_string();
        }

        if let Some(canonical) = self.match_substring(&cleaned) {
            debug!("Resolved model '{}' by partial alias match to {}", requested, canonical);
            return canonical;
        }

        trimmed.to_string()
    }

    fn match_family(&self, cleaned: &str, prompt_hint: &str) -> Option<&'static str> {
        let hint = hint_words(prompt_hint);
        for rule in FAMILY_RULES {
            if !rule.keywords.iter().any(|k| cleaned.contains(k)) {
                continue;
            }
            let in_request = rule.variants
                .iter()
                .find(|v| v.keywords.iter().any(|k| cleaned.contains(k)));
            let in_hint = || {
                rule.variants.iter().find(|v| v.keywords.iter().any(|k| hint.iter().any(|w| w == k)))
            };
            if let Some(variant) = in_request.or_else(in_hint) {
                return Some(variant.canonical);
            }
            if let Some(default) = rule.default {
                return Some(default);
            }
        }
        None
    }

    /// Alias containment in either direction, accepted only when every hit agrees.
    fn match_substring(&self, cleaned: &str) -> Option<String> {
        if cleaned.is_empty() {
            return None;
        }
        let mut hits = self.lowercase_aliases
            .iter()
            .filter(|(alias, _)| alias.contains(cleaned) || cleaned.contains(alias.as_str()))
            .map(|(_, canonical)| canonical);
        let first = hits.next()?;
        if hits.all(|c| c == first) {
            Some(first.clone())
        } else {
            debug!("Partial model name '{}' is ambiguous", cleaned);
            None
        }
    }

    pub fn should_force_search(&self, canonical: &str) -> bool {
        self.settings.force_internet_search &&
            self.directory.has_capability(base_model(canonical), Capability::InternetAccess)
    }

    /// Model id to dispatch: `:online` is appended when search is forced and the
    /// caller did not opt out.
    pub fn dispatch_id(&self, canonical: &str, caller_allows_search: bool) -> String {
        if caller_allows_search && !canonical.ends_with(ONLINE_SUFFIX) && self.should_force_search(canonical) {
            format!("{}{}", canonical, ONLINE_SUFFIX)
        } else {
            canonical.to_string()
        }
    }

    pub fn compute_max_output_tokens(&self, canonical: &str, messages: &[HistoryEntry]) -> u32 {
        let input_tokens: usize = messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        let window = self.directory.context_window(base_model(canonical));
        budget::compute_max_output_tokens(canonical, window, input_tokens)
    }

    pub fn compute_reasoning_budget(&self, canonical: &str, effort: Option<&str>) -> Option<u32> {
        budget::compute_reasoning_budget(
            canonical,
            ReasoningEffort::parse_or_default(effort),
            self.settings.max_reasoning_tokens
        )
    }

    pub fn reasoning_options(&self, canonical: &str, effort: Option<&str>) -> Option<ReasoningOptions> {
        budget::reasoning_options(
            canonical,
            ReasoningEffort::parse_or_default(effort),
            self.settings.max_reasoning_tokens
        )
    }

    pub fn request_timeout(&self, canonical: &str) -> Duration {
        if is_reasoning_model(canonical) {
            self.settings.reasoning_timeout
        } else {
            self.settings.standard_timeout
        }
    }
}
