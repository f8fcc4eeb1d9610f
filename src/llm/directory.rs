use std::collections::{ BTreeMap, HashMap, HashSet };
use std::fmt;
use std::str::FromStr;
use strsim::jaro_winkler;
use crate::config::models::ModelsFile;

pub const DEFAULT_CONTEXT_WINDOW: u32 = 32000;
const SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Vision,
    FunctionCalling,
    LargeContext,
    InternetAccess,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Vision,
        Capability::FunctionCalling,
        Capability::LargeContext,
        Capability::InternetAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Vision => "vision",
            Capability::FunctionCalling => "function_calling",
            Capability::LargeContext => "large_context",
            Capability::InternetAccess => "internet_access",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCapabilityError {
    message: String,
}

impl fmt::Display for ParseCapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseCapabilityError {}

impl FromStr for Capability {
    type Err = ParseCapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "vision" => Ok(Capability::Vision),
            "function_calling" => Ok(Capability::FunctionCalling),
            "large_context" => Ok(Capability::LargeContext),
            "internet_access" => Ok(Capability::InternetAccess),
            _ =>
                Err(ParseCapabilityError {
                    message: format!("Invalid capability: '{}'", s),
                }),
        }
    }
}

const GEMINI_PRO: &str = "google/gemini-2.5-pro";
const GEMINI_FLASH: &str = "google/gemini-2.5-flash";
const DEEPSEEK_R1: &str = "deepseek/deepseek-r1-0528";
const DEEPSEEK_V3: &str = "deepseek/deepseek-chat-v3-0324";
const QWEN_CODER: &str = "qwen/qwen3-coder";
const QWEN_MAX: &str = "qwen/qwen3-max";
const QWEN_THINKING: &str = "qwen/qwen3-235b-a22b-thinking-2507";
const KIMI_K2: &str = "moonshotai/kimi-k2";
const GROK_4: &str = "x-ai/grok-4";
const CLAUDE_OPUS: &str = "anthropic/claude-opus-4";
const CLAUDE_SONNET: &str = "anthropic/claude-sonnet-4";

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("gemini-2.5-pro", GEMINI_PRO),
    ("gemini-pro", GEMINI_PRO),
    ("gemini", GEMINI_PRO),
    ("gemini-flash", GEMINI_FLASH),
    ("gemini-2.5-flash", GEMINI_FLASH),
    ("deepseek-r1", DEEPSEEK_R1),
    ("deepseek", DEEPSEEK_R1),
    ("deepseek-v3", DEEPSEEK_V3),
    ("deepseek-chat", DEEPSEEK_V3),
    ("qwen3-coder", QWEN_CODER),
    ("qwen-coder", QWEN_CODER),
    ("qwen3-max", QWEN_MAX),
    ("qwen-max", QWEN_MAX),
    ("qwen3-thinking", QWEN_THINKING),
    ("kimi-k2", KIMI_K2),
    ("kimi", KIMI_K2),
    ("grok-4", GROK_4),
    ("grok", GROK_4),
    ("claude-opus-4", CLAUDE_OPUS),
    ("claude-4-opus", CLAUDE_OPUS),
    ("claude-sonnet-4", CLAUDE_SONNET),
    ("claude-4-sonnet", CLAUDE_SONNET),
    ("claude", CLAUDE_SONNET),
];

const BUILTIN_CAPABILITIES: &[(Capability, &[&str])] = &[
    (Capability::Vision, &[GEMINI_PRO, GEMINI_FLASH, CLAUDE_OPUS, CLAUDE_SONNET, GROK_4]),
    (
        Capability::FunctionCalling,
        &[GEMINI_PRO, GEMINI_FLASH, CLAUDE_OPUS, CLAUDE_SONNET, KIMI_K2, QWEN_CODER],
    ),
    (
        Capability::LargeContext,
        &[
            GEMINI_PRO,
            GEMINI_FLASH,
            DEEPSEEK_R1,
            DEEPSEEK_V3,
            QWEN_CODER,
            QWEN_MAX,
            QWEN_THINKING,
            KIMI_K2,
            GROK_4,
        ],
    ),
    (Capability::InternetAccess, &[GEMINI_PRO, GEMINI_FLASH]),
];

const BUILTIN_CONTEXT_WINDOWS: &[(&str, u32)] = &[
    (GEMINI_PRO, 1_048_576),
    (GEMINI_FLASH, 1_048_576),
    (DEEPSEEK_R1, 163_840),
    (DEEPSEEK_V3, 163_840),
    (QWEN_CODER, 262_144),
    (QWEN_MAX, 262_144),
    (QWEN_THINKING, 262_144),
    (KIMI_K2, 131_072),
    (GROK_4, 256_000),
    (CLAUDE_OPUS, 200_000),
    (CLAUDE_SONNET, 200_000),
];

/// Alias, capability and context-window tables. Built once at start-up and read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct ModelDirectory {
    aliases: HashMap<String, String>,
    capabilities: HashMap<Capability, HashSet<String>>,
    context_windows: HashMap<String, u32>,
}

impl Default for ModelDirectory {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelDirectory {
    pub fn builtin() -> Self {
        let aliases = BUILTIN_ALIASES.iter()
            .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
            .collect();
        let capabilities = BUILTIN_CAPABILITIES.iter()
            .map(|(capability, models)| {
                (*capability, models.iter().map(|m| m.to_string()).collect())
            })
            .collect();
        let context_windows = BUILTIN_CONTEXT_WINDOWS.iter()
            .map(|(model, window)| (model.to_string(), *window))
            .collect();

        Self {
            aliases,
            capabilities,
            context_windows,
        }
    }

    /// Built-in tables with the entries of `overrides` added on top.
    pub fn with_overrides(overrides: &ModelsFile) -> Result<Self, ParseCapabilityError> {
        let mut directory = Self::builtin();
        for (alias, canonical) in &overrides.aliases {
            directory.aliases.insert(alias.clone(), canonical.clone());
        }
        for (name, models) in &overrides.capabilities {
            let capability: Capability = name.parse()?;
            directory.capabilities.entry(capability).or_default().extend(models.iter().cloned());
        }
        for (model, window) in &overrides.context_windows {
            directory.context_windows.insert(model.clone(), *window);
        }
        Ok(directory)
    }

    /// Exact, case-sensitive alias lookup.
    pub fn resolve_exact(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    pub fn has_capability(&self, canonical: &str, capability: Capability) -> bool {
        self.capabilities
            .get(&capability)
            .map(|models| models.contains(canonical))
            .unwrap_or(false)
    }

    pub fn context_window(&self, canonical: &str) -> Option<u32> {
        self.context_windows.get(canonical).copied()
    }

    pub fn capabilities_of(&self, canonical: &str) -> Vec<Capability> {
        Capability::ALL.iter()
            .copied()
            .filter(|c| self.has_capability(canonical, *c))
            .collect()
    }

    /// Alias to canonical pairs sorted by alias.
    pub fn aliases(&self) -> BTreeMap<&str, &str> {
        self.aliases
            .iter()
            .map(|(alias, canonical)| (alias.as_str(), canonical.as_str()))
            .collect()
    }

    /// Aliases containing `partial`, followed by near matches by Jaro-Winkler similarity.
    pub fn suggest(&self, partial: &str) -> Vec<String> {
        let needle = partial.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let sorted = self.aliases();
        let mut suggestions: Vec<String> = sorted
            .keys()
            .filter(|alias| alias.contains(&needle))
            .map(|alias| alias.to_string())
            .collect();

        let mut near: Vec<(f64, &str)> = sorted
            .keys()
            .filter(|alias| !alias.contains(&needle))
            .map(|alias| (jaro_winkler(&needle, alias), *alias))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .collect();
        near.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        suggestions.extend(near.into_iter().map(|(_, alias)| alias.to_string()));

        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_alias_resolves() {
        let directory = ModelDirectory::builtin();
        for (alias, canonical) in BUILTIN_ALIASES {
            assert_eq!(directory.resolve_exact(alias), Some(*canonical));
        }
        assert_eq!(directory.resolve_exact("Gemini"), None);
    }

    #[test]
    fn capability_tables_match_builtin_data() {
        let directory = ModelDirectory::builtin();
        assert!(directory.has_capability(GEMINI_PRO, Capability::InternetAccess));
        assert!(!directory.has_capability(GROK_4, Capability::InternetAccess));
        assert!(directory.has_capability(GROK_4, Capability::Vision));
        assert!(directory.has_capability(QWEN_CODER, Capability::FunctionCalling));
        assert!(!directory.has_capability(CLAUDE_SONNET, Capability::LargeContext));
        assert!(directory.has_capability(DEEPSEEK_V3, Capability::LargeContext));
        assert!(!directory.has_capability("unknown/model", Capability::Vision));
    }

    #[test]
    fn unknown_model_has_no_window() {
        let directory = ModelDirectory::builtin();
        assert_eq!(directory.context_window(CLAUDE_OPUS), Some(200_000));
        assert_eq!(directory.context_window("acme/model"), None);
    }

    #[test]
    fn overrides_extend_builtin_tables() {
        let mut overrides = ModelsFile::default();
        overrides.aliases.insert("o3".into(), "openai/o3".into());
        overrides.capabilities.insert("internet_access".into(), vec!["openai/o3".into()]);
        overrides.context_windows.insert("openai/o3".into(), 200_000);

        let directory = ModelDirectory::with_overrides(&overrides).unwrap();
        assert_eq!(directory.resolve_exact("o3"), Some("openai/o3"));
        assert!(directory.has_capability("openai/o3", Capability::InternetAccess));
        assert!(directory.has_capability(GEMINI_PRO, Capability::InternetAccess));
        assert_eq!(directory.context_window("openai/o3"), Some(200_000));
    }

    #[test]
    fn suggest_lists_containing_aliases_first() {
        let directory = ModelDirectory::builtin();
        let suggestions = directory.suggest("qwen");
        assert_eq!(suggestions[..5], ["qwen-coder", "qwen-max", "qwen3-coder", "qwen3-max", "qwen3-thinking"]);

        let typo = directory.suggest("gemnii");
        assert!(typo.contains(&"gemini".to_string()));
    }

    #[test]
    fn capability_parses_dashed_names() {
        assert_eq!("function-calling".parse::<Capability>().unwrap(), Capability::FunctionCalling);
        assert!("smell".parse::<Capability>().is_err());
    }
}
