//! Configuration types.
//!
//! Everything here is plain data with `Default` plus a `from_env()` constructor.
//! Store and model credentials live with their adapters (`GraphConfig`, `LlmConfig`).

use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

// ── Taxonomy ────────────────────────────────────────────────────────

/// One category of the taxonomy, with the hint shown to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryDef {
    pub name: String,
    pub description: String,
}

impl CategoryDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// The enumerated set of categories. List order is the decision order given to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taxonomy {
    categories: Vec<CategoryDef>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::new(vec![
            CategoryDef::new("Boss", "Sent by the configured boss address"),
            CategoryDef::new("Collaborators", "Sent by someone on the collaborator list"),
            CategoryDef::new("Security", "Account security, sign-in and password notices"),
            CategoryDef::new("Action", "Requires the reader to do something, often with a deadline"),
            CategoryDef::new("Response", "Expects a written reply but no other action"),
            CategoryDef::new("Company", "Internal mail from the company domain"),
            CategoryDef::new("Receipt", "Orders, invoices, payments and shipping confirmations"),
            CategoryDef::new("Business", "External business contacts, partners and vendors"),
            CategoryDef::new("Community", "Newsletters, forums, groups and events the reader joined"),
            CategoryDef::new("Junk", "Promotions, marketing and bulk mail"),
            CategoryDef::new("Spam", "Unsolicited, deceptive or phishing mail"),
            CategoryDef::new("Other", "Anything that fits no other category"),
        ])
    }
}

impl Taxonomy {
    /// Build a taxonomy, dropping blank and duplicate (case-insensitive) names.
    pub fn new(categories: Vec<CategoryDef>) -> Self {
        let mut kept: Vec<CategoryDef> = Vec::with_capacity(categories.len());
        for mut def in categories {
            def.name = def.name.trim().to_string();
            if def.name.is_empty() || kept.iter().any(|k| k.name.eq_ignore_ascii_case(&def.name)) {
                continue;
            }
            kept.push(def);
        }
        Self { categories: kept }
    }

    /// Build from bare names, reusing the default descriptions where names match.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let defaults = Self::default();
        Self::new(
            names
                .into_iter()
                .map(|name| {
                    let name = name.as_ref().trim();
                    let description = defaults
                        .get(name)
                        .map(|d| d.description.clone())
                        .unwrap_or_default();
                    CategoryDef::new(name, description)
                })
                .collect(),
        )
    }

    pub fn categories(&self) -> &[CategoryDef] {
        &self.categories
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|c| c.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&CategoryDef> {
        let name = name.trim();
        self.categories
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Canonical spelling of `name`, matched case-insensitively.
    pub fn canonical(&self, name: &str) -> Option<&str> {
        self.get(name).map(|c| c.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

// ── Heuristics ──────────────────────────────────────────────────────

/// Route every message from `domain` (or a subdomain) to a fixed destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRule {
    pub domain: String,
    pub category: String,
    pub sub_category: Option<String>,
}

impl DomainRule {
    /// Parse `domain=Category` or `domain=Category/Sub`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidValue {
            key: "SORTER_DOMAIN_RULES".into(),
            message: format!("{message}: {raw:?}"),
        };

        let (domain, target) = raw.split_once('=').ok_or_else(|| invalid("expected domain=Category[/Sub]"))?;
        let domain = domain.trim().trim_start_matches('@').to_ascii_lowercase();
        if domain.is_empty() {
            return Err(invalid("empty domain"));
        }

        let mut parts = target.split('/').map(str::trim);
        let category = parts.next().unwrap_or_default().to_string();
        if category.is_empty() {
            return Err(invalid("empty category"));
        }
        let sub_category = parts
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if parts.next().is_some() {
            return Err(invalid("only one subcategory level is allowed"));
        }

        Ok(Self {
            domain,
            category,
            sub_category,
        })
    }
}

/// Inputs for the organisational heuristics and the model's context section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeuristicsConfig {
    pub boss_email: Option<String>,
    pub company_domain: Option<String>,
    pub collaborator_emails: Vec<String>,
    pub management_emails: Vec<String>,
    pub direct_report_emails: Vec<String>,
    pub domain_rules: Vec<DomainRule>,
}

impl HeuristicsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let domain_rules = env_list("SORTER_DOMAIN_RULES")
            .iter()
            .map(|raw| DomainRule::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            boss_email: env_opt("SORTER_BOSS_EMAIL").map(|s| s.to_ascii_lowercase()),
            company_domain: env_opt("SORTER_COMPANY_DOMAIN")
                .map(|s| s.trim_start_matches('@').to_ascii_lowercase()),
            collaborator_emails: lowercase(env_list("SORTER_COLLABORATOR_EMAILS")),
            management_emails: lowercase(env_list("SORTER_MANAGEMENT_EMAILS")),
            direct_report_emails: lowercase(env_list("SORTER_DIRECT_REPORT_EMAILS")),
            domain_rules,
        })
    }
}

// ── Sorter ──────────────────────────────────────────────────────────

/// How `resolve_label` picks between folders sharing a display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelTieBreak {
    /// Closest to the mailbox root wins; a tie below the root is an error.
    #[default]
    PreferShallowest,
    /// Any duplicate is an error.
    RequireUnique,
}

impl LabelTieBreak {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shallowest" | "prefer_shallowest" => Some(Self::PreferShallowest),
            "unique" | "require_unique" => Some(Self::RequireUnique),
            _ => None,
        }
    }
}

/// Top-level configuration for one sorting run.
#[derive(Debug, Clone)]
pub struct SorterConfig {
    pub taxonomy: Taxonomy,
    /// Category used when the model fails. Must be in the taxonomy.
    pub fallback_category: String,
    /// Idempotency tag stamped on every moved message.
    pub processed_tag: String,
    /// Default batch limit.
    pub batch_size: usize,
    /// Folder fetched when the caller names no source.
    pub default_source_folder: String,
    /// Optional label under which category folders are created, e.g. `Inbox`.
    pub destination_root: Option<String>,
    pub label_tie_break: LabelTieBreak,
    pub retry: RetryPolicy,
    /// Sanitized body limit.
    pub max_body_chars: usize,
    /// Body limit inside the model prompt.
    pub prompt_body_chars: usize,
    pub llm_max_tokens: u32,
    pub heuristics: HeuristicsConfig,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            taxonomy: Taxonomy::default(),
            fallback_category: "Other".to_string(),
            processed_tag: "Categorized".to_string(),
            batch_size: 10,
            default_source_folder: "inbox".to_string(),
            destination_root: None,
            label_tie_break: LabelTieBreak::default(),
            retry: RetryPolicy::default(),
            max_body_chars: 4000,
            prompt_body_chars: 1200,
            llm_max_tokens: 900,
            heuristics: HeuristicsConfig::default(),
        }
    }
}

impl SorterConfig {
    /// Build config from `SORTER_*` environment variables. Unset values keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let categories = env_list("SORTER_CATEGORIES");
        let taxonomy = if categories.is_empty() {
            defaults.taxonomy
        } else {
            Taxonomy::from_names(categories)
        };

        let batch_size: usize = env_parse("SORTER_BATCH_SIZE")?.unwrap_or(defaults.batch_size);
        if !(1..=50).contains(&batch_size) {
            return Err(ConfigError::InvalidValue {
                key: "SORTER_BATCH_SIZE".into(),
                message: format!("{batch_size} is outside 1..=50"),
            });
        }

        let label_tie_break = match env_opt("SORTER_LABEL_TIE_BREAK") {
            Some(raw) => LabelTieBreak::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "SORTER_LABEL_TIE_BREAK".into(),
                message: format!("expected 'shallowest' or 'unique', got {raw:?}"),
            })?,
            None => defaults.label_tie_break,
        };

        let retry = RetryPolicy {
            max_attempts: env_parse("SORTER_RETRY_MAX_ATTEMPTS")?
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: env_parse::<u64>("SORTER_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            ..defaults.retry
        };

        let config = Self {
            taxonomy,
            fallback_category: env_opt("SORTER_FALLBACK_CATEGORY")
                .unwrap_or(defaults.fallback_category),
            processed_tag: env_opt("SORTER_PROCESSED_TAG").unwrap_or(defaults.processed_tag),
            batch_size,
            default_source_folder: env_opt("SORTER_SOURCE_FOLDER_ID")
                .unwrap_or(defaults.default_source_folder),
            destination_root: env_opt("SORTER_DESTINATION_ROOT"),
            label_tie_break,
            retry,
            max_body_chars: env_parse("SORTER_MAX_BODY_CHARS")?.unwrap_or(defaults.max_body_chars),
            prompt_body_chars: defaults.prompt_body_chars,
            llm_max_tokens: env_parse("SORTER_LLM_MAX_TOKENS")?.unwrap_or(defaults.llm_max_tokens),
            heuristics: HeuristicsConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints and canonicalise the fallback category.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.taxonomy.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "SORTER_CATEGORIES".into(),
                message: "taxonomy is empty".into(),
            });
        }
        if !self.taxonomy.contains(&self.fallback_category) {
            return Err(ConfigError::InvalidValue {
                key: "SORTER_FALLBACK_CATEGORY".into(),
                message: format!("{:?} is not in the taxonomy", self.fallback_category),
            });
        }
        if self.processed_tag.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "SORTER_PROCESSED_TAG".into(),
                hint: "The idempotency tag cannot be blank.".into(),
            });
        }
        Ok(())
    }

    /// The fallback category spelled as in the taxonomy.
    pub fn fallback_category(&self) -> &str {
        self.taxonomy
            .canonical(&self.fallback_category)
            .unwrap_or(&self.fallback_category)
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

pub(crate) fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        None => Ok(None),
    }
}

fn env_list(key: &str) -> Vec<String> {
    split_list(&std::env::var(key).unwrap_or_default())
}

/// Split a comma-separated list, trimming entries and dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn lowercase(values: Vec<String>) -> Vec<String> {
    values.into_iter().map(|s| s.to_ascii_lowercase()).collect()
}
