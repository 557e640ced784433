//! Heuristic classifier: an ordered list of rules evaluated before the model.
//!
//! Rules are installed in this order, and the first match wins:
//! 1. collaborator allow-list → `Collaborators`
//! 2. boss address → `Boss`
//! 3. company domain (or a subdomain) → `Company`
//! 4. configured per-domain overrides → their fixed destination
//! 5. built-ins: security alerts → `Action`, no-reply receipts → `Receipt`,
//!    spam signals → `Spam`, promotional signals → `Junk/Promo`
//!
//! A rule whose category is missing from the taxonomy is never installed.
//! If nothing matches, the caller falls through to the LLM categorizer.

use regex::Regex;
use tracing::debug;

use crate::config::{HeuristicsConfig, Taxonomy};
use crate::error::ConfigError;
use crate::pipeline::sanitizer::{extract_sender_domain, is_noreply_address};
use crate::pipeline::types::{ClassificationResult, ClassificationSource, Email, Priority};

const SECURITY_ALERT_DOMAIN: &str = "accountprotection.microsoft.com";

const RECEIPT_PATTERN: &str = r"(?i)\b(receipt|order confirmation|purchase|invoice|payment (received|confirmed))\b";

const SPAM_PATTERN: &str = r"(?i)(\byou('ve| have) won\b|\bclaim your (prize|reward)\b|\blottery\b|\binheritance\b|\bwire transfer\b|\bcrypto(currency)? (investment|opportunity)\b|\bact now\b.*\bguaranteed\b|\bviagra\b)";

const PROMO_PATTERN: &str = r"(?i)(\d+\s*%\s*off\b|\bsale\b|\bunsubscribe\b|\blimited[- ]time\b|\bspecial offer\b|\bfree shipping\b|\bdeal of the day\b|\bflash deal\b)";

/// Read-only view of an email handed to every rule.
#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    pub sender: &'a str,
    pub from: &'a str,
    pub sender_domain: Option<String>,
    pub from_domain: Option<String>,
    pub subject: &'a str,
    /// Sanitized body.
    pub body: &'a str,
}

impl<'a> RuleContext<'a> {
    pub fn new(email: &'a Email, sanitized_body: &'a str) -> Self {
        Self {
            sender: &email.sender,
            from: &email.from,
            sender_domain: extract_sender_domain(&email.sender),
            from_domain: extract_sender_domain(&email.from),
            subject: &email.subject,
            body: sanitized_body,
        }
    }

    fn addresses(&self) -> impl Iterator<Item = &str> {
        [self.sender, self.from]
            .into_iter()
            .filter(|a| !a.is_empty())
    }

    fn domains(&self) -> impl Iterator<Item = &str> {
        [self.sender_domain.as_deref(), self.from_domain.as_deref()]
            .into_iter()
            .flatten()
    }
}

/// Which field a pattern rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
    /// Subject, then body.
    SubjectOrBody,
}

/// Condition half of a rule.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Sender or from address is in the list (lower-cased).
    AddressIn(Vec<String>),
    /// Sender or from address equals this one (lower-cased).
    AddressIs(String),
    /// Sender or from domain equals `domain` or is a subdomain of it.
    Domain(String),
    /// Regex over one field.
    Pattern { field: RuleField, regex: Regex },
    /// Automated sender (no-reply style) and a subject pattern.
    NoReplyWithSubject(Regex),
}

impl RuleMatcher {
    pub fn pattern(field: RuleField, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Pattern {
            field,
            regex: Regex::new(pattern)?,
        })
    }

    pub fn matches(&self, ctx: &RuleContext<'_>) -> bool {
        match self {
            Self::AddressIn(list) => ctx
                .addresses()
                .any(|a| list.iter().any(|l| l.eq_ignore_ascii_case(a))),
            Self::AddressIs(address) => ctx.addresses().any(|a| a.eq_ignore_ascii_case(address)),
            Self::Domain(domain) => ctx.domains().any(|d| domain_matches(d, domain)),
            Self::Pattern { field, regex } => match field {
                RuleField::Sender => ctx.addresses().any(|a| regex.is_match(a)),
                RuleField::Subject => regex.is_match(ctx.subject),
                RuleField::Body => regex.is_match(ctx.body),
                RuleField::SubjectOrBody => regex.is_match(ctx.subject) || regex.is_match(ctx.body),
            },
            Self::NoReplyWithSubject(regex) => {
                ctx.addresses().any(is_noreply_address) && regex.is_match(ctx.subject)
            }
        }
    }
}

/// Result half of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub category: String,
    pub sub_category: Option<String>,
    pub priority: Priority,
    pub analysis: String,
    pub sender_goal: String,
}

impl RuleOutcome {
    pub fn new(category: impl Into<String>, priority: Priority) -> Self {
        Self {
            category: category.into(),
            sub_category: None,
            priority,
            analysis: String::new(),
            sender_goal: String::new(),
        }
    }

    pub fn with_sub_category(mut self, sub: impl Into<String>) -> Self {
        self.sub_category = Some(sub.into());
        self
    }

    pub fn with_analysis(mut self, analysis: impl Into<String>) -> Self {
        self.analysis = analysis.into();
        self
    }

    pub fn with_sender_goal(mut self, goal: impl Into<String>) -> Self {
        self.sender_goal = goal.into();
        self
    }
}

/// A named rule: a matcher and the classification it produces.
#[derive(Debug, Clone)]
pub struct HeuristicRule {
    pub name: String,
    pub matcher: RuleMatcher,
    pub outcome: RuleOutcome,
}

impl HeuristicRule {
    pub fn new(name: impl Into<String>, matcher: RuleMatcher, outcome: RuleOutcome) -> Self {
        Self {
            name: name.into(),
            matcher,
            outcome,
        }
    }

    fn classify(&self) -> ClassificationResult {
        ClassificationResult {
            category: self.outcome.category.clone(),
            sub_category: self.outcome.sub_category.clone(),
            priority: self.outcome.priority,
            analysis: self.outcome.analysis.clone(),
            sender_goal: self.outcome.sender_goal.clone(),
            source: ClassificationSource::Heuristic {
                rule: self.name.clone(),
            },
        }
    }
}

/// Ordered first-match rule engine.
#[derive(Debug, Clone, Default)]
pub struct RulesEngine {
    rules: Vec<HeuristicRule>,
}

impl RulesEngine {
    /// Create an empty rules engine.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Use exactly these rules, in this order.
    pub fn with_rules(rules: Vec<HeuristicRule>) -> Self {
        Self { rules }
    }

    /// Build the standard rule list from organisational config.
    pub fn from_config(heuristics: &HeuristicsConfig, taxonomy: &Taxonomy) -> Result<Self, ConfigError> {
        let mut engine = Self::empty();

        if !heuristics.collaborator_emails.is_empty() {
            engine.install(
                taxonomy,
                HeuristicRule::new(
                    "collaborator",
                    RuleMatcher::AddressIn(heuristics.collaborator_emails.clone()),
                    RuleOutcome::new("Collaborators", Priority::Medium)
                        .with_analysis("Sender is on the collaborator list")
                        .with_sender_goal("Share a work update"),
                ),
            );
        }

        if let Some(boss) = &heuristics.boss_email {
            engine.install(
                taxonomy,
                HeuristicRule::new(
                    "boss",
                    RuleMatcher::AddressIs(boss.to_ascii_lowercase()),
                    RuleOutcome::new("Boss", Priority::High)
                        .with_analysis("Email from boss")
                        .with_sender_goal("Request your attention"),
                ),
            );
        }

        if let Some(domain) = &heuristics.company_domain {
            engine.install(
                taxonomy,
                HeuristicRule::new(
                    "company_domain",
                    RuleMatcher::Domain(domain.to_ascii_lowercase()),
                    RuleOutcome::new("Company", Priority::Medium)
                        .with_analysis(format!("Email from company domain ({domain})"))
                        .with_sender_goal("Provide a company update"),
                ),
            );
        }

        for rule in &heuristics.domain_rules {
            let mut outcome = RuleOutcome::new(rule.category.clone(), Priority::Low)
                .with_analysis(format!("Email from routed domain {}", rule.domain));
            outcome.sub_category = rule.sub_category.clone();
            engine.install(
                taxonomy,
                HeuristicRule::new(
                    format!("domain:{}", rule.domain),
                    RuleMatcher::Domain(rule.domain.clone()),
                    outcome,
                ),
            );
        }

        engine.install(
            taxonomy,
            HeuristicRule::new(
                "security_alert",
                RuleMatcher::Domain(SECURITY_ALERT_DOMAIN.into()),
                RuleOutcome::new("Action", Priority::High)
                    .with_analysis("Microsoft account security alert")
                    .with_sender_goal("Verify new account sign-in"),
            ),
        );

        engine.install(
            taxonomy,
            HeuristicRule::new(
                "receipt",
                RuleMatcher::NoReplyWithSubject(compile("receipt", RECEIPT_PATTERN)?),
                RuleOutcome::new("Receipt", Priority::Low)
                    .with_analysis("Purchase confirmation from an automated sender")
                    .with_sender_goal("Confirm your purchase"),
            ),
        );

        engine.install(
            taxonomy,
            HeuristicRule::new(
                "spam_signal",
                RuleMatcher::Pattern {
                    field: RuleField::SubjectOrBody,
                    regex: compile("spam_signal", SPAM_PATTERN)?,
                },
                RuleOutcome::new("Spam", Priority::Low)
                    .with_analysis("Matches common spam phrasing")
                    .with_sender_goal("Solicit money or data"),
            ),
        );

        engine.install(
            taxonomy,
            HeuristicRule::new(
                "promo_signal",
                RuleMatcher::Pattern {
                    field: RuleField::Subject,
                    regex: compile("promo_signal", PROMO_PATTERN)?,
                },
                RuleOutcome::new("Junk", Priority::Low)
                    .with_sub_category("Promo")
                    .with_analysis("Promotional wording in subject")
                    .with_sender_goal("Sell a product"),
            ),
        );

        Ok(engine)
    }

    /// Append `rule` if its category exists, canonicalising the category name.
    fn install(&mut self, taxonomy: &Taxonomy, mut rule: HeuristicRule) {
        match taxonomy.canonical(&rule.outcome.category) {
            Some(canonical) => {
                rule.outcome.category = canonical.to_string();
                self.rules.push(rule);
            }
            None => debug!(
                rule = %rule.name,
                category = %rule.outcome.category,
                "Category not in taxonomy, rule not installed"
            ),
        }
    }

    /// Append a rule unconditionally.
    pub fn push(&mut self, rule: HeuristicRule) {
        self.rules.push(rule);
    }

    /// Append a regex rule.
    pub fn add_pattern_rule(
        &mut self,
        name: &str,
        field: RuleField,
        pattern: &str,
        outcome: RuleOutcome,
    ) -> Result<(), ConfigError> {
        let regex = compile(name, pattern)?;
        self.rules.push(HeuristicRule::new(
            name,
            RuleMatcher::Pattern { field, regex },
            outcome,
        ));
        Ok(())
    }

    pub fn rules(&self) -> &[HeuristicRule] {
        &self.rules
    }

    /// Mutable access for reordering.
    pub fn rules_mut(&mut self) -> &mut Vec<HeuristicRule> {
        &mut self.rules
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Evaluate rules in order.
    ///
    /// Returns the first matching rule's classification, or `None` to fall
    /// through to the model.
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<ClassificationResult> {
        let rule = self.rules.iter().find(|r| r.matcher.matches(ctx))?;
        debug!(
            sender = %ctx.sender,
            rule = %rule.name,
            category = %rule.outcome.category,
            "Message matched heuristic rule"
        );
        Some(rule.classify())
    }
}

fn compile(rule: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        rule: rule.to_string(),
        source,
    })
}

fn domain_matches(candidate: &str, domain: &str) -> bool {
    let candidate = candidate.to_ascii_lowercase();
    let domain = domain.trim_start_matches('@').to_ascii_lowercase();
    candidate == domain
        || candidate
            .strip_suffix(&domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainRule;
    use crate::pipeline::types::EmailBody;

    fn make_email(sender: &str, subject: &str) -> Email {
        Email {
            id: "test-1".into(),
            subject: subject.into(),
            sender: sender.into(),
            from: sender.into(),
            body: EmailBody::text(""),
            received_at: None,
            importance: "normal".into(),
            tags: vec![],
            flagged: false,
            folder_id: "inbox".into(),
        }
    }

    fn heuristics() -> HeuristicsConfig {
        HeuristicsConfig {
            boss_email: Some("boss@acme.com".into()),
            company_domain: Some("acme.com".into()),
            collaborator_emails: vec!["pal@acme.com".into()],
            management_emails: vec![],
            direct_report_emails: vec![],
            domain_rules: vec![DomainRule::parse("em.delhaize.be=Business/Delhaize").unwrap()],
        }
    }

    fn engine() -> RulesEngine {
        RulesEngine::from_config(&heuristics(), &Taxonomy::default()).unwrap()
    }

    fn classify(engine: &RulesEngine, email: &Email) -> Option<ClassificationResult> {
        engine.evaluate(&RuleContext::new(email, ""))
    }

    #[test]
    fn installs_rules_in_documented_order() {
        assert_eq!(
            engine().rule_names(),
            [
                "collaborator",
                "boss",
                "company_domain",
                "domain:em.delhaize.be",
                "security_alert",
                "receipt",
                "spam_signal",
                "promo_signal",
            ]
        );
    }

    #[test]
    fn boss_is_high_priority() {
        let result = classify(&engine(), &make_email("boss@acme.com", "Status")).unwrap();
        assert_eq!(result.category, "Boss");
        assert_eq!(result.priority, Priority::High);
        assert_eq!(
            result.source,
            ClassificationSource::Heuristic { rule: "boss".into() }
        );
    }

    #[test]
    fn boss_matches_from_address_too() {
        let mut email = make_email("assistant@acme.com", "On behalf");
        email.from = "boss@acme.com".into();
        assert_eq!(classify(&engine(), &email).unwrap().category, "Boss");
    }

    #[test]
    fn collaborator_beats_company_domain() {
        let result = classify(&engine(), &make_email("pal@acme.com", "Notes")).unwrap();
        assert_eq!(result.category, "Collaborators");
    }

    #[test]
    fn company_domain_matches_relayed_from_address() {
        let mut email = make_email("bounce@mailer.relay.example", "Team update");
        email.from = "carol@acme.com".into();
        let result = classify(&engine(), &email).unwrap();
        assert_eq!(result.category, "Company");
        assert_eq!(
            result.source,
            ClassificationSource::Heuristic { rule: "company_domain".into() }
        );
    }

    #[test]
    fn company_domain_includes_subdomains() {
        let result = classify(&engine(), &make_email("hr@mail.acme.com", "Policy")).unwrap();
        assert_eq!(result.category, "Company");
        assert!(classify(&engine(), &make_email("x@notacme.com", "Hi")).is_none());
    }

    #[test]
    fn domain_override_routes_to_subcategory() {
        let result = classify(&engine(), &make_email("deals@em.delhaize.be", "Weekly")).unwrap();
        assert_eq!(result.category, "Business");
        assert_eq!(result.sub_category.as_deref(), Some("Delhaize"));
    }

    #[test]
    fn domain_override_beats_promo_signal() {
        let result =
            classify(&engine(), &make_email("deals@em.delhaize.be", "50% off this week")).unwrap();
        assert_eq!(result.category, "Business");
    }

    #[test]
    fn security_alert_is_action() {
        let email = make_email(
            "account-security-noreply@accountprotection.microsoft.com",
            "Microsoft account security alert",
        );
        let result = classify(&engine(), &email).unwrap();
        assert_eq!(result.category, "Action");
        assert_eq!(result.priority, Priority::High);
    }

    #[test]
    fn noreply_receipt() {
        let email = make_email("no-reply@shop.example", "Your receipt from Shop");
        assert_eq!(classify(&engine(), &email).unwrap().category, "Receipt");
    }

    #[test]
    fn receipt_requires_noreply_sender() {
        let email = make_email("alice@shop.example", "Your receipt from Shop");
        assert!(classify(&engine(), &email).is_none());
    }

    #[test]
    fn spam_signal_in_body() {
        let email = make_email("stranger@random.example", "Hello friend");
        let result = engine()
            .evaluate(&RuleContext::new(&email, "Congratulations, you have won the lottery"))
            .unwrap();
        assert_eq!(result.category, "Spam");
    }

    #[test]
    fn promo_signal_routes_to_junk_promo() {
        let email = make_email("stranger@random.example", "50% OFF SALE - unsubscribe");
        let result = classify(&engine(), &email).unwrap();
        assert_eq!(result.category, "Junk");
        assert_eq!(result.sub_category.as_deref(), Some("Promo"));
    }

    #[test]
    fn unmatched_email_falls_through() {
        let email = make_email("alice@elsewhere.org", "Coffee next week?");
        assert!(classify(&engine(), &email).is_none());
    }

    #[test]
    fn rules_outside_taxonomy_are_not_installed() {
        let taxonomy = Taxonomy::from_names(["Boss", "Other"]);
        let engine = RulesEngine::from_config(&heuristics(), &taxonomy).unwrap();
        assert_eq!(engine.rule_names(), ["boss"]);
    }

    #[test]
    fn category_is_canonicalised_on_install() {
        let mut config = heuristics();
        config.domain_rules = vec![DomainRule::parse("x.com=business").unwrap()];
        let engine = RulesEngine::from_config(&config, &Taxonomy::default()).unwrap();
        let result = classify(&engine, &make_email("a@x.com", "Hi")).unwrap();
        assert_eq!(result.category, "Business");
    }

    #[test]
    fn reordering_changes_the_winner() {
        let mut engine = engine();
        let email = make_email("pal@acme.com", "Notes");
        assert_eq!(classify(&engine, &email).unwrap().category, "Collaborators");

        // Move company_domain ahead of collaborator.
        engine.rules_mut().swap(0, 2);
        assert_eq!(classify(&engine, &email).unwrap().category, "Company");
    }

    #[test]
    fn custom_pattern_rule() {
        let mut engine = RulesEngine::empty();
        engine
            .add_pattern_rule(
                "github",
                RuleField::Sender,
                r"(?i)^notifications@github\.com$",
                RuleOutcome::new("Community", Priority::Low).with_sub_category("GitHub"),
            )
            .unwrap();
        let result = classify(&engine, &make_email("notifications@github.com", "PR")).unwrap();
        assert_eq!(result.label(), "Community/GitHub");
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let mut engine = RulesEngine::empty();
        let err = engine
            .add_pattern_rule("broken", RuleField::Subject, "(unclosed", RuleOutcome::new("Other", Priority::Low))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn empty_engine_passes_everything() {
        let email = make_email("noreply@company.com", "Receipt");
        assert!(classify(&RulesEngine::empty(), &email).is_none());
    }
}
