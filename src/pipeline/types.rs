//! Shared types for the sorting pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

// ── Email ───────────────────────────────────────────────────────────

/// Declared content type of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Html,
    #[default]
    Text,
}

impl ContentType {
    /// Parse a declared content type. Anything that is not HTML is text.
    pub fn parse(s: &str) -> Self {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "html" || lower.starts_with("text/html") {
            Self::Html
        } else {
            Self::Text
        }
    }
}

/// Raw message body as returned by the mailbox store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailBody {
    pub content_type: ContentType,
    pub content: String,
}

impl EmailBody {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            content: content.into(),
        }
    }

    pub fn html(content: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Html,
            content: content.into(),
        }
    }
}

/// A message fetched from the mailbox. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    /// Opaque store identifier.
    pub id: String,
    pub subject: String,
    /// Sender address, lower-cased.
    pub sender: String,
    /// `From` address, lower-cased. Differs from `sender` for delegated mail.
    pub from: String,
    pub body: EmailBody,
    pub received_at: Option<DateTime<Utc>>,
    /// Store-reported importance ("low", "normal", "high").
    pub importance: String,
    /// Category tags already present on the message.
    pub tags: Vec<String>,
    /// Flagged for follow-up by the user. Flagged mail is never sorted.
    #[serde(default)]
    pub flagged: bool,
    /// Folder the message was fetched from.
    pub folder_id: String,
}

impl Email {
    /// Whether the message already carries `tag` (case-insensitive).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    #[default]
    Low,
}

impl Priority {
    /// Strict parse; anything outside `high|medium|low` is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassificationSource {
    /// A heuristic rule matched.
    Heuristic { rule: String },
    /// The model answered with a valid classification.
    Model,
    /// The model failed or answered with something unusable.
    Fallback,
}

/// Result of classifying one email. Produced once per email per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: String,
    pub sub_category: Option<String>,
    pub priority: Priority,
    /// Short rationale. Holds the error text for fallback results.
    pub analysis: String,
    /// Few-word description of why the sender wrote.
    pub sender_goal: String,
    pub source: ClassificationSource,
}

impl ClassificationResult {
    /// Destination path for this classification.
    pub fn folder_path(&self) -> FolderPath {
        let mut segments = vec![self.category.clone()];
        if let Some(sub) = &self.sub_category {
            segments.push(sub.clone());
        }
        FolderPath::new(segments)
    }

    /// `Category` or `Category/Sub` for logs and reports.
    pub fn label(&self) -> String {
        match &self.sub_category {
            Some(sub) => format!("{}/{}", self.category, sub),
            None => self.category.clone(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == ClassificationSource::Fallback
    }
}

// ── Folder paths ────────────────────────────────────────────────────

/// Ordered display names from a root, e.g. `["Business", "Delhaize"]`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FolderPath {
    segments: Vec<String>,
}

impl FolderPath {
    /// Build from segments, dropping blank ones.
    pub fn new(segments: Vec<String>) -> Self {
        Self {
            segments: segments
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Parse a human label such as `Inbox/Boss` or `Inbox\Boss`.
    pub fn parse(label: &str) -> Self {
        Self::new(
            label
                .replace('\\', "/")
                .split('/')
                .map(str::to_string)
                .collect(),
        )
    }

    /// Prefix `self` with `root`.
    pub fn under(&self, root: &FolderPath) -> Self {
        let mut segments = root.segments.clone();
        segments.extend(self.segments.iter().cloned());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl std::fmt::Display for FolderPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

// ── Per-email state machine ─────────────────────────────────────────

/// Pipeline state of one email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailState {
    Fetched,
    Classified,
    FolderResolved,
    Moved,
    Tagged,
    Done,
    /// Absorbing failure state. The reason lives on the outcome.
    Failed,
}

impl EmailState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: EmailState) -> bool {
        use EmailState::*;

        if target == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            (Fetched, Classified)
                | (Classified, FolderResolved)
                | (FolderResolved, Moved)
                | (Moved, Tagged)
                // Tag failure still completes the email.
                | (Moved, Done)
                | (Tagged, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for EmailState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fetched => "fetched",
            Self::Classified => "classified",
            Self::FolderResolved => "folder_resolved",
            Self::Moved => "moved",
            Self::Tagged => "tagged",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Error recorded on an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub code: ErrorCode,
    pub message: String,
}

impl OutcomeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for OutcomeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Per-email result returned to the caller. Never persisted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: Option<DateTime<Utc>>,
    pub classification: Option<ClassificationResult>,
    pub target_path: Option<FolderPath>,
    pub target_folder_id: Option<String>,
    pub state: EmailState,
    pub moved: bool,
    pub tagged: bool,
    /// Why the email ended in `Failed`.
    pub error: Option<OutcomeError>,
    /// Set when the move succeeded but tagging did not.
    pub tag_warning: Option<OutcomeError>,
    pub dry_run: bool,
    /// States visited, in order.
    pub transitions: Vec<EmailState>,
}

impl ProcessingOutcome {
    /// Fresh outcome in the `Fetched` state.
    pub fn fetched(email: &Email, dry_run: bool) -> Self {
        Self {
            email_id: email.id.clone(),
            subject: email.subject.clone(),
            sender: email.sender.clone(),
            received_at: email.received_at,
            classification: None,
            target_path: None,
            target_folder_id: None,
            state: EmailState::Fetched,
            moved: false,
            tagged: false,
            error: None,
            tag_warning: None,
            dry_run,
            transitions: vec![EmailState::Fetched],
        }
    }

    /// Whether the email reached `Done` (or the end of a dry run) without failing.
    pub fn is_success(&self) -> bool {
        match self.state {
            EmailState::Done => true,
            EmailState::FolderResolved => self.dry_run,
            _ => false,
        }
    }

    pub fn category(&self) -> &str {
        self.classification
            .as_ref()
            .map(|c| c.category.as_str())
            .unwrap_or("Other")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_parse() {
        assert_eq!(ContentType::parse("html"), ContentType::Html);
        assert_eq!(ContentType::parse("HTML"), ContentType::Html);
        assert_eq!(ContentType::parse("text/html; charset=utf-8"), ContentType::Html);
        assert_eq!(ContentType::parse("text"), ContentType::Text);
        assert_eq!(ContentType::parse(""), ContentType::Text);
    }

    #[test]
    fn priority_parse_is_strict() {
        assert_eq!(Priority::parse("High"), Some(Priority::High));
        assert_eq!(Priority::parse(" low "), Some(Priority::Low));
        assert_eq!(Priority::parse("urgent"), None);
        assert_eq!(Priority::parse(""), None);
    }

    #[test]
    fn folder_path_parse_handles_both_separators() {
        let path = FolderPath::parse(" Inbox\\Boss / Weekly ");
        assert_eq!(path.segments(), ["Inbox", "Boss", "Weekly"]);
        assert_eq!(path.to_string(), "Inbox/Boss/Weekly");
    }

    #[test]
    fn folder_path_drops_blank_segments() {
        assert!(FolderPath::parse("//").is_empty());
        assert_eq!(FolderPath::parse("/Business//").segments(), ["Business"]);
    }

    #[test]
    fn folder_path_under_root() {
        let root = FolderPath::parse("Inbox");
        let path = FolderPath::parse("Junk/Promo").under(&root);
        assert_eq!(path.to_string(), "Inbox/Junk/Promo");
        assert_eq!(path.segments().len(), 3);
    }

    #[test]
    fn classification_path_and_label() {
        let result = ClassificationResult {
            category: "Business".into(),
            sub_category: Some("Delhaize".into()),
            priority: Priority::Low,
            analysis: String::new(),
            sender_goal: String::new(),
            source: ClassificationSource::Model,
        };
        assert_eq!(result.folder_path().segments(), ["Business", "Delhaize"]);
        assert_eq!(result.label(), "Business/Delhaize");
    }

    #[test]
    fn state_machine_happy_path() {
        use EmailState::*;
        let path = [Fetched, Classified, FolderResolved, Moved, Tagged, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn state_machine_tag_failure_still_done() {
        assert!(EmailState::Moved.can_transition_to(EmailState::Done));
    }

    #[test]
    fn state_machine_rejects_skips_and_exits_from_terminal() {
        use EmailState::*;
        assert!(!Fetched.can_transition_to(Moved));
        assert!(!Classified.can_transition_to(Done));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Classified));
        assert!(Classified.can_transition_to(Failed));
        assert!(Moved.can_transition_to(Failed));
    }

    #[test]
    fn email_has_tag_case_insensitive() {
        let email = Email {
            id: "1".into(),
            subject: String::new(),
            sender: String::new(),
            from: String::new(),
            body: EmailBody::default(),
            received_at: None,
            importance: "normal".into(),
            tags: vec!["categorized".into()],
            flagged: false,
            folder_id: "inbox".into(),
        };
        assert!(email.has_tag("Categorized"));
        assert!(!email.has_tag("Other"));
    }

    #[test]
    fn outcome_success_rules() {
        let email = Email {
            id: "1".into(),
            subject: "s".into(),
            sender: "a@b.c".into(),
            from: "a@b.c".into(),
            body: EmailBody::default(),
            received_at: None,
            importance: "normal".into(),
            tags: vec![],
            flagged: false,
            folder_id: "inbox".into(),
        };
        let mut outcome = ProcessingOutcome::fetched(&email, true);
        assert!(!outcome.is_success());
        outcome.state = EmailState::FolderResolved;
        assert!(outcome.is_success());
        outcome.dry_run = false;
        assert!(!outcome.is_success());
        outcome.state = EmailState::Done;
        assert!(outcome.is_success());
    }
}
