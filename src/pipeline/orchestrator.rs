//! Batch orchestrator: fetch → classify → resolve folder → move → tag.
//!
//! Emails are processed one at a time. Each one walks the [`EmailState`]
//! machine and ends in exactly one [`ProcessingOutcome`]; a failing email
//! never aborts the batch. Only setup failures (source selection, the
//! initial fetch) make [`Orchestrator::run`] return `Err`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::SorterConfig;
use crate::error::{ConfigError, ErrorCode, PipelineError};
use crate::folders::FolderResolver;
use crate::llm::provider::LlmProvider;
use crate::pipeline::categorizer::LlmCategorizer;
use crate::pipeline::mover::Mover;
use crate::pipeline::rules::{RuleContext, RulesEngine};
use crate::pipeline::sanitizer::sanitize_body;
use crate::pipeline::types::{
    ClassificationResult, ClassificationSource, Email, EmailState, OutcomeError, ProcessingOutcome,
};
use crate::store::{MailboxStore, MessageQuery};

/// Upper bound on messages visited by one tag backfill.
const BACKFILL_LIMIT: usize = 1000;

// ── Run options ─────────────────────────────────────────────────────

/// Where a run fetches its candidate emails from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SourceSelection {
    /// The configured default folder, skipping already-tagged mail.
    #[default]
    Default,
    /// An explicit folder id. Includes subfolders and tagged mail.
    FolderId(String),
    /// An explicit folder label such as `Business` or `Inbox/Boss`.
    /// Includes subfolders and tagged mail.
    Label(String),
}

impl SourceSelection {
    pub fn is_explicit(&self) -> bool {
        !matches!(self, Self::Default)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Batch limit. Falls back to the configured batch size.
    pub limit: Option<usize>,
    /// Classify and resolve folders without creating, moving or tagging.
    pub dry_run: bool,
    pub source: SourceSelection,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_source(mut self, source: SourceSelection) -> Self {
        self.source = source;
        self
    }
}

// ── Reports ─────────────────────────────────────────────────────────

/// Everything a run did, in processing order.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_folder_id: String,
    pub outcomes: Vec<ProcessingOutcome>,
    /// Fetched emails dropped because they already carry the idempotency tag.
    pub skipped_already_tagged: usize,
    /// Fetched emails dropped because the user flagged them for follow-up.
    pub skipped_flagged: usize,
    pub skipped_duplicates: usize,
    /// The cancel flag stopped the run before the batch was exhausted.
    pub cancelled: bool,
}

impl RunReport {
    fn new(run_id: Uuid, source_folder_id: String) -> Self {
        Self {
            run_id,
            source_folder_id,
            outcomes: Vec::new(),
            skipped_already_tagged: 0,
            skipped_flagged: 0,
            skipped_duplicates: 0,
            cancelled: false,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == EmailState::Failed)
            .count()
    }

    pub fn moved(&self) -> usize {
        self.outcomes.iter().filter(|o| o.moved).count()
    }

    /// Outcomes grouped by category, categories sorted by name.
    pub fn by_category(&self) -> BTreeMap<&str, Vec<&ProcessingOutcome>> {
        let mut groups: BTreeMap<&str, Vec<&ProcessingOutcome>> = BTreeMap::new();
        for outcome in &self.outcomes {
            groups.entry(outcome.category()).or_default().push(outcome);
        }
        groups
    }
}

/// Result of [`Orchestrator::backfill_tags`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub tagged: usize,
    pub already_tagged: usize,
    pub failed: usize,
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct Orchestrator {
    store: Arc<dyn MailboxStore>,
    rules: RulesEngine,
    categorizer: LlmCategorizer,
    config: SorterConfig,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Build an orchestrator with the heuristic rules derived from `config`.
    pub fn new(
        store: Arc<dyn MailboxStore>,
        llm: Arc<dyn LlmProvider>,
        config: SorterConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rules = RulesEngine::from_config(&config.heuristics, &config.taxonomy)?;
        let categorizer = LlmCategorizer::new(llm, &config);
        Ok(Self {
            store,
            rules,
            categorizer,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the heuristic rules.
    pub fn with_rules(mut self, rules: RulesEngine) -> Self {
        self.rules = rules;
        self
    }

    /// Flag checked between emails. Setting it stops the run after the
    /// current email; finished outcomes are kept.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run one batch.
    pub async fn run(&self, options: RunOptions) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, dry_run = options.dry_run);
        self.run_batch(run_id, options).instrument(span).await
    }

    async fn run_batch(&self, run_id: Uuid, options: RunOptions) -> Result<RunReport, PipelineError> {
        let mut resolver = self.resolver();
        let mover = Mover::new(
            self.store.clone(),
            self.config.retry.clone(),
            self.config.processed_tag.clone(),
        );
        let tag = self.config.processed_tag.as_str();
        let explicit = options.source.is_explicit();
        let limit = options.limit.unwrap_or(self.config.batch_size);

        let folder_id = match &options.source {
            SourceSelection::Default => self.config.default_source_folder.clone(),
            SourceSelection::FolderId(id) => id.clone(),
            SourceSelection::Label(label) => {
                let folder = resolver.resolve_label(label).await?;
                info!(label = %label, folder_id = %folder.id, "Resolved source label");
                folder.id
            }
        };

        let mut report = RunReport::new(run_id, folder_id.clone());
        if limit == 0 {
            return Ok(report);
        }

        let mut query = MessageQuery::new(folder_id.as_str(), limit)
            .with_subfolders(explicit)
            .skipping_flagged(true);
        if !explicit {
            query = query.excluding_tag(tag);
        }
        let store = &self.store;
        let fetched = self
            .config
            .retry
            .run("list_messages", || store.list_messages(&query))
            .await
            .map_err(PipelineError::Fetch)?;

        info!(
            folder_id = %folder_id,
            fetched = fetched.len(),
            explicit,
            "Fetched candidate emails"
        );

        let mut seen = HashSet::new();
        let mut batch: Vec<Email> = Vec::with_capacity(fetched.len());
        for email in fetched {
            if !seen.insert(email.id.clone()) {
                report.skipped_duplicates += 1;
                continue;
            }
            if email.flagged {
                debug!(id = %email.id, "Flagged for follow-up, skipping");
                report.skipped_flagged += 1;
                continue;
            }
            if !explicit && email.has_tag(tag) {
                debug!(id = %email.id, "Already tagged, skipping");
                report.skipped_already_tagged += 1;
                continue;
            }
            batch.push(email);
        }
        batch.truncate(limit);

        for email in &batch {
            if self.cancel.load(Ordering::SeqCst) {
                warn!(
                    processed = report.outcomes.len(),
                    remaining = batch.len() - report.outcomes.len(),
                    "Run cancelled"
                );
                report.cancelled = true;
                break;
            }
            let outcome = self
                .process_email(&mut resolver, &mover, email, options.dry_run)
                .await;
            report.outcomes.push(outcome);
        }

        info!(
            processed = report.outcomes.len(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            moved = report.moved(),
            skipped_tagged = report.skipped_already_tagged,
            skipped_flagged = report.skipped_flagged,
            "Run complete"
        );
        Ok(report)
    }

    fn resolver(&self) -> FolderResolver {
        FolderResolver::new(
            self.store.clone(),
            self.config.retry.clone(),
            self.config.label_tie_break,
        )
        .with_destination_root(self.config.destination_root.clone())
    }

    /// Classify one email: heuristics first, the model only when no rule matches.
    pub async fn classify(&self, email: &Email) -> ClassificationResult {
        let body = sanitize_body(&email.body, self.config.max_body_chars);
        let ctx = RuleContext::new(email, &body);
        match self.rules.evaluate(&ctx) {
            Some(result) => result,
            None => self.categorizer.categorize(email, &body).await,
        }
    }

    async fn process_email(
        &self,
        resolver: &mut FolderResolver,
        mover: &Mover,
        email: &Email,
        dry_run: bool,
    ) -> ProcessingOutcome {
        let mut outcome = ProcessingOutcome::fetched(email, dry_run);
        if let Err(error) = self.drive(&mut outcome, resolver, mover, email, dry_run).await {
            error!(id = %email.id, state = %outcome.state, error = %error, "Email failed");
            if outcome.state.can_transition_to(EmailState::Failed) {
                outcome.state = EmailState::Failed;
                outcome.transitions.push(EmailState::Failed);
            }
            outcome.error = Some(error);
        }
        outcome
    }

    async fn drive(
        &self,
        outcome: &mut ProcessingOutcome,
        resolver: &mut FolderResolver,
        mover: &Mover,
        email: &Email,
        dry_run: bool,
    ) -> Result<(), OutcomeError> {
        let classification = self.classify(email).await;
        let rule = match &classification.source {
            ClassificationSource::Heuristic { rule } => rule.as_str(),
            ClassificationSource::Model => "model",
            ClassificationSource::Fallback => "fallback",
        };
        info!(
            id = %email.id,
            subject = %email.subject,
            category = %classification.label(),
            priority = classification.priority.as_str(),
            source = rule,
            "Classified"
        );
        outcome.classification = Some(classification.clone());
        advance(outcome, EmailState::Classified)?;

        let destination = resolver
            .resolve_destination(&classification, !dry_run)
            .await
            .map_err(|e| OutcomeError::new(e.code(), e.to_string()))?;
        outcome.target_path = Some(destination.path.clone());
        outcome.target_folder_id = destination.folder.as_ref().map(|f| f.id.clone());
        advance(outcome, EmailState::FolderResolved)?;

        if dry_run {
            info!(id = %email.id, target = %destination.path, "Dry run, not moving");
            return Ok(());
        }

        let Some(target) = destination.folder else {
            return Err(OutcomeError::new(
                ErrorCode::Internal,
                format!("no folder id for {}", destination.path),
            ));
        };

        let report = mover.move_and_tag(email, &target.id).await;
        if !report.moved {
            return Err(report
                .error
                .unwrap_or_else(|| OutcomeError::new(ErrorCode::Internal, "move failed")));
        }
        outcome.moved = true;
        advance(outcome, EmailState::Moved)?;

        if report.tagged {
            outcome.tagged = true;
            advance(outcome, EmailState::Tagged)?;
        } else {
            outcome.tag_warning = report.tag_error;
        }
        advance(outcome, EmailState::Done)?;

        info!(id = %email.id, target = %destination.path, tagged = outcome.tagged, "Moved");
        Ok(())
    }

    /// Tag every untagged message under `label` (subfolders included) without
    /// moving anything.
    pub async fn backfill_tags(&self, label: &str) -> Result<BackfillReport, PipelineError> {
        let mut resolver = self.resolver();
        let folder = resolver.resolve_label(label).await?;
        let mover = Mover::new(
            self.store.clone(),
            self.config.retry.clone(),
            self.config.processed_tag.clone(),
        );

        let query = MessageQuery::new(folder.id.as_str(), BACKFILL_LIMIT).with_subfolders(true);
        let store = &self.store;
        let messages = self
            .config
            .retry
            .run("list_messages", || store.list_messages(&query))
            .await
            .map_err(PipelineError::Fetch)?;

        let mut report = BackfillReport::default();
        for email in &messages {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Backfill cancelled");
                break;
            }
            if email.has_tag(mover.tag_name()) {
                report.already_tagged += 1;
                continue;
            }
            match mover.tag(&email.id).await {
                Ok(()) => report.tagged += 1,
                Err(e) => {
                    warn!(id = %email.id, error = %e, "Backfill tag failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            label = %label,
            tagged = report.tagged,
            already_tagged = report.already_tagged,
            failed = report.failed,
            "Tag backfill complete"
        );
        Ok(report)
    }
}

/// Move `outcome` to `to`, rejecting transitions the state machine forbids.
fn advance(outcome: &mut ProcessingOutcome, to: EmailState) -> Result<(), OutcomeError> {
    if !outcome.state.can_transition_to(to) {
        let err = PipelineError::InvalidTransition {
            id: outcome.email_id.clone(),
            from: outcome.state.to_string(),
            to: to.to_string(),
        };
        return Err(OutcomeError::new(ErrorCode::Internal, err.to_string()));
    }
    outcome.state = to;
    outcome.transitions.push(to);
    Ok(())
}
