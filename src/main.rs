use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;

use inbox_sorter::config::SorterConfig;
use inbox_sorter::llm::{LlmConfig, create_provider};
use inbox_sorter::pipeline::types::EmailState;
use inbox_sorter::pipeline::{Orchestrator, RunOptions, RunReport, SourceSelection};
use inbox_sorter::store::{GraphConfig, GraphMailbox, MailboxStore};

const ENV_HELP: &str = "\
Environment:
  GRAPH_ACCESS_TOKEN      Mailbox access token (required)
  SORTER_LLM_API_KEY      Model API key (or GROQ_API_KEY)
  RUST_LOG                Log filter (default: info)";

#[derive(Parser, Debug)]
#[clap(
    name = "inbox-sorter",
    version,
    about = "Sort mailbox messages into category folders",
    after_help = ENV_HELP
)]
struct Args {
    /// Process at most N emails (default: SORTER_BATCH_SIZE or 10)
    #[clap(long, value_name = "N")]
    limit: Option<usize>,

    /// Classify and resolve folders without changing the mailbox
    #[clap(long)]
    dry_run: bool,

    /// Process this folder and its subfolders, e.g. Inbox/Boss
    #[clap(long, value_name = "LABEL", conflicts_with = "folder_id")]
    folder_label: Option<String>,

    /// Process this folder id and its subfolders
    #[clap(long, value_name = "ID")]
    folder_id: Option<String>,

    /// Tag every untagged message under LABEL, then exit
    #[clap(long, value_name = "LABEL")]
    backfill: Option<String>,
}

impl Args {
    fn run_options(&self) -> RunOptions {
        let source = match (&self.folder_label, &self.folder_id) {
            (Some(label), _) => SourceSelection::Label(label.clone()),
            (None, Some(id)) => SourceSelection::FolderId(id.clone()),
            (None, None) => SourceSelection::Default,
        };
        RunOptions {
            limit: self.limit,
            dry_run: self.dry_run,
            source,
        }
    }
}

fn print_report(report: &RunReport) {
    eprintln!();
    if report.outcomes.is_empty() {
        eprintln!("No emails to process.");
    }
    for (category, outcomes) in report.by_category() {
        eprintln!("── {} ({}) ──", category, outcomes.len());
        for outcome in outcomes {
            let status = match outcome.state {
                EmailState::Done if outcome.tagged => "moved",
                EmailState::Done => "moved, untagged",
                EmailState::FolderResolved if outcome.dry_run => "dry run",
                EmailState::Failed => "failed",
                _ => "incomplete",
            };
            let target = outcome
                .target_path
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            eprintln!("  [{status}] {} <{}> → {target}", outcome.subject, outcome.sender);
            if let Some(error) = &outcome.error {
                eprintln!("      error: {error}");
            }
            if let Some(warning) = &outcome.tag_warning {
                eprintln!("      tag warning: {warning}");
            }
        }
    }
    eprintln!();
    eprintln!(
        "Processed {} | succeeded {} | failed {} | skipped (already tagged) {} | skipped (flagged) {}{}",
        report.outcomes.len(),
        report.succeeded(),
        report.failed(),
        report.skipped_already_tagged,
        report.skipped_flagged,
        if report.cancelled { " | cancelled" } else { "" },
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let options = args.run_options();

    let config = SorterConfig::from_env().context("invalid sorter configuration")?;
    let graph_config = GraphConfig::from_env()?;
    let store: Arc<dyn MailboxStore> = Arc::new(GraphMailbox::new(&graph_config)?);
    let llm_config = LlmConfig::from_env()?;
    let llm = create_provider(&llm_config)?;

    eprintln!("📬 Inbox Sorter v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Tag: {}", config.processed_tag);
    if options.dry_run {
        eprintln!("   Dry run: no folders, moves or tags");
    }

    let orchestrator = Orchestrator::new(store, llm, config)?;

    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current email...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    if let Some(label) = args.backfill {
        let report = orchestrator.backfill_tags(&label).await?;
        eprintln!(
            "Backfill of {label}: tagged {} | already tagged {} | failed {}",
            report.tagged, report.already_tagged, report.failed
        );
        return Ok(());
    }

    let report = orchestrator.run(options).await?;
    print_report(&report);
    Ok(())
}
