//! Email sorting pipeline.
//!
//! Every candidate email flows through:
//! 1. `sanitizer::sanitize_body()` — HTML/text to bounded plain text
//! 2. `RulesEngine::evaluate()` — ordered heuristics (no LLM)
//! 3. `LlmCategorizer::categorize()` — model fallback, never fails
//! 4. `FolderResolver::resolve_destination()` — find or create the folder
//! 5. `Mover::move_and_tag()` — move, then stamp the idempotency tag
//!
//! **A message carrying the tag is never picked up again** unless the caller
//! names its source explicitly.

pub mod categorizer;
pub mod mover;
pub mod orchestrator;
pub mod rules;
pub mod sanitizer;
pub mod types;

pub use orchestrator::{BackfillReport, Orchestrator, RunOptions, RunReport, SourceSelection};
