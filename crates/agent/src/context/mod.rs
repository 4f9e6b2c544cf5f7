//! Context window management.
//!
//! | Step | Trigger | Action |
//! |------|---------|--------|
//! | 1. Turn ceiling | more than `max_turns` turns | Oldest turns dequeued in chunks |
//! | 2. Token budget | over `max_context_tokens` | Truncate oldest turns, or compress them into a note |
//!
//! The leading system message is never touched.

pub mod compress;
pub mod manager;
pub mod token;

pub use compress::{ContextCompressor, LlmSummaryCompressor};
pub use manager::{ContextManager, ContextReport, SUMMARY_PREFIX, UsageBaseline, turn_ranges};
pub use token::{HeuristicCounter, TokenCounter, estimate_messages_tokens, estimate_tokens};
