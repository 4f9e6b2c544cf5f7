//! Keeps the working message list within the model's budget.
//!
//! The window is split into a head (the leading system message, if any) and
//! turns. A turn starts at a user message and runs up to the next one, so
//! every assistant tool-call message and its tool results always sit in the
//! same turn and are removed together.
//!
//! Pruning order before each model call:
//! 1. max-turns ceiling, oldest turns dequeued `dequeue_turns` at a time
//! 2. token budget, by truncation or compression of older turns
//!
//! The head is never removed, and the newest turn always survives.

use clawloop_config::{ContextSettings, TruncationStrategy};
use clawloop_core::message::{Message, Role};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::compress::ContextCompressor;
use super::token::{TokenCounter, estimate_messages_tokens};

/// Prefix of the note that replaces compressed turns.
pub const SUMMARY_PREFIX: &str = "[Summary of earlier conversation]";

/// Usage reported by the last model round, trusted for the messages it covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageBaseline {
    /// Number of leading window messages the usage figure accounts for.
    pub covered: usize,
    pub tokens: usize,
}

/// What one `process` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextReport {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub turns_dequeued: usize,
    pub turns_truncated: usize,
    pub turns_compressed: usize,
}

impl ContextReport {
    pub fn changed(&self) -> bool {
        self.turns_dequeued + self.turns_truncated + self.turns_compressed > 0
    }
}

pub struct ContextManager {
    settings: ContextSettings,
    counter: Option<Arc<dyn TokenCounter>>,
    compressor: Option<Arc<dyn ContextCompressor>>,
}

impl ContextManager {
    pub fn new(settings: ContextSettings) -> Self {
        Self {
            settings,
            counter: None,
            compressor: None,
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn ContextCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Token cost of a window.
    ///
    /// A custom counter wins. Otherwise the baseline is trusted for the
    /// messages it covers and the heuristic fills in the rest.
    pub fn count(&self, messages: &[Message], baseline: Option<UsageBaseline>) -> usize {
        if let Some(counter) = &self.counter {
            return counter.count(messages);
        }
        match baseline {
            Some(b) if b.covered <= messages.len() => {
                b.tokens + estimate_messages_tokens(&messages[b.covered..])
            }
            _ => estimate_messages_tokens(messages),
        }
    }

    /// Prune `messages` in place.
    pub async fn process(
        &self,
        messages: &mut Vec<Message>,
        baseline: Option<UsageBaseline>,
    ) -> ContextReport {
        let mut report = ContextReport {
            tokens_before: self.count(messages, baseline),
            ..ContextReport::default()
        };

        report.turns_dequeued = self.apply_turn_ceiling(messages);
        // Any removal invalidates the baseline's message indexes.
        let mut baseline = baseline.filter(|_| report.turns_dequeued == 0);

        let budget = self.settings.max_context_tokens;
        if budget > 0 && self.count(messages, baseline) > budget {
            if self.settings.strategy == TruncationStrategy::Compress {
                report.turns_compressed = self.compress(messages).await;
                if report.turns_compressed > 0 {
                    baseline = None;
                }
            }
            if self.count(messages, baseline) > budget {
                report.turns_truncated = self.truncate(messages, budget);
            }
        }

        let changed = report.changed();
        report.tokens_after = self.count(messages, baseline.filter(|_| !changed));
        if changed {
            info!(
                before = report.tokens_before,
                after = report.tokens_after,
                dequeued = report.turns_dequeued,
                truncated = report.turns_truncated,
                compressed = report.turns_compressed,
                "Pruned context window"
            );
        }
        report
    }

    fn apply_turn_ceiling(&self, messages: &mut Vec<Message>) -> usize {
        let max_turns = self.settings.max_turns;
        if max_turns == 0 {
            return 0;
        }
        let turns = turn_ranges(messages).len();
        if turns <= max_turns {
            return 0;
        }
        let step = self.settings.dequeue_turns.max(1);
        let excess = turns - max_turns;
        let remove = (excess.div_ceil(step) * step).min(turns - 1);
        debug!(turns, max_turns, remove, "Turn ceiling exceeded");
        remove_oldest_turns(messages, remove)
    }

    fn truncate(&self, messages: &mut Vec<Message>, budget: usize) -> usize {
        let mut removed = 0;
        while self.count(messages, None) > budget {
            if turn_ranges(messages).len() <= 1 {
                warn!(budget, "Newest turn alone exceeds the token budget");
                break;
            }
            removed += remove_oldest_turns(messages, 1);
        }
        removed
    }

    async fn compress(&self, messages: &mut Vec<Message>) -> usize {
        let Some(compressor) = &self.compressor else {
            warn!("Compression strategy configured without a compressor; truncating instead");
            return 0;
        };
        let turns = turn_ranges(messages);
        let keep = self.settings.keep_recent_turns.max(1);
        if turns.len() <= keep {
            return 0;
        }
        let folded = turns.len() - keep;
        let span = turns[0].start..turns[folded - 1].end;

        match compressor.compress(&messages[span.clone()]).await {
            Ok(summary) => {
                let note = Message::user(format!("{SUMMARY_PREFIX}\n{summary}"));
                messages.splice(span, std::iter::once(note));
                folded
            }
            Err(e) => {
                warn!(error = %e, "Context compression failed; truncating instead");
                0
            }
        }
    }
}

fn head_len(messages: &[Message]) -> usize {
    match messages.first() {
        Some(m) if m.role == Role::System => 1,
        _ => 0,
    }
}

/// Turn boundaries after the head. Transient user messages (the wrap-up
/// directive) belong to the turn they follow.
pub fn turn_ranges(messages: &[Message]) -> Vec<Range<usize>> {
    let head = head_len(messages);
    if messages.len() <= head {
        return Vec::new();
    }
    let mut starts = vec![head];
    starts.extend(
        messages
            .iter()
            .enumerate()
            .skip(head + 1)
            .filter(|(_, m)| m.role == Role::User && !m.no_persist)
            .map(|(i, _)| i),
    );
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| start..starts.get(n + 1).copied().unwrap_or(messages.len()))
        .collect()
}

/// Remove the `n` oldest turns; returns how many were removed.
fn remove_oldest_turns(messages: &mut Vec<Message>, n: usize) -> usize {
    let turns = turn_ranges(messages);
    let n = n.min(turns.len());
    if n == 0 {
        return 0;
    }
    messages.drain(turns[0].start..turns[n - 1].end);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clawloop_core::error::ProviderError;
    use clawloop_core::message::ToolCallRef;

    fn settings() -> ContextSettings {
        ContextSettings::default()
    }

    /// system + `n` turns, each user → assistant(tool call) → tool → assistant.
    fn window(n: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("you are helpful")];
        for i in 0..n {
            msgs.push(Message::user(format!("question {i}")));
            msgs.push(Message::assistant_tool_calls(
                "",
                None,
                vec![ToolCallRef::new(format!("c{i}"), "lookup", serde_json::json!({}))],
            ));
            msgs.push(Message::tool_result(format!("c{i}"), "result"));
            msgs.push(Message::assistant(format!("answer {i}")));
        }
        msgs
    }

    fn user_texts(msgs: &[Message]) -> Vec<String> {
        msgs.iter().filter(|m| m.role == Role::User).map(|m| m.text()).collect()
    }

    fn assert_pairs_intact(msgs: &[Message]) {
        for (i, msg) in msgs.iter().enumerate() {
            if let Some(id) = &msg.tool_call_id {
                assert!(
                    msgs[..i].iter().any(|m| m.tool_calls().any(|c| &c.id == id)),
                    "orphaned tool result {id}"
                );
            }
        }
    }

    #[test]
    fn turns_split_on_user_messages() {
        let msgs = window(3);
        let turns = turn_ranges(&msgs);
        assert_eq!(turns, vec![1..5, 5..9, 9..13]);
        assert!(turn_ranges(&[Message::system("s")]).is_empty());
    }

    #[test]
    fn transient_user_message_joins_current_turn() {
        let mut msgs = window(2);
        msgs.push(Message::user("wrap it up").transient());
        assert_eq!(turn_ranges(&msgs), vec![1..5, 5..10]);
    }

    #[tokio::test]
    async fn turn_ceiling_keeps_system_and_pairs() {
        let mut msgs = window(5);
        let mgr = ContextManager::new(ContextSettings {
            max_turns: 3,
            ..settings()
        });
        let report = mgr.process(&mut msgs, None).await;
        assert_eq!(report.turns_dequeued, 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(user_texts(&msgs), vec!["question 2", "question 3", "question 4"]);
        assert_pairs_intact(&msgs);
    }

    #[tokio::test]
    async fn dequeue_removes_in_chunks() {
        let mut msgs = window(4);
        let mgr = ContextManager::new(ContextSettings {
            max_turns: 3,
            dequeue_turns: 2,
            ..settings()
        });
        mgr.process(&mut msgs, None).await;
        assert_eq!(user_texts(&msgs), vec!["question 2", "question 3"]);
    }

    #[tokio::test]
    async fn truncation_drops_oldest_until_under_budget() {
        let mut msgs = window(6);
        let budget = estimate_messages_tokens(&window(2));
        let mgr = ContextManager::new(ContextSettings {
            max_context_tokens: budget,
            ..settings()
        });
        let report = mgr.process(&mut msgs, None).await;
        assert_eq!(report.turns_truncated, 4);
        assert!(report.tokens_after <= budget);
        assert_eq!(msgs[0].role, Role::System);
        assert_pairs_intact(&msgs);
    }

    #[tokio::test]
    async fn newest_turn_always_survives() {
        let mut msgs = window(2);
        let mgr = ContextManager::new(ContextSettings {
            max_context_tokens: 1,
            ..settings()
        });
        mgr.process(&mut msgs, None).await;
        assert_eq!(user_texts(&msgs), vec!["question 1"]);
        assert_eq!(msgs[0].role, Role::System);
    }

    #[tokio::test]
    async fn within_budget_is_untouched() {
        let mut msgs = window(2);
        let mgr = ContextManager::new(ContextSettings {
            max_turns: 10,
            max_context_tokens: 100_000,
            ..settings()
        });
        let report = mgr.process(&mut msgs, None).await;
        assert!(!report.changed());
        assert_eq!(msgs.len(), 9);
    }

    struct FixedSummary;

    #[async_trait]
    impl ContextCompressor for FixedSummary {
        async fn compress(&self, messages: &[Message]) -> Result<String, ProviderError> {
            Ok(format!("{} messages summarized", messages.len()))
        }
    }

    struct BrokenSummary;

    #[async_trait]
    impl ContextCompressor for BrokenSummary {
        async fn compress(&self, _messages: &[Message]) -> Result<String, ProviderError> {
            Err(ProviderError::Network("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn compression_keeps_recent_turns_verbatim() {
        let mut msgs = window(6);
        let mgr = ContextManager::new(ContextSettings {
            max_context_tokens: estimate_messages_tokens(&window(4)),
            strategy: TruncationStrategy::Compress,
            keep_recent_turns: 2,
            ..settings()
        })
        .with_compressor(Arc::new(FixedSummary));

        let report = mgr.process(&mut msgs, None).await;
        assert_eq!(report.turns_compressed, 4);
        assert_eq!(report.turns_truncated, 0);
        assert_eq!(msgs[0].role, Role::System);
        assert!(msgs[1].text().starts_with(SUMMARY_PREFIX));
        assert!(msgs[1].text().contains("16 messages summarized"));
        assert_eq!(
            user_texts(&msgs)[1..],
            ["question 4".to_string(), "question 5".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_compression_falls_back_to_truncation() {
        let mut msgs = window(6);
        let budget = estimate_messages_tokens(&window(2));
        let mgr = ContextManager::new(ContextSettings {
            max_context_tokens: budget,
            strategy: TruncationStrategy::Compress,
            ..settings()
        })
        .with_compressor(Arc::new(BrokenSummary));

        let report = mgr.process(&mut msgs, None).await;
        assert_eq!(report.turns_compressed, 0);
        assert!(report.turns_truncated > 0);
        assert!(report.tokens_after <= budget);
    }

    #[tokio::test]
    async fn turn_ceiling_runs_before_compression() {
        let mut msgs = window(8);
        let mgr = ContextManager::new(ContextSettings {
            max_turns: 3,
            max_context_tokens: estimate_messages_tokens(&window(2)),
            strategy: TruncationStrategy::Compress,
            keep_recent_turns: 1,
            ..settings()
        })
        .with_compressor(Arc::new(FixedSummary));

        let report = mgr.process(&mut msgs, None).await;
        assert_eq!(report.turns_dequeued, 5);
        // Only the three turns left after dequeueing were offered for compression.
        assert_eq!(report.turns_compressed, 2);
        assert!(msgs[1].text().contains("8 messages summarized"));
    }

    struct Fixed(usize);

    impl TokenCounter for Fixed {
        fn count(&self, _messages: &[Message]) -> usize {
            self.0
        }
    }

    #[test]
    fn custom_counter_is_authoritative() {
        let mgr = ContextManager::new(settings()).with_counter(Arc::new(Fixed(7)));
        let baseline = UsageBaseline { covered: 1, tokens: 10_000 };
        assert_eq!(mgr.count(&window(3), Some(baseline)), 7);
    }

    #[test]
    fn baseline_plus_heuristic_for_new_messages() {
        let mgr = ContextManager::new(settings());
        let msgs = window(1);
        let baseline = UsageBaseline { covered: 3, tokens: 1000 };
        let expected = 1000 + estimate_messages_tokens(&msgs[3..]);
        assert_eq!(mgr.count(&msgs, Some(baseline)), expected);

        let stale = UsageBaseline { covered: 99, tokens: 1000 };
        assert_eq!(mgr.count(&msgs, Some(stale)), estimate_messages_tokens(&msgs));
    }
}
