//! Context optimizer: keeps a growing transcript small enough to resend.
//!
//! Two passes run over the non-system part of a [`Conversation`]:
//!
//! - **Pruning** drops repeated identical calls to read-only actions (and
//!   their paired result messages), keeping the most recent `max_instances`
//!   of each.
//! - **Summarization** folds everything but the newest `summary_retention`
//!   messages into a single cumulative summary message once the transcript
//!   grows past `summary_threshold`.
//!
//! Summary lines are deduplicated for the lifetime of the optimizer and never
//! disappear until [`ContextOptimizer::reset`].

use std::collections::{BTreeSet, HashMap};

use ferrule_config::OptimizerConfig;
use ferrule_core::message::{Conversation, Message, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::parser;
use crate::transcript;

/// Text the summary message starts with.
pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:";

/// Metadata key set to `true` on the summary message.
pub const SUMMARY_MARKER: &str = "conversation_summary";

/// Pruning never leaves the conversation shorter than this.
pub const MIN_MESSAGES: usize = 5;

/// Rough token cost credited per removed message.
pub const TOKENS_PER_MESSAGE: usize = 150;

const MAX_DIGEST_CHARS: usize = 80;
const MAX_PARAM_CHARS: usize = 40;
const MAX_PARAMS_SHOWN: usize = 3;

/// Running totals for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerStats {
    pub messages_removed: usize,
    pub optimizations_performed: usize,
    pub estimated_tokens_saved: usize,
    pub summary_regenerations: usize,
    pub summary_lines: usize,
}

/// Everything the optimizer remembers about a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub enabled: bool,
    pub optimized_actions: BTreeSet<String>,
    pub max_instances: usize,
    pub summary_threshold: usize,
    pub summary_retention: usize,
    /// Digest lines in first-seen order; only grows
    pub summary_lines: Vec<String>,
    /// `role:line` keys already present in `summary_lines`
    pub summary_fingerprints: BTreeSet<String>,
    pub stats: OptimizerStats,
}

impl OptimizerState {
    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self {
            enabled: config.enabled,
            optimized_actions: config.optimized_actions.iter().cloned().collect(),
            max_instances: config.max_instances.max(1),
            summary_threshold: config.summary_threshold,
            summary_retention: config.summary_retention,
            summary_lines: Vec::new(),
            summary_fingerprints: BTreeSet::new(),
            stats: OptimizerStats::default(),
        }
    }
}

/// What one summarization pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryOutcome {
    /// Messages folded into the summary
    pub removed: usize,
    /// Digest lines seen for the first time
    pub new_lines: usize,
    /// The summary message text differs from before
    pub summary_changed: bool,
}

/// What [`ContextOptimizer::optimize`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizationReport {
    pub optimized: bool,
    pub pruned: usize,
    pub summarized: usize,
    pub new_summary_lines: usize,
    pub summary_changed: bool,
    pub stats: OptimizerStats,
}

/// Duplicate pruning plus cumulative summarization for one conversation.
#[derive(Debug, Clone)]
pub struct ContextOptimizer {
    state: OptimizerState,
}

impl ContextOptimizer {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            state: OptimizerState::from_config(config),
        }
    }

    /// Resume from a persisted state.
    pub fn from_state(state: OptimizerState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    pub fn stats(&self) -> &OptimizerStats {
        &self.state.stats
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.state.enabled = enabled;
    }

    /// Forget summary lines and statistics (used when history is cleared).
    pub fn reset(&mut self) {
        self.state.summary_lines.clear();
        self.state.summary_fingerprints.clear();
        self.state.stats = OptimizerStats::default();
    }

    /// Whether the history outside the summary has grown past the
    /// summarization threshold.
    pub fn needs_summary(&self, conversation: &Conversation) -> bool {
        let keep = system_len(conversation);
        let body = conversation.messages[keep..]
            .iter()
            .filter(|m| !is_summary(m))
            .count();
        self.state.enabled && body > self.state.summary_threshold
    }

    /// Run pruning then summarization. A disabled optimizer does nothing.
    pub fn optimize(&mut self, conversation: &mut Conversation) -> OptimizationReport {
        if !self.state.enabled {
            return OptimizationReport {
                optimized: false,
                pruned: 0,
                summarized: 0,
                new_summary_lines: 0,
                summary_changed: false,
                stats: self.state.stats.clone(),
            };
        }

        let pruned = self.prune(conversation);
        let summary = self.summarize(conversation);

        let optimized = pruned > 0 || summary.removed > 0 || summary.new_lines > 0;
        if optimized {
            self.state.stats.optimizations_performed += 1;
            info!(
                conversation_id = %conversation.id,
                pruned,
                summarized = summary.removed,
                new_summary_lines = summary.new_lines,
                "Context optimized"
            );
        }

        OptimizationReport {
            optimized,
            pruned,
            summarized: summary.removed,
            new_summary_lines: summary.new_lines,
            summary_changed: summary.summary_changed,
            stats: self.state.stats.clone(),
        }
    }

    /// Remove repeated identical calls to optimized actions.
    ///
    /// Returns the number of messages removed.
    pub fn prune(&mut self, conversation: &mut Conversation) -> usize {
        let keep = system_len(conversation);
        let history = &conversation.messages[keep..];
        let reserved = usize::from(history.first().is_some_and(is_summary));

        // fingerprint -> assistant indices, oldest first
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, message) in history.iter().enumerate().skip(reserved) {
            if message.role != Role::Assistant {
                continue;
            }
            let calls = parser::parse(&message.content);
            if calls.is_empty()
                || !calls
                    .iter()
                    .all(|c| self.state.optimized_actions.contains(&c.action))
            {
                continue;
            }
            let fingerprint = calls
                .iter()
                .map(|c| c.fingerprint())
                .collect::<Vec<_>>()
                .join("\n");
            groups.entry(fingerprint).or_default().push(i);
        }

        let mut units: Vec<Vec<usize>> = Vec::new();
        for indices in groups.values() {
            if indices.len() <= self.state.max_instances {
                continue;
            }
            let stale = indices.len() - self.state.max_instances;
            for &i in &indices[..stale] {
                let mut unit = vec![i];
                if history.get(i + 1).is_some_and(transcript::is_tool_results) {
                    unit.push(i + 1);
                }
                units.push(unit);
            }
        }
        if units.is_empty() {
            return 0;
        }
        units.sort_by_key(|unit| unit[0]);

        let mut remaining = conversation.messages.len();
        let mut doomed = BTreeSet::new();
        for unit in units {
            if remaining.saturating_sub(unit.len()) < MIN_MESSAGES {
                debug!(index = unit[0], "Skipping prune unit to respect message floor");
                continue;
            }
            remaining -= unit.len();
            doomed.extend(unit);
        }
        if doomed.is_empty() {
            return 0;
        }

        let kept: Vec<Message> = history
            .iter()
            .enumerate()
            .filter(|(i, _)| !doomed.contains(i))
            .map(|(_, m)| m.clone())
            .collect();
        conversation.messages.truncate(keep);
        conversation.messages.extend(kept);

        let removed = doomed.len();
        self.state.stats.messages_removed += removed;
        self.state.stats.estimated_tokens_saved += removed * TOKENS_PER_MESSAGE;
        debug!(removed, "Pruned duplicate tool calls");
        removed
    }

    /// Fold older messages into the cumulative summary.
    pub fn summarize(&mut self, conversation: &mut Conversation) -> SummaryOutcome {
        let keep = system_len(conversation);
        let history = &conversation.messages[keep..];
        let previous = history.iter().find(|m| is_summary(m)).map(|m| m.content.clone());
        let body: Vec<&Message> = history.iter().filter(|m| !is_summary(m)).collect();

        if body.len() <= self.state.summary_threshold {
            return SummaryOutcome::default();
        }

        let mut split = body.len().saturating_sub(self.state.summary_retention);
        // Keep an assistant turn together with its results
        if split > 0 && body.get(split).is_some_and(|m| transcript::is_tool_results(m)) {
            split -= 1;
        }
        if split == 0 {
            return SummaryOutcome::default();
        }

        let mut new_lines = 0;
        for message in &body[..split] {
            let Some(line) = digest(message) else {
                continue;
            };
            let fingerprint = format!("{}:{}", message.role, line);
            if self.state.summary_fingerprints.insert(fingerprint) {
                self.state.summary_lines.push(line);
                new_lines += 1;
            }
        }

        let summary = self.render_summary();
        let summary_changed = previous.as_deref() != Some(summary.as_str());
        let recent: Vec<Message> = body[split..].iter().map(|m| (*m).clone()).collect();

        let mut rebuilt = Vec::with_capacity(recent.len() + 1);
        rebuilt.push(Message::system(summary).with_metadata(SUMMARY_MARKER, Value::Bool(true)));
        rebuilt.extend(recent);
        conversation.messages.truncate(keep);
        conversation.messages.extend(rebuilt);

        self.state.stats.messages_removed += split;
        self.state.stats.estimated_tokens_saved += split * TOKENS_PER_MESSAGE;
        self.state.stats.summary_lines = self.state.summary_lines.len();
        if summary_changed {
            self.state.stats.summary_regenerations += 1;
        }

        SummaryOutcome {
            removed: split,
            new_lines,
            summary_changed,
        }
    }

    fn render_summary(&self) -> String {
        let mut text = String::from(SUMMARY_PREFIX);
        for line in &self.state.summary_lines {
            text.push_str("\n- ");
            text.push_str(line);
        }
        text
    }
}

/// Whether a message is the optimizer's summary (by marker or by prefix).
pub fn is_summary(message: &Message) -> bool {
    message.meta(SUMMARY_MARKER).and_then(Value::as_bool) == Some(true)
        || message.content.starts_with(SUMMARY_PREFIX)
}

/// 1 when index 0 is the real system prompt, 0 otherwise.
fn system_len(conversation: &Conversation) -> usize {
    usize::from(
        conversation
            .messages
            .first()
            .is_some_and(|m| m.role == Role::System && !is_summary(m)),
    )
}

/// One summary line for a message, if it is worth remembering.
fn digest(message: &Message) -> Option<String> {
    match message.role {
        Role::System => None,
        Role::Assistant => {
            let calls = parser::parse(&message.content);
            if calls.is_empty() {
                return Some(format!(
                    "Assistant replied: {}",
                    truncate(message.content.trim(), MAX_DIGEST_CHARS)
                ));
            }
            let used: Vec<String> = calls
                .iter()
                .map(|call| {
                    let params: Vec<String> = call
                        .parameters
                        .iter()
                        .take(MAX_PARAMS_SHOWN)
                        .map(|(k, v)| format!("{k}={}", truncate(&value_text(v), MAX_PARAM_CHARS)))
                        .collect();
                    if params.is_empty() {
                        format!("Used {}", call.action)
                    } else {
                        format!("Used {} ({})", call.action, params.join(", "))
                    }
                })
                .collect();
            Some(used.join("; "))
        }
        Role::User if transcript::is_tool_results(message) => {
            let results: Vec<String> = transcript::tool_outcomes(message)
                .iter()
                .map(|o| format!("Result of {}: {}", o.action, describe_result(&o.result)))
                .collect();
            (!results.is_empty()).then(|| results.join("; "))
        }
        Role::User => Some(format!(
            "User said: {}",
            truncate(message.content.trim(), MAX_DIGEST_CHARS)
        )),
    }
}

fn describe_result(result: &ferrule_core::tool::ToolResult) -> String {
    for key in ["path", "directory", "message"] {
        if let Some(v) = result.get(key) {
            return truncate(&value_text(v), MAX_DIGEST_CHARS);
        }
    }
    if let Some(files) = result.get("files").and_then(Value::as_array) {
        return format!("{} files", files.len());
    }
    match (&result.error, result.success) {
        (_, true) => "success".into(),
        (Some(error), false) => format!("failed ({})", truncate(error, MAX_PARAM_CHARS)),
        (None, false) => "failed".into(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
