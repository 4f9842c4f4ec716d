//! Context assembly for upstream requests.
//!
//! The builder picks which part of a conversation's history accompanies a new
//! user message. The leading system message and the new user message are
//! always sent; prior turns are added newest-first until the budget runs out.
//! Messages are never split.

use crate::message::{Message, MessageRole};
use serde::{Deserialize, Serialize};

/// Unit used to measure message cost against the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetUnit {
    /// Unicode scalar values.
    #[default]
    Characters,
    /// Estimated tokens, one per four characters (rounded up).
    ApproxTokens,
}

impl BudgetUnit {
    /// Estimates the cost of `text` in this unit.
    #[must_use]
    pub fn cost(&self, text: &str) -> usize {
        let chars = text.chars().count();
        match self {
            Self::Characters => chars,
            Self::ApproxTokens => chars.div_ceil(4),
        }
    }
}

/// Limits applied when assembling context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    /// Maximum total cost of the payload, in `unit`.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Unit of `limit`.
    #[serde(default)]
    pub unit: BudgetUnit,
    /// Upper bound on prior (non-system) messages considered.
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: Option<usize>,
}

fn default_limit() -> usize {
    8000
}

fn default_max_history_messages() -> Option<usize> {
    Some(10)
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            unit: BudgetUnit::default(),
            max_history_messages: default_max_history_messages(),
        }
    }
}

impl ContextBudget {
    /// Creates a budget with no message-count cap.
    #[must_use]
    pub fn new(limit: usize, unit: BudgetUnit) -> Self {
        Self {
            limit,
            unit,
            max_history_messages: None,
        }
    }

    /// Caps the number of prior messages considered.
    #[must_use]
    pub fn with_max_history_messages(mut self, max: usize) -> Self {
        self.max_history_messages = Some(max);
        self
    }
}

/// A message as sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    /// The role of the message sender.
    pub role: MessageRole,
    /// The content of the message.
    pub content: String,
}

impl From<&Message> for ContextMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// The assembled, possibly truncated context for one turn.
///
/// Never persisted; rebuilt for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPayload {
    /// Messages in the order they are sent.
    pub messages: Vec<ContextMessage>,
    /// Total estimated cost of `messages`.
    pub estimated_cost: usize,
    /// Prior messages left out by truncation.
    pub omitted: usize,
}

impl ContextPayload {
    /// Returns the final message, which is always the new user message.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&ContextMessage> {
        self.messages
            .last()
            .filter(|m| m.role == MessageRole::User)
    }
}

/// Builds context payloads under a fixed budget.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    budget: ContextBudget,
}

impl ContextBuilder {
    /// Creates a builder with the given budget.
    #[must_use]
    pub fn new(budget: ContextBudget) -> Self {
        Self { budget }
    }

    /// Returns the budget in use.
    #[must_use]
    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    /// Assembles the payload for `user_text` given the prior `history`.
    ///
    /// `history` must not already contain the new user message.
    #[must_use]
    pub fn build(&self, history: &[Message], user_text: &str) -> ContextPayload {
        let unit = self.budget.unit;
        let system = history.first().filter(|m| m.role == MessageRole::System);
        let prior: Vec<&Message> = history
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .collect();

        let mandatory = system.map_or(0, |m| unit.cost(&m.content)) + unit.cost(user_text);

        let window = match self.budget.max_history_messages {
            Some(max) => &prior[prior.len().saturating_sub(max)..],
            None => &prior[..],
        };

        let mut included: Vec<&Message> = Vec::new();
        let mut used = 0;
        if mandatory <= self.budget.limit {
            let available = self.budget.limit - mandatory;
            for &message in window.iter().rev() {
                let cost = unit.cost(&message.content);
                if used + cost > available {
                    break;
                }
                used += cost;
                included.push(message);
            }
        }
        included.reverse();

        let mut messages = Vec::with_capacity(included.len() + 2);
        messages.extend(system.map(ContextMessage::from));
        messages.extend(included.iter().map(|m| ContextMessage::from(*m)));
        messages.push(ContextMessage {
            role: MessageRole::User,
            content: user_text.to_string(),
        });

        ContextPayload {
            messages,
            estimated_cost: mandatory + used,
            omitted: prior.len() - included.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;

    fn history(entries: &[(MessageRole, &str)]) -> Vec<Message> {
        entries
            .iter()
            .enumerate()
            .map(|(i, (role, content))| {
                Message::from_new(NewMessage::new(*role, *content), i as u64)
            })
            .collect()
    }

    fn contents(payload: &ContextPayload) -> Vec<&str> {
        payload.messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn empty_history_sends_only_user_message() {
        let builder = ContextBuilder::default();
        let payload = builder.build(&[], "Hello");

        assert_eq!(contents(&payload), vec!["Hello"]);
        assert_eq!(payload.estimated_cost, 5);
        assert_eq!(payload.omitted, 0);
        assert!(payload.last_user_message().is_some());
    }

    #[test]
    fn includes_everything_that_fits_in_order() {
        let builder = ContextBuilder::new(ContextBudget::new(100, BudgetUnit::Characters));
        let prior = history(&[
            (MessageRole::System, "sys"),
            (MessageRole::User, "Hello"),
            (MessageRole::Assistant, "Hi there"),
        ]);

        let payload = builder.build(&prior, "How are you?");

        assert_eq!(
            contents(&payload),
            vec!["sys", "Hello", "Hi there", "How are you?"]
        );
        assert_eq!(payload.messages[0].role, MessageRole::System);
        assert_eq!(payload.estimated_cost, 3 + 5 + 8 + 12);
    }

    #[test]
    fn drops_oldest_turns_first_without_splitting() {
        // mandatory = 3 (sys) + 4 (next) = 7; 13 left for prior turns
        let builder = ContextBuilder::new(ContextBudget::new(20, BudgetUnit::Characters));
        let prior = history(&[
            (MessageRole::System, "sys"),
            (MessageRole::User, "aaaaaa"),
            (MessageRole::Assistant, "bbbbbb"),
            (MessageRole::User, "cccccc"),
            (MessageRole::Assistant, "ddddd"),
        ]);

        let payload = builder.build(&prior, "next");

        assert_eq!(contents(&payload), vec!["sys", "cccccc", "ddddd", "next"]);
        assert_eq!(payload.omitted, 2);
        assert!(payload.estimated_cost <= 20);
    }

    #[test]
    fn stops_at_first_message_that_does_not_fit() {
        // A small older message must not be pulled in past a large one.
        let builder = ContextBuilder::new(ContextBudget::new(12, BudgetUnit::Characters));
        let prior = history(&[
            (MessageRole::User, "ab"),
            (MessageRole::Assistant, "a very long reply"),
            (MessageRole::User, "cd"),
        ]);

        let payload = builder.build(&prior, "next");

        assert_eq!(contents(&payload), vec!["cd", "next"]);
        assert_eq!(payload.omitted, 2);
    }

    #[test]
    fn oversized_user_message_is_sent_alone() {
        let builder = ContextBuilder::new(ContextBudget::new(10, BudgetUnit::Characters));
        let prior = history(&[
            (MessageRole::System, "sys"),
            (MessageRole::User, "hi"),
            (MessageRole::Assistant, "yo"),
        ]);
        let big = "x".repeat(50);

        let payload = builder.build(&prior, &big);

        assert_eq!(payload.messages.len(), 2);
        assert_eq!(payload.messages[0].content, "sys");
        assert_eq!(payload.messages[1].content, big);
        assert_eq!(payload.omitted, 2);
        assert_eq!(payload.estimated_cost, 53);
    }

    #[test]
    fn history_cap_limits_prior_messages() {
        let budget = ContextBudget::new(1_000, BudgetUnit::Characters).with_max_history_messages(2);
        let builder = ContextBuilder::new(budget);
        let prior = history(&[
            (MessageRole::System, "sys"),
            (MessageRole::User, "one"),
            (MessageRole::Assistant, "two"),
            (MessageRole::User, "three"),
            (MessageRole::Assistant, "four"),
        ]);

        let payload = builder.build(&prior, "five");

        assert_eq!(contents(&payload), vec!["sys", "three", "four", "five"]);
        assert_eq!(payload.omitted, 2);
    }

    #[test]
    fn approx_tokens_round_up() {
        assert_eq!(BudgetUnit::ApproxTokens.cost(""), 0);
        assert_eq!(BudgetUnit::ApproxTokens.cost("abc"), 1);
        assert_eq!(BudgetUnit::ApproxTokens.cost("abcde"), 2);
        assert_eq!(BudgetUnit::Characters.cost("¿qué?"), 5);
    }

    #[test]
    fn token_budget_truncates_in_tokens() {
        // each prior message costs 2 tokens; user costs 1; 3 tokens left
        let builder = ContextBuilder::new(ContextBudget::new(4, BudgetUnit::ApproxTokens));
        let prior = history(&[
            (MessageRole::User, "12345678"),
            (MessageRole::Assistant, "abcdefgh"),
        ]);

        let payload = builder.build(&prior, "q");

        assert_eq!(contents(&payload), vec!["abcdefgh", "q"]);
        assert_eq!(payload.estimated_cost, 3);
    }

    #[test]
    fn build_is_deterministic() {
        let builder = ContextBuilder::new(ContextBudget::new(15, BudgetUnit::Characters));
        let prior = history(&[
            (MessageRole::System, "s"),
            (MessageRole::User, "hello"),
            (MessageRole::Assistant, "world"),
            (MessageRole::User, "again"),
        ]);

        let first = builder.build(&prior, "next");
        let second = builder.build(&prior, "next");
        assert_eq!(first, second);
    }

    #[test]
    fn budget_defaults() {
        let budget = ContextBudget::default();
        assert_eq!(budget.limit, 8000);
        assert_eq!(budget.unit, BudgetUnit::Characters);
        assert_eq!(budget.max_history_messages, Some(10));
    }
}
