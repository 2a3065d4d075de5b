//! Shared history-repair pass (invariants 1-4)
//!
//! Every protocol adapter builds a translated `Vec<Message>` independently;
//! this module enforces the invariants common to all of them and is run
//! again, unconditionally, after any compaction pass.
//!
//! Invariants enforced:
//! 1. History MUST begin with a `userInputMessage` (a leading
//!    `assistantResponseMessage` is discarded).
//! 2. Entries MUST strictly alternate user/assistant (consecutive
//!    same-role entries are collapsed by concatenation).
//! 3. If an assistant entry carries `toolUses`, the immediately following
//!    user entry MUST contain `toolResults` for exactly that set of ids;
//!    orphan `toolResults` are filtered, and `toolUses` with no matching
//!    result are dropped from the assistant entry.

use std::collections::HashSet;

use super::model::requests::conversation::{
    AssistantMessage, HistoryAssistantMessage, HistoryUserMessage, Message, UserMessage,
};

/// Runs the full repair pass and returns a corrected history.
pub fn repair_history(history: Vec<Message>) -> Vec<Message> {
    let history = drop_leading_assistant(history);
    let history = collapse_consecutive_same_role(history);
    repair_tool_pairing(history)
}

/// Invariant (1): discard a leading assistant entry.
fn drop_leading_assistant(mut history: Vec<Message>) -> Vec<Message> {
    while matches!(history.first(), Some(Message::Assistant(_))) {
        history.remove(0);
    }
    history
}

/// Invariant (2): collapse consecutive same-role entries by concatenation.
fn collapse_consecutive_same_role(history: Vec<Message>) -> Vec<Message> {
    let mut result: Vec<Message> = Vec::with_capacity(history.len());

    for msg in history {
        match (result.last_mut(), &msg) {
            (Some(Message::User(prev)), Message::User(cur)) => {
                merge_user_into(prev, cur);
            }
            (Some(Message::Assistant(prev)), Message::Assistant(cur)) => {
                merge_assistant_into(prev, cur);
            }
            _ => result.push(msg),
        }
    }

    result
}

fn merge_user_into(prev: &mut HistoryUserMessage, cur: &HistoryUserMessage) {
    let p = &mut prev.user_input_message;
    let c = &cur.user_input_message;

    if !c.content.is_empty() {
        if p.content.is_empty() {
            p.content = c.content.clone();
        } else {
            p.content = format!("{}\n{}", p.content, c.content);
        }
    }
    p.images.extend(c.images.iter().cloned());
    p.user_input_message_context
        .tool_results
        .extend(c.user_input_message_context.tool_results.iter().cloned());
    p.user_input_message_context
        .tools
        .extend(c.user_input_message_context.tools.iter().cloned());
}

fn merge_assistant_into(prev: &mut HistoryAssistantMessage, cur: &HistoryAssistantMessage) {
    let p = &mut prev.assistant_response_message;
    let c = &cur.assistant_response_message;

    if !c.content.is_empty() {
        if p.content.is_empty() {
            p.content = c.content.clone();
        } else {
            p.content = format!("{}\n{}", p.content, c.content);
        }
    }
    if let Some(tool_uses) = &c.tool_uses {
        p.tool_uses
            .get_or_insert_with(Vec::new)
            .extend(tool_uses.iter().cloned());
    }
}

/// Invariant (3): filter orphan `toolResults`, drop unmatched `toolUses`.
fn repair_tool_pairing(mut history: Vec<Message>) -> Vec<Message> {
    // Collect every tool_use_id emitted by an assistant entry.
    let mut all_tool_use_ids: HashSet<String> = HashSet::new();
    for msg in &history {
        if let Message::Assistant(a) = msg {
            if let Some(tool_uses) = &a.assistant_response_message.tool_uses {
                for tu in tool_uses {
                    all_tool_use_ids.insert(tu.tool_use_id.clone());
                }
            }
        }
    }

    // Track which ids get a matching tool_result somewhere in history.
    let mut paired: HashSet<String> = HashSet::new();
    for msg in &mut history {
        if let Message::User(u) = msg {
            let ctx = &mut u.user_input_message.user_input_message_context;
            ctx.tool_results.retain(|r| {
                let ok = all_tool_use_ids.contains(&r.tool_use_id) && !paired.contains(&r.tool_use_id);
                if ok {
                    paired.insert(r.tool_use_id.clone());
                }
                ok
            });
        }
    }

    // Drop any toolUses that never got a matching toolResult.
    for msg in &mut history {
        if let Message::Assistant(a) = msg {
            if let Some(tool_uses) = &mut a.assistant_response_message.tool_uses {
                tool_uses.retain(|tu| paired.contains(&tu.tool_use_id));
                if tool_uses.is_empty() {
                    a.assistant_response_message.tool_uses = None;
                }
            }
        }
    }

    history
}

/// Convenience constructor used by tests and by adapters building minimal
/// history entries.
#[cfg(test)]
fn user(content: &str, model_id: &str) -> Message {
    Message::User(HistoryUserMessage {
        user_input_message: UserMessage::new(content, model_id),
    })
}

#[cfg(test)]
fn assistant(content: &str) -> Message {
    Message::Assistant(HistoryAssistantMessage {
        assistant_response_message: AssistantMessage::new(content),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kiro::model::requests::tool::{ToolResult, ToolUseEntry};

    #[test]
    fn drops_leading_assistant() {
        let history = vec![assistant("stray"), user("hi", "m")];
        let repaired = repair_history(history);
        assert!(matches!(repaired[0], Message::User(_)));
    }

    #[test]
    fn collapses_consecutive_user_entries() {
        let history = vec![user("a", "m"), user("b", "m"), assistant("c")];
        let repaired = repair_history(history);
        assert_eq!(repaired.len(), 2);
        if let Message::User(u) = &repaired[0] {
            assert_eq!(u.user_input_message.content, "a\nb");
        } else {
            panic!("expected user entry");
        }
    }

    #[test]
    fn collapses_consecutive_assistant_entries() {
        let history = vec![user("a", "m"), assistant("b"), assistant("c")];
        let repaired = repair_history(history);
        assert_eq!(repaired.len(), 2);
        if let Message::Assistant(a) = &repaired[1] {
            assert_eq!(a.assistant_response_message.content, "b\nc");
        } else {
            panic!("expected assistant entry");
        }
    }

    #[test]
    fn drops_tool_use_with_no_matching_result() {
        let mut assistant_msg = HistoryAssistantMessage::new("using a tool");
        assistant_msg.assistant_response_message.tool_uses =
            Some(vec![ToolUseEntry::new("tu_1", "get_time")]);

        let history = vec![user("hi", "m"), Message::Assistant(assistant_msg), user("ok", "m")];
        let repaired = repair_history(history);

        if let Message::Assistant(a) = &repaired[1] {
            assert!(a.assistant_response_message.tool_uses.is_none());
        } else {
            panic!("expected assistant entry");
        }
    }

    #[test]
    fn keeps_tool_use_with_matching_result() {
        let mut assistant_msg = HistoryAssistantMessage::new("using a tool");
        assistant_msg.assistant_response_message.tool_uses =
            Some(vec![ToolUseEntry::new("tu_1", "get_time")]);

        let mut follow_up = UserMessage::new("here", "m");
        follow_up.user_input_message_context.tool_results = vec![ToolResult::success("tu_1", "3pm")];

        let history = vec![
            user("hi", "m"),
            Message::Assistant(assistant_msg),
            Message::User(HistoryUserMessage {
                user_input_message: follow_up,
            }),
        ];
        let repaired = repair_history(history);

        if let Message::Assistant(a) = &repaired[1] {
            assert_eq!(
                a.assistant_response_message
                    .tool_uses
                    .as_ref()
                    .unwrap()
                    .len(),
                1
            );
        } else {
            panic!("expected assistant entry");
        }
    }

    #[test]
    fn filters_orphan_tool_result() {
        let mut follow_up = UserMessage::new("here", "m");
        follow_up.user_input_message_context.tool_results = vec![ToolResult::success("tu_missing", "x")];

        let history = vec![
            user("hi", "m"),
            Message::User(HistoryUserMessage {
                user_input_message: follow_up,
            }),
        ];
        let repaired = collapse_consecutive_same_role(drop_leading_assistant(history));
        let repaired = repair_tool_pairing(repaired);

        if let Message::User(u) = &repaired[0] {
            assert!(u.user_input_message.user_input_message_context.tool_results.is_empty());
        } else {
            panic!("expected user entry");
        }
    }

    #[test]
    fn empty_history_is_a_noop() {
        assert!(repair_history(Vec::new()).is_empty());
    }
}
