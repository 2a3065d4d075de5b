//! Translates `/v1/responses` typed-item input arrays into Kiro
//! conversation state.
//!
//! The Responses input is a linear item stream (`message`, `function_call`,
//! `function_call_output`) rather than Chat Completions' role-tagged
//! message list. It is walked in order, reconstructing a strict
//! user/assistant turn sequence: a `function_call_output` always attaches
//! as a `toolResult` of the *next* user turn created.

use serde_json::json;
use uuid::Uuid;

use crate::kiro::model::requests::conversation::{
    AssistantMessage, ConversationState, CurrentMessage, HistoryAssistantMessage,
    HistoryUserMessage, Message, UserInputMessage, UserInputMessageContext, UserMessage,
};
use crate::kiro::model::requests::tool::{InputSchema, Tool, ToolResult, ToolSpecification, ToolUseEntry};
use crate::kiro::model_map::map_model;

use super::converter::ConversionError;
use super::types::{ChatToolDef, ResponsesContentPart, ResponsesInput, ResponsesItem, ResponsesMessageContent, ResponsesRequest};

pub struct ConversionResult {
    pub conversation_state: ConversationState,
    pub model_id: String,
}

fn flatten_message_content(content: &ResponsesMessageContent) -> String {
    match content {
        ResponsesMessageContent::Text(text) => text.clone(),
        ResponsesMessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ResponsesContentPart::InputText { text } => Some(text.clone()),
                ResponsesContentPart::OutputText { text } => Some(text.clone()),
                ResponsesContentPart::InputImage { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn convert_tools(tools: &Option<Vec<ChatToolDef>>) -> Vec<Tool> {
    tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|t| Tool {
                    tool_specification: ToolSpecification {
                        name: t.function.name.clone(),
                        description: t
                            .function
                            .description
                            .clone()
                            .unwrap_or_else(|| t.function.name.clone()),
                        input_schema: t
                            .function
                            .parameters
                            .clone()
                            .map(InputSchema::from_json)
                            .unwrap_or_default(),
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One reconstructed conversational turn, built while walking the typed
/// item list in order.
enum Turn {
    User {
        text: String,
        tool_results: Vec<ToolResult>,
    },
    Assistant {
        text: String,
        tool_calls: Vec<ToolUseEntry>,
    },
}

fn items_to_turns(items: &[ResponsesItem]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();

    for item in items {
        match item {
            ResponsesItem::Message { role, content } => {
                let text = flatten_message_content(content);
                match role.as_str() {
                    "assistant" => turns.push(Turn::Assistant {
                        text,
                        tool_calls: Vec::new(),
                    }),
                    _ => turns.push(Turn::User {
                        text,
                        tool_results: Vec::new(),
                    }),
                }
            }
            ResponsesItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let input: serde_json::Value =
                    serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                let entry = ToolUseEntry::new(call_id.clone(), name.clone()).with_input(input);
                match turns.last_mut() {
                    Some(Turn::Assistant { tool_calls, .. }) => tool_calls.push(entry),
                    _ => turns.push(Turn::Assistant {
                        text: String::new(),
                        tool_calls: vec![entry],
                    }),
                }
            }
            ResponsesItem::FunctionCallOutput { call_id, output } => {
                let result = ToolResult::success(call_id.clone(), output.clone());
                // Attaches to the *next* user turn; if none exists yet,
                // start one so the result has somewhere to live.
                turns.push(Turn::User {
                    text: String::new(),
                    tool_results: vec![result],
                });
            }
        }
    }

    turns
}

/// Merges consecutive `Turn::User` entries (a function_call_output turn
/// followed by the next real user message) into a single history entry.
fn coalesce_turns(turns: Vec<Turn>) -> Vec<Turn> {
    let mut merged: Vec<Turn> = Vec::new();
    for turn in turns {
        match (merged.last_mut(), &turn) {
            (Some(Turn::User { text, tool_results }), Turn::User { .. }) => {
                if let Turn::User {
                    text: new_text,
                    tool_results: new_results,
                } = turn
                {
                    if !new_text.is_empty() {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&new_text);
                    }
                    tool_results.extend(new_results);
                }
            }
            _ => merged.push(turn),
        }
    }
    merged
}

pub fn convert_request(req: &ResponsesRequest) -> Result<ConversionResult, ConversionError> {
    let model_id = map_model(&req.model);

    let items: Vec<ResponsesItem> = match &req.input {
        ResponsesInput::Text(text) => vec![ResponsesItem::Message {
            role: "user".to_string(),
            content: ResponsesMessageContent::Text(text.clone()),
        }],
        ResponsesInput::Items(items) => items.clone(),
    };
    if items.is_empty() {
        return Err(ConversionError::EmptyMessages);
    }

    let turns = coalesce_turns(items_to_turns(&items));
    if turns.is_empty() {
        return Err(ConversionError::EmptyMessages);
    }

    let (history_turns, current_turn) = turns.split_at(turns.len() - 1);
    let current_turn = &current_turn[0];

    let mut history = Vec::new();
    for turn in history_turns {
        match turn {
            Turn::User { text, tool_results } => {
                let mut user_message = UserMessage::new(text.clone(), &model_id);
                if !tool_results.is_empty() {
                    user_message = user_message
                        .with_context(UserInputMessageContext::new().with_tool_results(tool_results.clone()));
                }
                history.push(Message::User(HistoryUserMessage {
                    user_input_message: user_message,
                }));
            }
            Turn::Assistant { text, tool_calls } => {
                let mut assistant_message = AssistantMessage::new(text.clone());
                if !tool_calls.is_empty() {
                    assistant_message = assistant_message.with_tool_uses(tool_calls.clone());
                }
                history.push(Message::Assistant(HistoryAssistantMessage {
                    assistant_response_message: assistant_message,
                }));
            }
        }
    }

    let (mut current_text, current_tool_results) = match current_turn {
        Turn::User { text, tool_results } => (text.clone(), tool_results.clone()),
        // A trailing assistant/function_call turn with nothing further from
        // the user is unusual; still forward its text as the current turn.
        Turn::Assistant { text, .. } => (text.clone(), Vec::new()),
    };

    if let Some(instructions) = &req.instructions {
        current_text = if current_text.is_empty() {
            instructions.clone()
        } else {
            format!("{}\n{}", instructions, current_text)
        };
    }

    let mut context = UserInputMessageContext::new();
    let tools = convert_tools(&req.tools);
    if !tools.is_empty() {
        context = context.with_tools(tools);
    }
    if !current_tool_results.is_empty() {
        context = context.with_tool_results(current_tool_results);
    }

    let user_input_message = UserInputMessage::new(current_text, &model_id).with_context(context);
    let current_message = CurrentMessage::new(user_input_message);

    let conversation_state = ConversationState::new(Uuid::new_v4().to_string())
        .with_agent_continuation_id(Uuid::new_v4().to_string())
        .with_agent_task_type("vibe")
        .with_chat_trigger_type("MANUAL")
        .with_current_message(current_message)
        .with_history(history);

    Ok(ConversionResult {
        conversation_state,
        model_id,
    })
}
