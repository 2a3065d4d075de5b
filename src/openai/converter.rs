//! Translates OpenAI Chat Completions requests into Kiro conversation state.

use serde_json::json;
use uuid::Uuid;

use crate::kiro::model::requests::conversation::{
    AssistantMessage, ConversationState, CurrentMessage, HistoryAssistantMessage,
    HistoryUserMessage, KiroImage, Message, UserInputMessage, UserInputMessageContext, UserMessage,
};
use crate::kiro::model::requests::tool::{
    InputSchema, Tool, ToolResult, ToolSpecification, ToolUseEntry,
};
use crate::kiro::model_map::map_model;

use super::types::{ChatCompletionRequest, ChatMessage, ChatToolDef, ContentPart, MessageContent};

#[derive(Debug)]
pub enum ConversionError {
    EmptyMessages,
    UnsupportedImage(String),
    MalformedToolCall(String),
}

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionError::EmptyMessages => write!(f, "messages array must not be empty"),
            ConversionError::UnsupportedImage(url) => write!(f, "unsupported image url: {url}"),
            ConversionError::MalformedToolCall(args) => {
                write!(f, "malformed tool call arguments: {args}")
            }
        }
    }
}

impl std::error::Error for ConversionError {}

pub struct ConversionResult {
    pub conversation_state: ConversationState,
    pub model_id: String,
}

/// Flattened view of a single chat message's content, ready to fold into
/// either the current turn or a history entry.
struct FlatContent {
    text: String,
    images: Vec<KiroImage>,
}

fn flatten_content(content: &Option<MessageContent>) -> Result<FlatContent, ConversionError> {
    let content = match content {
        None => {
            return Ok(FlatContent {
                text: String::new(),
                images: Vec::new(),
            })
        }
        Some(c) => c,
    };

    match content {
        MessageContent::Text(text) => Ok(FlatContent {
            text: text.clone(),
            images: Vec::new(),
        }),
        MessageContent::Parts(parts) => {
            let mut text_parts = Vec::new();
            let mut images = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ImageUrl { image_url } => {
                        images.push(decode_image_url(&image_url.url)?);
                    }
                }
            }
            Ok(FlatContent {
                text: text_parts.join("\n"),
                images,
            })
        }
    }
}

/// Decodes a `data:image/<fmt>;base64,<data>` URI into a Kiro image. Remote
/// (http/https) URLs are not fetched; only inline data URIs are supported.
fn decode_image_url(url: &str) -> Result<KiroImage, ConversionError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| ConversionError::UnsupportedImage(url.to_string()))?;
    let (mime, data) = rest
        .split_once(";base64,")
        .ok_or_else(|| ConversionError::UnsupportedImage(url.to_string()))?;
    let format = get_image_format(mime)
        .ok_or_else(|| ConversionError::UnsupportedImage(mime.to_string()))?;
    Ok(KiroImage::from_base64(format, data.to_string()))
}

fn get_image_format(mime_type: &str) -> Option<String> {
    match mime_type {
        "image/jpeg" | "image/jpg" => Some("jpeg".to_string()),
        "image/png" => Some("png".to_string()),
        "image/gif" => Some("gif".to_string()),
        "image/webp" => Some("webp".to_string()),
        _ => None,
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

fn tool_uses_from_calls(
    tool_calls: &[super::types::ToolCall],
) -> Result<Vec<ToolUseEntry>, ConversionError> {
    tool_calls
        .iter()
        .map(|call| {
            let input: serde_json::Value = if call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.function.arguments).map_err(|_| {
                    ConversionError::MalformedToolCall(call.function.arguments.clone())
                })?
            };
            Ok(ToolUseEntry::new(call.id.clone(), call.function.name.clone()).with_input(input))
        })
        .collect()
}

/// Converts an OpenAI Chat Completions request into a Kiro conversation
/// state. `system` messages are concatenated directly onto the first real
/// user turn's content; `tool` messages become `toolResults` attached to the
/// following user turn, mirroring how tool responses always precede the next
/// user message in the OpenAI transcript shape.
pub fn convert_request(req: &ChatCompletionRequest) -> Result<ConversionResult, ConversionError> {
    if req.messages.is_empty() {
        return Err(ConversionError::EmptyMessages);
    }

    let model_id = map_model(&req.model);
    let conversation_id = Uuid::new_v4().to_string();
    let agent_continuation_id = Uuid::new_v4().to_string();

    let mut system_prefix = String::new();
    for msg in &req.messages {
        if msg.role == "system" || msg.role == "developer" {
            let flat = flatten_content(&msg.content)?;
            if !flat.text.is_empty() {
                if !system_prefix.is_empty() {
                    system_prefix.push('\n');
                }
                system_prefix.push_str(&flat.text);
            }
        }
    }

    let turns: Vec<&ChatMessage> = req
        .messages
        .iter()
        .filter(|m| m.role != "system" && m.role != "developer")
        .collect();
    if turns.is_empty() {
        return Err(ConversionError::EmptyMessages);
    }

    let (history_turns, current_turn) = turns.split_at(turns.len() - 1);
    let current_turn = current_turn[0];

    // Trailing `tool` messages immediately before the current turn belong to
    // it, not to history, since OpenAI never attaches a tool result to
    // anything but the next user message.
    let mut split = history_turns.len();
    if current_turn.role == "user" {
        while split > 0 && history_turns[split - 1].role == "tool" {
            split -= 1;
        }
    }
    let (history_turns, trailing_tool_turns) = history_turns.split_at(split);

    let history = build_history(history_turns, &model_id)?;

    let mut current_flat = flatten_content(&current_turn.content)?;
    if !system_prefix.is_empty() {
        current_flat.text = if current_flat.text.is_empty() {
            system_prefix
        } else {
            format!("{}\n{}", system_prefix, current_flat.text)
        };
    }

    let pending_tool_results: Vec<ToolResult> = trailing_tool_turns
        .iter()
        .map(|m| tool_message_to_result(m))
        .collect();

    let mut context = UserInputMessageContext::new();
    let tools = convert_tools(&req.tools);
    if !tools.is_empty() {
        context = context.with_tools(tools);
    }
    if !pending_tool_results.is_empty() {
        context = context.with_tool_results(pending_tool_results);
    }

    let mut user_input_message = UserInputMessage::new(current_flat.text, &model_id);
    if !current_flat.images.is_empty() {
        user_input_message = user_input_message.with_images(current_flat.images);
    }
    user_input_message = user_input_message.with_context(context);

    let current_message = CurrentMessage::new(user_input_message);

    let conversation_state = ConversationState::new(conversation_id)
        .with_agent_continuation_id(agent_continuation_id)
        .with_agent_task_type("vibe")
        .with_chat_trigger_type("MANUAL")
        .with_current_message(current_message)
        .with_history(history);

    Ok(ConversionResult {
        conversation_state,
        model_id,
    })
}

fn tool_message_to_result(msg: &ChatMessage) -> ToolResult {
    let tool_use_id = msg.tool_call_id.clone().unwrap_or_default();
    let text = match &msg.content {
        Some(MessageContent::Text(t)) => t.clone(),
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    };
    ToolResult::success(tool_use_id, text)
}

/// Builds alternating Kiro history from every message except the final
/// turn. Consecutive user/tool messages are buffered and merged; an
/// assistant message flushes the buffer and is pushed as its own entry.
fn build_history(turns: &[&ChatMessage], model_id: &str) -> Result<Vec<Message>, ConversionError> {
    let mut history = Vec::new();
    let mut user_buffer: Vec<&ChatMessage> = Vec::new();
    let mut pending_tool_results: Vec<ToolResult> = Vec::new();

    for msg in turns {
        match msg.role.as_str() {
            "user" => user_buffer.push(msg),
            "tool" => pending_tool_results.push(tool_message_to_result(msg)),
            "assistant" => {
                if !user_buffer.is_empty() || !pending_tool_results.is_empty() {
                    history.push(merge_user_messages(
                        &user_buffer,
                        std::mem::take(&mut pending_tool_results),
                        model_id,
                    )?);
                    user_buffer.clear();
                }
                history.push(convert_assistant_message(msg)?);
            }
            _ => {}
        }
    }

    if !user_buffer.is_empty() || !pending_tool_results.is_empty() {
        history.push(merge_user_messages(&user_buffer, pending_tool_results, model_id)?);
        history.push(Message::Assistant(HistoryAssistantMessage::new("OK")));
    }

    Ok(history)
}

fn merge_user_messages(
    messages: &[&ChatMessage],
    tool_results: Vec<ToolResult>,
    model_id: &str,
) -> Result<Message, ConversionError> {
    let mut text_parts = Vec::new();
    let mut images = Vec::new();
    for msg in messages {
        let flat = flatten_content(&msg.content)?;
        if !flat.text.is_empty() {
            text_parts.push(flat.text);
        }
        images.extend(flat.images);
    }

    let mut user_message = UserMessage::new(text_parts.join("\n"), model_id);
    if !images.is_empty() {
        user_message = user_message.with_images(images);
    }
    if !tool_results.is_empty() {
        user_message =
            user_message.with_context(UserInputMessageContext::new().with_tool_results(tool_results));
    }

    Ok(Message::User(HistoryUserMessage {
        user_input_message: user_message,
    }))
}

fn convert_assistant_message(msg: &ChatMessage) -> Result<Message, ConversionError> {
    let flat = flatten_content(&msg.content)?;
    let mut assistant_message = AssistantMessage::new(flat.text);
    if let Some(tool_calls) = &msg.tool_calls {
        if !tool_calls.is_empty() {
            assistant_message = assistant_message.with_tool_uses(tool_uses_from_calls(tool_calls)?);
        }
    }
    Ok(Message::Assistant(HistoryAssistantMessage {
        assistant_response_message: assistant_message,
    }))
}
