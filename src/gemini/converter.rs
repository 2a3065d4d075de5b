//! Translates Gemini `generateContent` requests into Kiro conversation
//! state.

use uuid::Uuid;

use crate::kiro::model::requests::conversation::{
    AssistantMessage, ConversationState, CurrentMessage, HistoryAssistantMessage,
    HistoryUserMessage, KiroImage, Message, UserInputMessage, UserInputMessageContext, UserMessage,
};
use crate::kiro::model::requests::tool::{InputSchema, Tool, ToolResult, ToolSpecification, ToolUseEntry};
use crate::kiro::model_map::map_model;

use super::types::{Content, GenerateContentRequest, GeminiTool, Part};

#[derive(Debug)]
pub enum ConversionError {
    EmptyContents,
}

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionError::EmptyContents => write!(f, "contents array must not be empty"),
        }
    }
}

impl std::error::Error for ConversionError {}

pub struct ConversionResult {
    pub conversation_state: ConversationState,
    pub model_id: String,
}

struct FlatContent {
    text: String,
    images: Vec<KiroImage>,
    tool_calls: Vec<ToolUseEntry>,
    tool_results: Vec<ToolResult>,
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

fn flatten_parts(parts: &[Part]) -> FlatContent {
    let mut text_parts = Vec::new();
    let mut images = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();

    for part in parts {
        if let Some(text) = &part.text {
            text_parts.push(text.clone());
        }
        if let Some(call) = &part.function_call {
            tool_calls.push(
                ToolUseEntry::new(Uuid::new_v4().to_string(), call.name.clone())
                    .with_input(call.args.clone()),
            );
        }
        if let Some(response) = &part.function_response {
            let content = serde_json::to_string(&response.response).unwrap_or_default();
            tool_results.push(ToolResult::success(response.name.clone(), content));
        }
        if let Some(inline) = &part.inline_data {
            if let Some(format) = get_image_format(&inline.mime_type) {
                images.push(KiroImage::from_base64(format, inline.data.clone()));
            }
        }
    }

    FlatContent {
        text: text_parts.join("\n"),
        images,
        tool_calls,
        tool_results,
    }
}

fn convert_tools(tools: &Option<Vec<GeminiTool>>) -> Vec<Tool> {
    tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .flat_map(|t| t.function_declarations.iter())
                .map(|decl| Tool {
                    tool_specification: ToolSpecification {
                        name: decl.name.clone(),
                        description: decl
                            .description
                            .clone()
                            .unwrap_or_else(|| decl.name.clone()),
                        input_schema: decl
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

/// Concatenates every text part across the request, for the chars/4 token
/// approximation used by the `usageMetadata` field.
pub fn extract_all_text(req: &GenerateContentRequest) -> String {
    let mut parts = Vec::new();
    if let Some(system) = &req.system_instruction {
        let flat = flatten_parts(&system.parts);
        if !flat.text.is_empty() {
            parts.push(flat.text);
        }
    }
    for content in &req.contents {
        let flat = flatten_parts(&content.parts);
        if !flat.text.is_empty() {
            parts.push(flat.text);
        }
    }
    parts.join("\n")
}

/// Converts a `generateContent` request into a Kiro conversation state.
/// `contents[]` alternates `user`/`model` turns directly; `systemInstruction`
/// prepends the first user turn's text.
pub fn convert_request(
    req: &GenerateContentRequest,
    model_name: &str,
) -> Result<ConversionResult, ConversionError> {
    if req.contents.is_empty() {
        return Err(ConversionError::EmptyContents);
    }

    let model_id = map_model(model_name);

    let system_prefix = req
        .system_instruction
        .as_ref()
        .map(|c| flatten_parts(&c.parts).text)
        .unwrap_or_default();

    let (history_turns, current_turn) = req.contents.split_at(req.contents.len() - 1);
    let current_turn = &current_turn[0];

    let history = build_history(history_turns, &model_id);

    let mut current_flat = flatten_parts(&current_turn.parts);
    if !system_prefix.is_empty() {
        current_flat.text = if current_flat.text.is_empty() {
            system_prefix
        } else {
            format!("{}\n{}", system_prefix, current_flat.text)
        };
    }

    let mut context = UserInputMessageContext::new();
    let tools = convert_tools(&req.tools);
    if !tools.is_empty() {
        context = context.with_tools(tools);
    }
    if !current_flat.tool_results.is_empty() {
        context = context.with_tool_results(current_flat.tool_results);
    }

    let mut user_input_message = UserInputMessage::new(current_flat.text, &model_id);
    if !current_flat.images.is_empty() {
        user_input_message = user_input_message.with_images(current_flat.images);
    }
    user_input_message = user_input_message.with_context(context);

    let conversation_state = ConversationState::new(Uuid::new_v4().to_string())
        .with_agent_continuation_id(Uuid::new_v4().to_string())
        .with_agent_task_type("vibe")
        .with_chat_trigger_type("MANUAL")
        .with_current_message(CurrentMessage::new(user_input_message))
        .with_history(history);

    Ok(ConversionResult {
        conversation_state,
        model_id,
    })
}

/// Builds alternating history from `role ∈ {user, model}` content turns.
/// Gemini already guarantees strict alternation on the wire, so each turn
/// maps to exactly one history entry (unlike the OpenAI dialects, which
/// must buffer/merge their richer role vocabulary).
fn build_history(turns: &[Content], model_id: &str) -> Vec<Message> {
    turns
        .iter()
        .map(|turn| {
            let flat = flatten_parts(&turn.parts);
            match turn.role.as_deref() {
                Some("model") => {
                    let mut assistant_message = AssistantMessage::new(flat.text);
                    if !flat.tool_calls.is_empty() {
                        assistant_message = assistant_message.with_tool_uses(flat.tool_calls);
                    }
                    Message::Assistant(HistoryAssistantMessage {
                        assistant_response_message: assistant_message,
                    })
                }
                _ => {
                    let mut user_message = UserMessage::new(flat.text, model_id);
                    if !flat.images.is_empty() {
                        user_message = user_message.with_images(flat.images);
                    }
                    if !flat.tool_results.is_empty() {
                        user_message = user_message.with_context(
                            UserInputMessageContext::new().with_tool_results(flat.tool_results),
                        );
                    }
                    Message::User(HistoryUserMessage {
                        user_input_message: user_message,
                    })
                }
            }
        })
        .collect()
}
