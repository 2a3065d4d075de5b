//! OpenAI Chat Completions handler
//!
//! Kiro is always drained to completion via the non-streaming call path;
//! when the client asked for `stream: true` the finished result is replayed
//! as synthesized `chat.completion.chunk` frames.

use std::collections::HashMap;

use axum::{
    Json as JsonExtractor,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use uuid::Uuid;

use crate::anthropic::AppState;
use crate::kiro::model::events::Event;
use crate::kiro::model::requests::kiro::KiroRequest;
use crate::kiro::parser::decoder::EventStreamDecoder;
use crate::token;

use super::converter::convert_request;
use super::stream::{synthesize_chunks, CompletedToolCall};
use super::types::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatResponseMessage, ChatUsage,
    ErrorResponse, ToolCall, FunctionCall,
};

const CONTEXT_WINDOW_SIZE: i32 = 200_000;

pub(super) fn error_response(
    status: StatusCode,
    error_type: &str,
    message: impl Into<String>,
) -> Response {
    (status, Json(ErrorResponse::new(error_type, message))).into_response()
}

/// Classifies a terminal upstream error message into an OpenAI-shaped error
/// body, mirroring the taxonomy the Anthropic dialect applies to the same
/// upstream failures.
pub(super) fn convert_kiro_error_to_response(error_message: &str) -> Response {
    let lower = error_message.to_lowercase();

    if lower.contains("all credentials exhausted") || lower.contains("credentials quota") {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "All credentials quota exhausted. Please wait for quota reset or add new credentials.",
        );
    }
    if lower.contains("improperly formed")
        || lower.contains("content length")
        || lower.contains("too long")
        || lower.contains("context")
    {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request_error", error_message);
    }
    if lower.contains("rate limit") || lower.contains("throttl") {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", error_message);
    }
    if lower.contains("overload") || lower.contains("capacity") {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded_error",
            error_message,
        );
    }
    error_response(StatusCode::BAD_GATEWAY, "api_error", error_message)
}

pub(super) struct DecodedReply {
    pub(super) text_content: String,
    pub(super) tool_calls: Vec<ToolCall>,
    pub(super) stop_reason: String,
    pub(super) context_input_tokens: Option<i32>,
}

pub(super) fn decode_body(body_bytes: &[u8]) -> DecodedReply {
    let mut decoder = EventStreamDecoder::new();
    if let Err(e) = decoder.feed(body_bytes) {
        tracing::warn!("Buffer overflow: {}", e);
    }

    let mut text_content = String::new();
    let mut tool_calls = Vec::new();
    let mut has_tool_use = false;
    let mut stop_reason = "stop".to_string();
    let mut context_input_tokens: Option<i32> = None;
    let mut tool_json_buffers: HashMap<String, String> = HashMap::new();

    for result in decoder.decode_iter() {
        match result {
            Ok(frame) => {
                if let Ok(event) = Event::from_frame(frame) {
                    match event {
                        Event::AssistantResponse(resp) => {
                            text_content.push_str(&resp.content);
                        }
                        Event::ToolUse(tool_use) => {
                            has_tool_use = true;
                            let buffer = tool_json_buffers
                                .entry(tool_use.tool_use_id.clone())
                                .or_default();
                            buffer.push_str(&tool_use.input);

                            if tool_use.stop {
                                let arguments = buffer.clone();
                                let arguments = if arguments.trim().is_empty() {
                                    "{}".to_string()
                                } else {
                                    arguments
                                };
                                tool_calls.push(ToolCall {
                                    id: tool_use.tool_use_id.clone(),
                                    call_type: "function".to_string(),
                                    function: FunctionCall {
                                        name: tool_use.name.clone(),
                                        arguments,
                                    },
                                });
                            }
                        }
                        Event::ContextUsage(usage) => {
                            let actual = (usage.context_usage_percentage
                                * (CONTEXT_WINDOW_SIZE as f64)
                                / 100.0) as i32;
                            context_input_tokens = Some(actual);
                            if usage.context_usage_percentage >= 100.0 {
                                stop_reason = "length".to_string();
                            }
                        }
                        Event::Exception { exception_type, .. } => {
                            if exception_type == "ContentLengthExceededException" {
                                stop_reason = "length".to_string();
                            }
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to decode event: {}", e),
        }
    }

    if has_tool_use && stop_reason == "stop" {
        stop_reason = "tool_calls".to_string();
    }

    DecodedReply {
        text_content,
        tool_calls,
        stop_reason,
        context_input_tokens,
    }
}

pub async fn post_chat_completions(
    State(state): State<AppState>,
    JsonExtractor(payload): JsonExtractor<ChatCompletionRequest>,
) -> Response {
    let Some(provider) = state.kiro_provider.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "api_error",
            "Kiro provider not configured",
        );
    };

    let conversion = match convert_request(&payload) {
        Ok(c) => c,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request_error", e.to_string());
        }
    };

    let kiro_request = KiroRequest {
        conversation_state: conversion.conversation_state,
        profile_arn: state.profile_arn.clone(),
    };
    let request_body = match serde_json::to_string(&kiro_request) {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                format!("Failed to serialize request: {e}"),
            );
        }
    };

    if request_body.len() > state.config.max_request_body_bytes {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "request body too large",
        );
    }

    let input_tokens = token::count_tokens(&request_body) as i32;
    let model = conversion.model_id;
    let flow_id = Uuid::new_v4().to_string();
    let created_at_ms = crate::kiro::flow::now_ms();

    let response = match provider.call_api(&request_body).await {
        Ok(resp) => resp,
        Err(e) => {
            let mut record = crate::kiro::flow::FlowRecord::new(
                flow_id,
                "openai_chat",
                model.clone(),
                created_at_ms,
            );
            record.state = crate::kiro::flow::FlowState::Error;
            record.completed_at_ms = Some(crate::kiro::flow::now_ms());
            record.error = Some(crate::kiro::flow::FlowError {
                kind: "upstream_error".to_string(),
                message: e.to_string(),
                status: None,
            });
            state.flow_recorder.record(record);
            return convert_kiro_error_to_response(&e.to_string());
        }
    };

    let body_bytes = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                "api_error",
                format!("Failed to read response: {e}"),
            );
        }
    };

    let decoded = decode_body(&body_bytes);
    let final_input_tokens = decoded.context_input_tokens.unwrap_or(input_tokens);

    let mut content_blocks: Vec<serde_json::Value> = Vec::new();
    if !decoded.text_content.is_empty() {
        content_blocks.push(json!({"type": "text", "text": decoded.text_content}));
    }
    for call in &decoded.tool_calls {
        content_blocks.push(json!({"type": "tool_use", "input": serde_json::from_str::<serde_json::Value>(&call.function.arguments).unwrap_or(json!({}))}));
    }
    let output_tokens = token::estimate_output_tokens(&content_blocks);

    let mut record =
        crate::kiro::flow::FlowRecord::new(flow_id, "openai_chat", model.clone(), created_at_ms);
    record.state = crate::kiro::flow::FlowState::Completed;
    record.completed_at_ms = Some(crate::kiro::flow::now_ms());
    record.input_tokens = Some(final_input_tokens.max(0) as u64);
    record.output_tokens = Some(output_tokens.max(0) as u64);
    state.flow_recorder.record(record);

    if payload.stream {
        let completed_tool_calls: Vec<CompletedToolCall> = decoded
            .tool_calls
            .iter()
            .map(|c| CompletedToolCall {
                id: c.id.clone(),
                name: c.function.name.clone(),
                arguments: c.function.arguments.clone(),
            })
            .collect();
        let chunk_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
        let chunks = synthesize_chunks(
            &chunk_id,
            (created_at_ms / 1000) as i64,
            &model,
            &decoded.text_content,
            &completed_tool_calls,
            &decoded.stop_reason,
        );
        let stream = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::convert::Infallible>));
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap();
    }

    let message = ChatResponseMessage {
        role: "assistant".to_string(),
        content: if decoded.text_content.is_empty() {
            None
        } else {
            Some(decoded.text_content)
        },
        tool_calls: if decoded.tool_calls.is_empty() {
            None
        } else {
            Some(decoded.tool_calls)
        },
    };

    let body = ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: (created_at_ms / 1000) as i64,
        model,
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: decoded.stop_reason,
        }],
        usage: ChatUsage {
            prompt_tokens: final_input_tokens,
            completion_tokens: output_tokens,
            total_tokens: final_input_tokens + output_tokens,
        },
    };

    (StatusCode::OK, Json(body)).into_response()
}
