//! `/v1/models/{model}:generateContent` handler

use axum::{
    Json as JsonExtractor,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde_json::json;

use crate::anthropic::AppState;
use crate::kiro::model::events::Event;
use crate::kiro::model::requests::kiro::KiroRequest;
use crate::kiro::parser::decoder::EventStreamDecoder;

use super::converter::{convert_request, extract_all_text};
use super::types::{
    Candidate, FunctionCall, GenerateContentRequest, GenerateContentResponse,
    GeminiErrorResponse, ResponseContent, ResponsePart, UsageMetadata,
};

fn error_response(status: StatusCode, gemini_status: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(GeminiErrorResponse::new(status.as_u16(), gemini_status, message)),
    )
        .into_response()
}

fn convert_kiro_error_to_response(error_message: &str) -> Response {
    let lower = error_message.to_lowercase();
    if lower.contains("all credentials exhausted") || lower.contains("rate limit") || lower.contains("throttl") {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "RESOURCE_EXHAUSTED", error_message);
    }
    if lower.contains("too long") || lower.contains("content length") || lower.contains("context") {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", error_message);
    }
    if lower.contains("suspended") || lower.contains("disabled") {
        return error_response(StatusCode::FORBIDDEN, "PERMISSION_DENIED", error_message);
    }
    if lower.contains("overload") || lower.contains("capacity") {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", error_message);
    }
    error_response(StatusCode::BAD_GATEWAY, "INTERNAL", error_message)
}

/// Splits the combined `{model}:{action}` path segment Gemini's REST
/// surface embeds a literal colon into. Axum's router can only capture
/// whole segments, so the split happens here instead of in the route
/// pattern.
fn split_model_action(model_action: &str) -> (&str, &str) {
    match model_action.rsplit_once(':') {
        Some((model, action)) => (model, action),
        None => (model_action, "generateContent"),
    }
}

pub async fn generate_content(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    JsonExtractor(payload): JsonExtractor<GenerateContentRequest>,
) -> Response {
    let (model_name, action) = split_model_action(&model_action);
    let wants_stream = action == "streamGenerateContent"
        || query.get("alt").map(|v| v == "sse").unwrap_or(false);

    let Some(provider) = state.kiro_provider.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "UNAVAILABLE",
            "Kiro provider not configured",
        );
    };

    let conversion = match convert_request(&payload, model_name) {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", e.to_string()),
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
                "INTERNAL",
                format!("Failed to serialize request: {e}"),
            );
        }
    };

    if request_body.len() > state.config.max_request_body_bytes {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", "request body too large");
    }

    let prompt_tokens = (extract_all_text(&payload).len() / 4).max(1) as i32;
    let model = conversion.model_id;
    let flow_id = uuid::Uuid::new_v4().to_string();
    let created_at_ms = crate::kiro::flow::now_ms();

    let response = match provider.call_api(&request_body).await {
        Ok(resp) => resp,
        Err(e) => {
            let mut record =
                crate::kiro::flow::FlowRecord::new(flow_id, "gemini", model.clone(), created_at_ms);
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
                "INTERNAL",
                format!("Failed to read response: {e}"),
            );
        }
    };

    let mut decoder = EventStreamDecoder::new();
    if let Err(e) = decoder.feed(&body_bytes) {
        tracing::warn!("Buffer overflow: {}", e);
    }

    let mut text_content = String::new();
    let mut function_calls: Vec<FunctionCall> = Vec::new();
    let mut finish_reason = "STOP".to_string();
    let mut tool_json_buffers: std::collections::HashMap<String, String> =
        std::collections::HashMap::new();

    for result in decoder.decode_iter() {
        match result {
            Ok(frame) => {
                if let Ok(event) = Event::from_frame(frame) {
                    match event {
                        Event::AssistantResponse(resp) => text_content.push_str(&resp.content),
                        Event::ToolUse(tool_use) => {
                            let buffer = tool_json_buffers
                                .entry(tool_use.tool_use_id.clone())
                                .or_default();
                            buffer.push_str(&tool_use.input);
                            if tool_use.stop {
                                let args = serde_json::from_str(buffer).unwrap_or(json!({}));
                                function_calls.push(FunctionCall {
                                    name: tool_use.name.clone(),
                                    args,
                                });
                            }
                        }
                        Event::Exception { exception_type, .. } => {
                            if exception_type == "ContentLengthExceededException" {
                                finish_reason = "MAX_TOKENS".to_string();
                            }
                        }
                        Event::ContextUsage(usage) => {
                            if usage.context_usage_percentage >= 100.0 {
                                finish_reason = "MAX_TOKENS".to_string();
                            }
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to decode event: {}", e),
        }
    }

    let output_tokens = (text_content.len() / 4).max(1) as i32;

    let mut record = crate::kiro::flow::FlowRecord::new(flow_id, "gemini", model.clone(), created_at_ms);
    record.state = crate::kiro::flow::FlowState::Completed;
    record.completed_at_ms = Some(crate::kiro::flow::now_ms());
    record.input_tokens = Some(prompt_tokens.max(0) as u64);
    record.output_tokens = Some(output_tokens.max(0) as u64);
    state.flow_recorder.record(record);

    if !function_calls.is_empty() {
        finish_reason = "STOP".to_string();
    }

    let mut parts = Vec::new();
    if !text_content.is_empty() {
        parts.push(ResponsePart::Text {
            text: text_content.clone(),
        });
    }
    for call in function_calls {
        parts.push(ResponsePart::FunctionCall { function_call: call });
    }
    if parts.is_empty() {
        parts.push(ResponsePart::Text { text: String::new() });
    }

    let body = GenerateContentResponse {
        candidates: vec![Candidate {
            content: ResponseContent {
                role: "model".to_string(),
                parts,
            },
            finish_reason,
            index: 0,
        }],
        usage_metadata: UsageMetadata {
            prompt_token_count: prompt_tokens,
            candidates_token_count: output_tokens,
            total_token_count: prompt_tokens + output_tokens,
        },
    };

    if wants_stream {
        let json_body = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
        let frame = Bytes::from(format!("data: {json_body}\n\n"));
        let stream = futures::stream::iter(vec![Ok::<_, std::convert::Infallible>(frame)]);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap();
    }

    (StatusCode::OK, Json(body)).into_response()
}
