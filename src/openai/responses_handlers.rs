//! `/v1/responses` handler
//!
//! Kiro is drained to completion first (identical decode path to Chat
//! Completions), then replayed either as one JSON object or as the exact
//! SSE event sequence the Responses streaming contract requires.

use axum::{
    Json as JsonExtractor,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde_json::json;
use uuid::Uuid;

use crate::anthropic::AppState;
use crate::kiro::model::requests::kiro::KiroRequest;
use crate::token;

use super::handlers::{convert_kiro_error_to_response, decode_body, error_response};
use super::responses_converter::convert_request;
use super::types::{
    ResponsesOutputContent, ResponsesOutputItem, ResponsesRequest, ResponsesResponse,
    ResponsesUsage,
};

fn sse(event: &str, data: serde_json::Value) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

pub async fn post_responses(
    State(state): State<AppState>,
    JsonExtractor(payload): JsonExtractor<ResponsesRequest>,
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
    let response_id = format!("resp_{}", Uuid::new_v4().simple());
    let flow_id = Uuid::new_v4().to_string();
    let created_at_ms = crate::kiro::flow::now_ms();

    let response = match provider.call_api(&request_body).await {
        Ok(resp) => resp,
        Err(e) => {
            let mut record = crate::kiro::flow::FlowRecord::new(
                flow_id,
                "openai_responses",
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
            if payload.stream {
                return failed_stream_response(&response_id, &model, created_at_ms, &e.to_string());
            }
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

    let mut record = crate::kiro::flow::FlowRecord::new(
        flow_id,
        "openai_responses",
        model.clone(),
        created_at_ms,
    );
    record.state = crate::kiro::flow::FlowState::Completed;
    record.completed_at_ms = Some(crate::kiro::flow::now_ms());
    record.input_tokens = Some(final_input_tokens.max(0) as u64);
    record.output_tokens = Some(output_tokens.max(0) as u64);
    state.flow_recorder.record(record);

    if payload.stream {
        return stream_response(
            &response_id,
            &model,
            created_at_ms,
            &decoded.text_content,
            &decoded.tool_calls,
        );
    }

    let mut output = Vec::new();
    if !decoded.text_content.is_empty() || decoded.tool_calls.is_empty() {
        output.push(ResponsesOutputItem::Message {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            role: "assistant".to_string(),
            status: "completed".to_string(),
            content: vec![ResponsesOutputContent::OutputText {
                text: decoded.text_content,
            }],
        });
    }
    for call in &decoded.tool_calls {
        output.push(ResponsesOutputItem::FunctionCall {
            id: format!("fc_{}", Uuid::new_v4().simple()),
            call_id: call.id.clone(),
            name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
            status: "completed".to_string(),
        });
    }

    let body = ResponsesResponse {
        id: response_id,
        object: "response".to_string(),
        created_at: (created_at_ms / 1000) as i64,
        model,
        status: "completed".to_string(),
        output,
        usage: ResponsesUsage {
            input_tokens: final_input_tokens,
            output_tokens,
            total_tokens: final_input_tokens + output_tokens,
        },
    };

    (StatusCode::OK, Json(body)).into_response()
}

fn stream_response(
    response_id: &str,
    model: &str,
    created_at_ms: u64,
    text_content: &str,
    tool_calls: &[super::types::ToolCall],
) -> Response {
    let mut frames = Vec::new();
    let created = (created_at_ms / 1000) as i64;

    frames.push(sse(
        "response.created",
        json!({"response": {"id": response_id, "object": "response", "created_at": created, "model": model, "status": "in_progress"}}),
    ));

    let message_id = format!("msg_{}", Uuid::new_v4().simple());
    frames.push(sse(
        "response.output_item.added",
        json!({"output_index": 0, "item": {"id": message_id, "type": "message", "role": "assistant", "status": "in_progress", "content": []}}),
    ));

    const DELTA_SLICE_LEN: usize = 80;
    if !text_content.is_empty() {
        let mut start = 0;
        let bytes = text_content.as_bytes();
        while start < bytes.len() {
            let mut end = (start + DELTA_SLICE_LEN).min(bytes.len());
            while end < bytes.len() && !text_content.is_char_boundary(end) {
                end -= 1;
            }
            let slice = &text_content[start..end];
            frames.push(sse(
                "response.output_text.delta",
                json!({"item_id": message_id, "output_index": 0, "delta": slice}),
            ));
            start = end;
        }
    }

    frames.push(sse(
        "response.output_item.done",
        json!({"output_index": 0, "item": {"id": message_id, "type": "message", "role": "assistant", "status": "completed", "content": [{"type": "output_text", "text": text_content}]}}),
    ));

    for (index, call) in tool_calls.iter().enumerate() {
        let item_id = format!("fc_{}", Uuid::new_v4().simple());
        let output_index = index + 1;
        frames.push(sse(
            "response.output_item.added",
            json!({"output_index": output_index, "item": {"id": item_id, "type": "function_call", "call_id": call.id, "name": call.function.name, "arguments": "", "status": "in_progress"}}),
        ));
        frames.push(sse(
            "response.output_item.done",
            json!({"output_index": output_index, "item": {"id": item_id, "type": "function_call", "call_id": call.id, "name": call.function.name, "arguments": call.function.arguments, "status": "completed"}}),
        ));
    }

    frames.push(sse(
        "response.completed",
        json!({"response": {"id": response_id, "object": "response", "created_at": created, "model": model, "status": "completed"}}),
    ));

    body_from_frames(frames)
}

fn failed_stream_response(response_id: &str, model: &str, created_at_ms: u64, error_message: &str) -> Response {
    let created = (created_at_ms / 1000) as i64;
    let frames = vec![
        sse(
            "response.created",
            json!({"response": {"id": response_id, "object": "response", "created_at": created, "model": model, "status": "in_progress"}}),
        ),
        sse(
            "response.failed",
            json!({"response": {"id": response_id, "object": "response", "created_at": created, "model": model, "status": "failed", "error": {"code": classify_error_code(error_message), "message": error_message}}}),
        ),
    ];
    body_from_frames(frames)
}

fn classify_error_code(error_message: &str) -> &'static str {
    let lower = error_message.to_lowercase();
    if lower.contains("all credentials exhausted") || lower.contains("rate limit") || lower.contains("throttl") {
        "rate_limit_exceeded"
    } else if lower.contains("too long") || lower.contains("content length") || lower.contains("context") {
        "context_length_exceeded"
    } else if lower.contains("suspended") || lower.contains("disabled") {
        "account_suspended"
    } else if lower.contains("overload") || lower.contains("capacity") {
        "server_error"
    } else {
        "server_error"
    }
}

fn body_from_frames(frames: Vec<Bytes>) -> Response {
    let stream = futures::stream::iter(frames.into_iter().map(Ok::<_, std::convert::Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap()
}
