//! Synthesizes OpenAI-shaped streaming chunks from an already-complete
//! upstream reply. Kiro itself is always drained to completion first; when
//! the client asked for `stream: true` the finished text and tool calls are
//! sliced into `chat.completion.chunk` frames on the way out.

use bytes::Bytes;

use super::types::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, FunctionCallDelta, ToolCallDelta,
};

const CONTENT_SLICE_LEN: usize = 80;
const ARGUMENT_SLICE_LEN: usize = 200;

pub struct CompletedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Splits `text` into chunks of at most `max_len` bytes, respecting UTF-8
/// character boundaries.
fn slice_str(text: &str, max_len: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut slices = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    while start < bytes.len() {
        let mut end = (start + max_len).min(bytes.len());
        while end < bytes.len() && !text.is_char_boundary(end) {
            end -= 1;
        }
        slices.push(text[start..end].to_string());
        start = end;
    }
    slices
}

fn frame(chunk: &ChatCompletionChunk) -> Bytes {
    let json = serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {json}\n\n"))
}

/// Builds the full sequence of SSE bytes for a synthesized streaming reply:
/// a role-announcing chunk, content slices, one frame per tool call (id +
/// name first, then argument slices), a terminal finish_reason chunk, and
/// the closing `[DONE]` marker.
#[allow(clippy::too_many_arguments)]
pub fn synthesize_chunks(
    id: &str,
    created: i64,
    model: &str,
    content: &str,
    tool_calls: &[CompletedToolCall],
    finish_reason: &str,
) -> Vec<Bytes> {
    let mut out = Vec::new();
    let base = |delta: ChunkDelta, finish_reason: Option<String>| ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
    };

    out.push(frame(&base(
        ChunkDelta {
            role: Some("assistant".to_string()),
            content: None,
            tool_calls: None,
        },
        None,
    )));

    for slice in slice_str(content, CONTENT_SLICE_LEN) {
        out.push(frame(&base(
            ChunkDelta {
                role: None,
                content: Some(slice),
                tool_calls: None,
            },
            None,
        )));
    }

    for (index, call) in tool_calls.iter().enumerate() {
        out.push(frame(&base(
            ChunkDelta {
                role: None,
                content: None,
                tool_calls: Some(vec![ToolCallDelta {
                    index: index as u32,
                    id: Some(call.id.clone()),
                    call_type: Some("function".to_string()),
                    function: FunctionCallDelta {
                        name: Some(call.name.clone()),
                        arguments: Some(String::new()),
                    },
                }]),
            },
            None,
        )));

        for slice in slice_str(&call.arguments, ARGUMENT_SLICE_LEN) {
            out.push(frame(&base(
                ChunkDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![ToolCallDelta {
                        index: index as u32,
                        id: None,
                        call_type: None,
                        function: FunctionCallDelta {
                            name: None,
                            arguments: Some(slice),
                        },
                    }]),
                },
                None,
            )));
        }
    }

    out.push(frame(&base(
        ChunkDelta::default(),
        Some(finish_reason.to_string()),
    )));

    out.push(Bytes::from_static(b"data: [DONE]\n\n"));
    out
}
