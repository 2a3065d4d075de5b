//! Event models
//!
//! Defines event types for generateAssistantResponse streaming responses

mod assistant;
mod base;
mod context_usage;
mod tool_use;

pub use assistant::AssistantResponseEvent;
pub use base::Event;
pub use context_usage::ContextUsageEvent;
pub use tool_use::ToolUseEvent;
