//! Kiro request type definitions
//!
//! Defines the main request structure for Kiro API

use serde::{Deserialize, Serialize};

use super::conversation::ConversationState;

/// Kiro API request
///
/// Used to build requests sent to Kiro API
///
/// # Example
///
/// ```rust,ignore
/// use kiro_gateway::kiro::model::requests::{
///     KiroRequest, ConversationState, CurrentMessage, UserInputMessage,
/// };
///
/// // Create a simple request
/// let state = ConversationState::new("conv-123")
///     .with_agent_task_type("vibe")
///     .with_current_message(CurrentMessage::new(
///         UserInputMessage::new("Hello", "claude-3-5-sonnet")
///     ));
///
/// let request = KiroRequest {
///     conversation_state: state,
///     profile_arn: None,
/// };
/// let json = serde_json::to_string(&request).unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroRequest {
    /// Conversation state
    pub conversation_state: ConversationState,
    /// Profile ARN (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_kiro_request_deserialize() {
        let json = r#"{
            "conversationState": {
                "conversationId": "conv-456",
                "currentMessage": {
                    "userInputMessage": {
                        "content": "Test message",
                        "modelId": "claude-3-5-sonnet",
                        "userInputMessageContext": {}
                    }
                }
            }
        }"#;

        let request: KiroRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.conversation_state.conversation_id, "conv-456");
        assert_eq!(
            request
                .conversation_state
                .current_message
                .user_input_message
                .content,
            "Test message"
        );
    }
}
