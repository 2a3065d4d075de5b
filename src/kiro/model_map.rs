//! Shared model-name mapping
//!
//! A single fixed table maps OpenAI, Anthropic, and Gemini model names onto
//! the handful of upstream model ids the Kiro backend accepts. All inbound
//! protocol adapters go through this table so the mapping stays consistent
//! across dialects.

/// Default upstream model id used whenever an inbound request names a model
/// this table doesn't recognize.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4";

/// Map an inbound model name (OpenAI, Anthropic, or Gemini) to the upstream
/// model id.
///
/// - Sonnet 4.5 → `claude-sonnet-4.5`; any other Sonnet → `claude-sonnet-4`.
/// - Opus 4.5 → `claude-opus-4.5`; any other Opus → `claude-opus-4.6`.
/// - Haiku → `claude-haiku-4.5`.
/// - `auto` passes through unchanged.
/// - Anything unrecognized falls back to [`DEFAULT_MODEL`], so a caller never
///   has to special-case an unknown inbound model name.
pub fn map_model(model: &str) -> String {
    let model_lower = model.to_lowercase();

    if model_lower.contains("sonnet") {
        if model_lower.contains("4-5") || model_lower.contains("4.5") {
            "claude-sonnet-4.5".to_string()
        } else {
            "claude-sonnet-4".to_string()
        }
    } else if model_lower.contains("opus") {
        if model_lower.contains("4-5") || model_lower.contains("4.5") {
            "claude-opus-4.5".to_string()
        } else {
            "claude-opus-4.6".to_string()
        }
    } else if model_lower.contains("haiku") {
        "claude-haiku-4.5".to_string()
    } else if model_lower.contains("auto") {
        "auto".to_string()
    } else {
        DEFAULT_MODEL.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_sonnet_variants() {
        assert_eq!(map_model("claude-3-5-sonnet-20241022"), "claude-sonnet-4");
        assert_eq!(map_model("gpt-sonnet-4.5"), "claude-sonnet-4.5");
        assert_eq!(map_model("sonnet-4-5"), "claude-sonnet-4.5");
    }

    #[test]
    fn maps_opus_variants() {
        assert_eq!(map_model("claude-opus-4-5"), "claude-opus-4.5");
        assert_eq!(map_model("claude-3-opus"), "claude-opus-4.6");
    }

    #[test]
    fn maps_haiku_and_auto() {
        assert_eq!(map_model("claude-haiku"), "claude-haiku-4.5");
        assert_eq!(map_model("auto"), "auto");
    }

    #[test]
    fn falls_back_to_default() {
        assert_eq!(map_model("gemini-1.5-pro"), DEFAULT_MODEL);
        assert_eq!(map_model("gpt-4o"), DEFAULT_MODEL);
    }
}
