//! Prompt catalog: named blocks composed into versioned variants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which phase of a message a prompt is assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPhase {
    System,
    Understanding,
    ToolPlanning,
    Response,
}

/// Per-channel overrides for one variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelProfile {
    #[serde(default)]
    pub response_blocks: Option<Vec<String>>,

    /// Hard cap on reply length for this channel; longer replies are
    /// truncated with an ellipsis.
    #[serde(default)]
    pub max_reply_chars: Option<usize>,
}

/// One prompt variant: an ordered block list per phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptVariant {
    #[serde(default)]
    pub system_blocks: Vec<String>,

    #[serde(default)]
    pub understanding_blocks: Vec<String>,

    #[serde(default)]
    pub tool_planning_blocks: Vec<String>,

    #[serde(default)]
    pub response_blocks: Vec<String>,

    #[serde(default)]
    pub profiles: BTreeMap<String, ChannelProfile>,
}

impl PromptVariant {
    /// Block list for a phase, honoring per-channel response overrides.
    pub fn blocks_for(&self, phase: PromptPhase, channel: Option<&str>) -> &[String] {
        if phase == PromptPhase::Response {
            if let Some(profile) = channel.and_then(|c| self.profiles.get(c)) {
                if let Some(blocks) = &profile.response_blocks {
                    return blocks;
                }
            }
        }
        match phase {
            PromptPhase::System => &self.system_blocks,
            PromptPhase::Understanding => &self.understanding_blocks,
            PromptPhase::ToolPlanning => &self.tool_planning_blocks,
            PromptPhase::Response => &self.response_blocks,
        }
    }

    pub fn reply_cap_for(&self, channel: Option<&str>) -> Option<usize> {
        channel
            .and_then(|c| self.profiles.get(c))
            .and_then(|p| p.max_reply_chars)
    }
}

/// On-disk catalog shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptCatalog {
    /// `name -> text`.
    #[serde(default)]
    pub blocks: BTreeMap<String, String>,

    /// `variant name -> variant`.
    #[serde(default)]
    pub prompts: BTreeMap<String, PromptVariant>,

    /// The default variant.
    #[serde(default)]
    pub current: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_for_uses_channel_override_only_for_response() {
        let variant = PromptVariant {
            system_blocks: vec!["core".to_string()],
            response_blocks: vec!["respond".to_string()],
            profiles: BTreeMap::from([(
                "threema".to_string(),
                ChannelProfile {
                    response_blocks: Some(vec!["respond_compact".to_string()]),
                    max_reply_chars: Some(500),
                },
            )]),
            ..Default::default()
        };

        assert_eq!(
            variant.blocks_for(PromptPhase::Response, Some("threema")),
            ["respond_compact".to_string()]
        );
        assert_eq!(
            variant.blocks_for(PromptPhase::Response, Some("email")),
            ["respond".to_string()]
        );
        assert_eq!(
            variant.blocks_for(PromptPhase::System, Some("threema")),
            ["core".to_string()]
        );
        assert_eq!(variant.reply_cap_for(Some("threema")), Some(500));
        assert_eq!(variant.reply_cap_for(None), None);
    }
}
