//! Per-message context carried from ingress into the orchestrator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One media attachment with the text the external pre-processor extracted.
/// The engine never sees raw media.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub kind: Option<String>,

    /// Voice transcript.
    #[serde(default)]
    pub transcription: Option<String>,

    #[serde(default)]
    pub ocr_text: Option<String>,

    #[serde(default)]
    pub vision_summary: Option<String>,
}

impl Attachment {
    /// Best derived text, by priority: transcript > OCR > vision summary.
    pub fn derived_text(&self) -> Option<&str> {
        self.transcription
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.ocr_text.as_deref().filter(|s| !s.is_empty()))
            .or(self.vision_summary.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Everything the orchestrator needs to know about one inbound message
/// besides its content and principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContext {
    pub trace_id: Uuid,

    #[serde(default)]
    pub channel: Option<String>,

    #[serde(default)]
    pub thread_id: Option<String>,

    #[serde(default)]
    pub shared_thread: bool,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    /// Override for the household timezone, usually from the webhook.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl MessageContext {
    pub fn new(trace_id: Uuid) -> Self {
        Self {
            trace_id,
            channel: None,
            thread_id: None,
            shared_thread: false,
            attachments: Vec::new(),
            timezone: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_text_priority() {
        let att = Attachment {
            kind: Some("voice".to_string()),
            transcription: Some("明天提醒我打疫苗".to_string()),
            ocr_text: Some("ignored".to_string()),
            vision_summary: None,
        };
        assert_eq!(att.derived_text(), Some("明天提醒我打疫苗"));

        let att = Attachment {
            kind: Some("image".to_string()),
            transcription: None,
            ocr_text: Some("小票 80 元".to_string()),
            vision_summary: Some("a receipt".to_string()),
        };
        assert_eq!(att.derived_text(), Some("小票 80 元"));

        assert_eq!(Attachment::default().derived_text(), None);
    }

    #[test]
    fn test_empty_strings_are_skipped() {
        let att = Attachment {
            kind: None,
            transcription: Some(String::new()),
            ocr_text: None,
            vision_summary: Some("caption".to_string()),
        };
        assert_eq!(att.derived_text(), Some("caption"));
    }
}
