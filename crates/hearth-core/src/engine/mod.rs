//! The per-message engine: analysis loop, responder, orchestrator.

pub mod analysis;
pub mod orchestrator;
pub mod responder;

use chrono::{DateTime, Datelike, Months, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::{Value, json};
use uuid::Uuid;

use hearth_types::message::{Attachment, MessageContext};

/// Prefix under which derived attachment text is appended to the message.
const ATTACHMENT_PREFIX: &str = "[附件提取]";

/// Merge pre-extracted attachment text into the message content.
///
/// Priority per attachment: transcript > OCR text > vision summary. The
/// original text order is preserved so the LLM sees the full utterance
/// first.
pub fn merge_attachment_texts(content: &str, attachments: &[Attachment]) -> String {
    let derived: Vec<&str> = attachments.iter().filter_map(Attachment::derived_text).collect();
    if derived.is_empty() {
        return content.to_string();
    }
    let base = content.trim();
    if base.is_empty() {
        derived.join("\n")
    } else {
        format!("{base}\n\n{ATTACHMENT_PREFIX}\n{}", derived.join("\n"))
    }
}

/// Build the `request_meta` block the analysis payload carries: wall clock
/// and month period in the household timezone, plus runtime facts.
pub fn build_request_meta(
    now_utc: DateTime<Utc>,
    tz_name: &str,
    ctx: &MessageContext,
    principal: Uuid,
    prompt_version: &str,
) -> Value {
    let tz: Tz = tz_name.parse().unwrap_or(chrono_tz::UTC);
    let now_local = now_utc.with_timezone(&tz);

    let month_start = NaiveDate::from_ymd_opt(now_local.year(), now_local.month(), 1)
        .expect("first of month is always valid");
    let month_end = month_start
        .checked_add_months(Months::new(1))
        .and_then(|d| d.pred_opt())
        .expect("month arithmetic stays in range");
    let days_remaining = (month_end.day() - now_local.day()) as i64;

    json!({
        "clock": {
            "now_local_iso": now_local.to_rfc3339(),
            "now_utc_iso": now_utc.to_rfc3339(),
            "timezone": tz.name(),
            "today": now_local.date_naive().to_string(),
            "weekday": now_local.weekday().to_string(),
            "time_hm": format!("{:02}:{:02}", now_local.hour(), now_local.minute()),
        },
        "period": {
            "month_label": format!("{}-{:02}", now_local.year(), now_local.month()),
            "month_start_iso": month_start.to_string(),
            "month_end_iso": month_end.to_string(),
            "days_into_month": now_local.day(),
            "days_remaining": days_remaining,
        },
        "message": {
            "channel": ctx.channel,
            "thread_id": ctx.thread_id,
            "shared_thread": ctx.shared_thread,
        },
        "runtime": {
            "engine": "hearth",
            "prompt_version": prompt_version,
            "trace_id": ctx.trace_id.to_string(),
            "user_id": principal.to_string(),
        },
    })
}
