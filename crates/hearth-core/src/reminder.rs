//! Reminder dispatcher: a single background task that polls due reminders,
//! hands them to the outbound channel adapter, and marks them sent.
//!
//! Delivery is at-least-once; the idempotent `mark_reminder_sent` is the
//! deduplication fence. A failed delivery is simply re-discovered on the
//! next poll. Recurring reminders (a `repeat_rule` in the payload) are
//! rescheduled after a successful send.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hearth_types::error::EngineError;
use hearth_types::tool::{
    TOOL_GET_PENDING_REMINDERS, TOOL_LIST_REMINDER_USER_IDS, TOOL_MARK_REMINDER_SENT,
    TOOL_SCHEDULE_REMINDER,
};

use crate::tool::ToolClient;

/// Default poll cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound delivery adapter (external collaborator). Returns `true` when
/// the channel accepted the message.
pub trait OutboundChannel: Send + Sync {
    fn send(
        &self,
        user_id: Uuid,
        channel: Option<&str>,
        text: &str,
    ) -> impl std::future::Future<Output = Result<bool, EngineError>> + Send;
}

pub struct ReminderDispatcher<T, O> {
    tools: Arc<T>,
    outbound: Arc<O>,
    family_user_ids: Vec<Uuid>,
}

impl<T: ToolClient, O: OutboundChannel> ReminderDispatcher<T, O> {
    pub fn new(tools: Arc<T>, outbound: Arc<O>, family_user_ids: Vec<Uuid>) -> Self {
        Self {
            tools,
            outbound,
            family_user_ids,
        }
    }

    /// Poll forever at the given cadence. Individual poll failures are
    /// logged and swallowed; the loop itself never dies.
    pub async fn run(self, interval: Duration) {
        info!(interval_s = interval.as_secs(), "reminder dispatcher started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = self.poll_once().await {
                error!(error = %err, "reminder poll failed");
            }
        }
    }

    /// One poll cycle: discover candidate users, fetch their due
    /// reminders, deliver, mark, reschedule.
    pub async fn poll_once(&self) -> Result<usize, EngineError> {
        let users = self.candidate_users().await;
        if users.is_empty() {
            debug!("no reminder candidates");
            return Ok(0);
        }

        let mut delivered = 0usize;
        for user_id in users {
            let pending = match self
                .tools
                .call(TOOL_GET_PENDING_REMINDERS, json!({"user_id": user_id.to_string()}))
                .await
            {
                Ok(output) => output
                    .get("reminders")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "pending reminder fetch failed");
                    continue;
                }
            };

            for reminder in pending {
                if self.deliver_one(user_id, &reminder).await {
                    delivered += 1;
                }
            }
        }

        if delivered > 0 {
            info!(delivered, "reminder poll completed");
        }
        Ok(delivered)
    }

    /// Family principals plus everyone with an unsent reminder row.
    async fn candidate_users(&self) -> Vec<Uuid> {
        let mut users = self.family_user_ids.clone();
        match self.tools.call(TOOL_LIST_REMINDER_USER_IDS, json!({})).await {
            Ok(output) => {
                if let Some(ids) = output.get("user_ids").and_then(Value::as_array) {
                    for id in ids.iter().filter_map(Value::as_str) {
                        if let Ok(id) = Uuid::parse_str(id) {
                            if !users.contains(&id) {
                                users.push(id);
                            }
                        }
                    }
                }
            }
            Err(err) => debug!(error = %err, "reminder user discovery failed"),
        }
        users
    }

    async fn deliver_one(&self, user_id: Uuid, reminder: &Value) -> bool {
        let Some(reminder_id) = reminder.get("id").and_then(Value::as_str) else {
            warn!("reminder row without id, skipping");
            return false;
        };
        let payload = reminder.get("payload").cloned().unwrap_or(Value::Null);
        let text = payload
            .get("text")
            .or_else(|| payload.get("message"))
            .and_then(Value::as_str)
            .or_else(|| payload.as_str())
            .or_else(|| reminder.get("content").and_then(Value::as_str))
            .unwrap_or("提醒时间到了");
        let channel = reminder.get("channel").and_then(Value::as_str);

        let accepted = match self
            .outbound
            .send(user_id, channel, &format!("⏰ 提醒：{text}"))
            .await
        {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(reminder_id, error = %err, "reminder delivery failed");
                false
            }
        };
        if !accepted {
            return false;
        }

        if let Err(err) = self
            .tools
            .call(TOOL_MARK_REMINDER_SENT, json!({"id": reminder_id}))
            .await
        {
            // The next poll re-delivers; mark_reminder_sent is idempotent,
            // so the duplicate fence holds once the call goes through.
            warn!(reminder_id, error = %err, "mark_reminder_sent failed, will retry next poll");
            return true;
        }
        info!(reminder_id, user_id = %user_id, "reminder sent");

        self.reschedule_if_recurring(user_id, reminder, &payload).await;
        true
    }

    async fn reschedule_if_recurring(&self, user_id: Uuid, reminder: &Value, payload: &Value) {
        let Some(rule) = payload.get("repeat_rule") else { return };
        let Some(remind_at) = reminder
            .get("remind_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
        else {
            return;
        };
        let tz = payload.get("timezone").and_then(Value::as_str);
        let Some(next_at) = compute_next_remind_at(remind_at, rule, tz) else {
            return;
        };

        let mut next_payload = payload.clone();
        if let Some(map) = next_payload.as_object_mut() {
            map.insert("last_triggered_at".to_string(), json!(remind_at.to_rfc3339()));
        }
        let mut schedule_args = json!({
            "user_id": user_id.to_string(),
            "remind_at": next_at.to_rfc3339(),
            "payload": next_payload,
            "memory_id": reminder.get("memory_id"),
            "channel": reminder.get("channel"),
        });
        if let Some(key) = payload.get("external_key").and_then(Value::as_str) {
            schedule_args["external_key"] = json!(key);
        }

        match self.tools.call(TOOL_SCHEDULE_REMINDER, schedule_args).await {
            Ok(_) => info!(next_at = %next_at, "recurring reminder rescheduled"),
            Err(err) => warn!(error = %err, "recurring reminder reschedule failed"),
        }
    }
}

/// Compute the next occurrence for a repeat rule.
///
/// Supported: `{frequency: daily|weekly|monthly, interval?, weekday? |
/// weekdays?, day?, time?}`. Weekly rules search forward for the next
/// matching weekday; monthly rules clamp to the end of shorter months; a
/// `time: "HH:MM"` override pins the local wall-clock time.
pub fn compute_next_remind_at(
    previous: DateTime<Utc>,
    rule: &Value,
    timezone: Option<&str>,
) -> Option<DateTime<Utc>> {
    let tz: Tz = timezone.and_then(|name| name.parse().ok()).unwrap_or(chrono_tz::UTC);
    let base = previous.with_timezone(&tz);

    let interval = rule
        .get("interval")
        .and_then(Value::as_i64)
        .filter(|i| *i >= 1)
        .unwrap_or(1);
    let frequency = rule.get("frequency").and_then(Value::as_str)?.to_lowercase();

    let next_local = match frequency.as_str() {
        "daily" => base + ChronoDuration::days(interval),
        "weekly" => {
            let weekdays = normalize_weekdays(rule.get("weekday").or_else(|| rule.get("weekdays")));
            let mut candidate = base + ChronoDuration::days(1);
            let mut searched = 0i64;
            loop {
                let weekday = candidate.weekday().num_days_from_monday() as i64;
                if !weekdays.is_empty() && weekdays.contains(&weekday) {
                    break;
                }
                if weekdays.is_empty() && (candidate - base).num_days() % (7 * interval) == 0 {
                    break;
                }
                candidate += ChronoDuration::days(1);
                searched += 1;
                if searched >= 14 * interval {
                    break;
                }
            }
            candidate
        }
        "monthly" => {
            let target_day = rule
                .get("day")
                .and_then(Value::as_i64)
                .unwrap_or(base.day() as i64);
            let first = base.date_naive().with_day(1)?;
            let shifted = first.checked_add_months(Months::new(interval as u32))?;
            let last_day = shifted
                .checked_add_months(Months::new(1))
                .and_then(|d| d.pred_opt())
                .map(|d| d.day() as i64)?;
            let day = target_day.clamp(1, last_day) as u32;
            let date = shifted.with_day(day)?;
            match tz
                .with_ymd_and_hms(date.year(), date.month(), date.day(), base.hour(), base.minute(), 0)
                .earliest()
            {
                Some(dt) => dt,
                None => return None,
            }
        }
        _ => return None,
    };

    let with_override = apply_time_override(next_local, rule, tz)?;
    Some(with_override.with_timezone(&Utc))
}

fn apply_time_override(
    dt: DateTime<Tz>,
    rule: &Value,
    tz: Tz,
) -> Option<DateTime<Tz>> {
    let Some(time) = rule.get("time").and_then(Value::as_str) else {
        return Some(dt);
    };
    let mut parts = time.split(':');
    let hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = parts.next().unwrap_or("0").trim().parse().ok()?;
    tz.with_ymd_and_hms(dt.year(), dt.month(), dt.day(), hour % 24, minute % 60, 0)
        .earliest()
}

/// Map weekday descriptions (ints, names, digit strings, or lists of
/// those) to `0 = Monday .. 6 = Sunday`.
fn normalize_weekdays(value: Option<&Value>) -> Vec<i64> {
    let Some(value) = value else { return Vec::new() };
    let items: Vec<&Value> = match value {
        Value::Array(list) => list.iter().collect(),
        other => vec![other],
    };
    let mut out = Vec::new();
    for item in items {
        match item {
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    out.push(v.rem_euclid(7));
                }
            }
            Value::String(s) => {
                let key = s.trim().to_lowercase();
                if let Ok(v) = key.parse::<i64>() {
                    out.push(v.rem_euclid(7));
                } else {
                    let index = match key.as_str() {
                        "monday" => Some(0),
                        "tuesday" => Some(1),
                        "wednesday" => Some(2),
                        "thursday" => Some(3),
                        "friday" => Some(4),
                        "saturday" => Some(5),
                        "sunday" => Some(6),
                        _ => None,
                    };
                    if let Some(index) = index {
                        out.push(index);
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_types::tool::ToolSpec;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    // ------------------------------------------------------------------
    // Recurrence math
    // ------------------------------------------------------------------

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_daily_recurrence() {
        let next = compute_next_remind_at(
            utc("2025-10-18T01:00:00Z"),
            &json!({"frequency": "daily"}),
            None,
        )
        .unwrap();
        assert_eq!(next, utc("2025-10-19T01:00:00Z"));
    }

    #[test]
    fn test_daily_with_interval_and_time_override() {
        let next = compute_next_remind_at(
            utc("2025-10-18T01:00:00Z"),
            &json!({"frequency": "daily", "interval": 3, "time": "09:30"}),
            Some("Asia/Shanghai"),
        )
        .unwrap();
        // 2025-10-21 09:30 local = 01:30 UTC
        assert_eq!(next, utc("2025-10-21T01:30:00Z"));
    }

    #[test]
    fn test_weekly_by_weekday_name() {
        // 2025-10-18 is a Saturday; next Monday is the 20th.
        let next = compute_next_remind_at(
            utc("2025-10-18T08:00:00Z"),
            &json!({"frequency": "weekly", "weekday": "monday"}),
            None,
        )
        .unwrap();
        assert_eq!(next, utc("2025-10-20T08:00:00Z"));
    }

    #[test]
    fn test_weekly_without_weekdays_uses_interval() {
        let next = compute_next_remind_at(
            utc("2025-10-18T08:00:00Z"),
            &json!({"frequency": "weekly"}),
            None,
        )
        .unwrap();
        assert_eq!(next, utc("2025-10-25T08:00:00Z"));
    }

    #[test]
    fn test_monthly_clamps_to_short_month() {
        let next = compute_next_remind_at(
            utc("2025-01-31T09:00:00Z"),
            &json!({"frequency": "monthly", "day": 31}),
            None,
        )
        .unwrap();
        assert_eq!(next, utc("2025-02-28T09:00:00Z"));
    }

    #[test]
    fn test_unknown_frequency_is_none() {
        assert!(
            compute_next_remind_at(utc("2025-10-18T08:00:00Z"), &json!({"frequency": "hourly"}), None)
                .is_none()
        );
        assert!(compute_next_remind_at(utc("2025-10-18T08:00:00Z"), &json!({}), None).is_none());
    }

    #[test]
    fn test_normalize_weekdays_variants() {
        assert_eq!(normalize_weekdays(Some(&json!(2))), vec![2]);
        assert_eq!(normalize_weekdays(Some(&json!("friday"))), vec![4]);
        assert_eq!(normalize_weekdays(Some(&json!(["monday", 6, "3"]))), vec![0, 6, 3]);
        assert!(normalize_weekdays(Some(&json!("someday"))).is_empty());
        assert!(normalize_weekdays(None).is_empty());
    }

    // ------------------------------------------------------------------
    // Dispatch flow
    // ------------------------------------------------------------------

    struct FakeService {
        pending: Mutex<Vec<Value>>,
        marked: Mutex<Vec<String>>,
        scheduled: Mutex<Vec<Value>>,
    }

    impl FakeService {
        fn with_pending(pending: Vec<Value>) -> Self {
            Self {
                pending: Mutex::new(pending),
                marked: Mutex::new(Vec::new()),
                scheduled: Mutex::new(Vec::new()),
            }
        }
    }

    impl ToolClient for FakeService {
        async fn call(&self, tool: &str, call_args: Value) -> Result<Value, EngineError> {
            match tool {
                TOOL_LIST_REMINDER_USER_IDS => Ok(json!({"user_ids": []})),
                TOOL_GET_PENDING_REMINDERS => {
                    Ok(json!({"reminders": self.pending.lock().await.clone()}))
                }
                TOOL_MARK_REMINDER_SENT => {
                    let id = call_args["id"].as_str().unwrap().to_string();
                    self.marked.lock().await.push(id);
                    // Idempotent on the service side: marking twice is fine.
                    self.pending.lock().await.clear();
                    Ok(json!({"success": true}))
                }
                TOOL_SCHEDULE_REMINDER => {
                    self.scheduled.lock().await.push(call_args);
                    Ok(json!({"success": true, "id": Uuid::now_v7().to_string()}))
                }
                other => panic!("unexpected tool {other}"),
            }
        }

        async fn specs(&self) -> Result<Vec<ToolSpec>, EngineError> {
            Ok(vec![])
        }
    }

    struct FakeOutbound {
        accept: bool,
        sent: Mutex<Vec<(Uuid, String)>>,
    }

    impl FakeOutbound {
        fn accepting(accept: bool) -> Self {
            Self {
                accept,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl OutboundChannel for FakeOutbound {
        async fn send(
            &self,
            user_id: Uuid,
            _channel: Option<&str>,
            text: &str,
        ) -> Result<bool, EngineError> {
            self.sent.lock().await.push((user_id, text.to_string()));
            Ok(self.accept)
        }
    }

    fn reminder_row(id: &str, payload: Value) -> Value {
        json!({
            "id": id,
            "user_id": Uuid::now_v7().to_string(),
            "memory_id": null,
            "remind_at": "2025-10-18T01:00:00+00:00",
            "payload": payload,
            "channel": "threema",
        })
    }

    #[tokio::test]
    async fn test_poll_delivers_and_marks() {
        let user = Uuid::now_v7();
        let service = Arc::new(FakeService::with_pending(vec![reminder_row(
            "r-1",
            json!({"text": "打疫苗"}),
        )]));
        let outbound = Arc::new(FakeOutbound::accepting(true));
        let dispatcher =
            ReminderDispatcher::new(Arc::clone(&service), Arc::clone(&outbound), vec![user]);

        let delivered = dispatcher.poll_once().await.unwrap();
        assert_eq!(delivered, 1);

        let sent = outbound.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("打疫苗"));
        assert_eq!(*service.marked.lock().await, vec!["r-1".to_string()]);
        assert!(service.scheduled.lock().await.is_empty(), "one-shot reminder not rescheduled");
    }

    #[tokio::test]
    async fn test_rejected_delivery_leaves_reminder_unmarked() {
        let user = Uuid::now_v7();
        let service = Arc::new(FakeService::with_pending(vec![reminder_row(
            "r-2",
            json!({"text": "吃药"}),
        )]));
        let outbound = Arc::new(FakeOutbound::accepting(false));
        let dispatcher =
            ReminderDispatcher::new(Arc::clone(&service), Arc::clone(&outbound), vec![user]);

        let delivered = dispatcher.poll_once().await.unwrap();
        assert_eq!(delivered, 0);
        assert!(service.marked.lock().await.is_empty());

        // The next poll sees the same row again (at-least-once).
        let delivered = dispatcher.poll_once().await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(outbound.sent.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_recurring_reminder_is_rescheduled() {
        let user = Uuid::now_v7();
        let service = Arc::new(FakeService::with_pending(vec![reminder_row(
            "r-3",
            json!({
                "text": "每天喝水",
                "repeat_rule": {"frequency": "daily", "time": "09:00"},
                "timezone": "Asia/Shanghai",
                "external_key": "water-daily",
            }),
        )]));
        let outbound = Arc::new(FakeOutbound::accepting(true));
        let dispatcher =
            ReminderDispatcher::new(Arc::clone(&service), Arc::clone(&outbound), vec![user]);

        dispatcher.poll_once().await.unwrap();

        let scheduled = service.scheduled.lock().await;
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0]["external_key"], "water-daily");
        assert_eq!(scheduled[0]["payload"]["repeat_rule"]["frequency"], "daily");
        assert_eq!(
            scheduled[0]["payload"]["last_triggered_at"],
            "2025-10-18T01:00:00+00:00"
        );
        // 09:00 Asia/Shanghai next day = 01:00 UTC on the 19th.
        assert_eq!(scheduled[0]["remind_at"], "2025-10-19T01:00:00+00:00");
    }

    #[tokio::test]
    async fn test_candidate_users_deduplicate() {
        struct ListService;

        impl ToolClient for ListService {
            async fn call(&self, tool: &str, _args: Value) -> Result<Value, EngineError> {
                match tool {
                    TOOL_LIST_REMINDER_USER_IDS => Ok(json!({
                        "user_ids": ["0e0b3a1e-9d7f-5b6e-8a11-111111111111"]
                    })),
                    TOOL_GET_PENDING_REMINDERS => Ok(json!({"reminders": []})),
                    _ => Ok(json!({})),
                }
            }

            async fn specs(&self) -> Result<Vec<ToolSpec>, EngineError> {
                Ok(vec![])
            }
        }

        let known = Uuid::parse_str("0e0b3a1e-9d7f-5b6e-8a11-111111111111").unwrap();
        let dispatcher = ReminderDispatcher::new(
            Arc::new(ListService),
            Arc::new(FakeOutbound::accepting(true)),
            vec![known],
        );
        let users = dispatcher.candidate_users().await;
        let unique: HashMap<Uuid, ()> = users.iter().map(|u| (*u, ())).collect();
        assert_eq!(users.len(), unique.len());
    }
}
