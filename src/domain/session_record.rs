//! Payment session record for reconciliation egress

use crate::domain::types::epoch_ms;
use serde::Serialize;
use smallvec::SmallVec;
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Terminal state of a payment session
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum SessionOutcome {
    InProgress,
    Completed,
    Cancelled,
}

impl SessionOutcome {
    #[inline]
    pub fn as_str(&self) -> &str {
        match self {
            SessionOutcome::InProgress => "in_progress",
            SessionOutcome::Completed => "completed",
            SessionOutcome::Cancelled => "cancelled",
        }
    }
}

/// Event types recorded inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventType {
    Started,
    Coin,
    Bill,
    StopRequested,
    ChangeDispensed,
    ChangeFault,
    Cancelled,
}

impl SessionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventType::Started => "started",
            SessionEventType::Coin => "coin",
            SessionEventType::Bill => "bill",
            SessionEventType::StopRequested => "stop",
            SessionEventType::ChangeDispensed => "change",
            SessionEventType::ChangeFault => "change_fault",
            SessionEventType::Cancelled => "cancelled",
        }
    }
}

/// A single event in a session history
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub t: SessionEventType,
    pub amount: Option<u32>,   // pesos involved, if any
    pub ts: u64,               // epoch ms
    pub extra: Option<String>, // additional data
}

impl SessionEvent {
    pub fn new(event_type: SessionEventType) -> Self {
        Self { t: event_type, amount: None, ts: epoch_ms(), extra: None }
    }

    pub fn with_amount(mut self, amount: u32) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_extra(mut self, extra: &str) -> Self {
        self.extra = Some(extra.to_string());
        self
    }

    fn to_json_value(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("t".to_string(), serde_json::Value::String(self.t.as_str().to_string()));
        if let Some(amount) = self.amount {
            obj.insert("a".to_string(), serde_json::Value::Number(amount.into()));
        }
        obj.insert("ts".to_string(), serde_json::Value::Number(self.ts.into()));
        if let Some(x) = &self.extra {
            obj.insert("x".to_string(), serde_json::Value::String(x.clone()));
        }
        serde_json::Value::Object(obj)
    }
}

/// Complete record of one payment session, written to egress on stop
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub sid: String, // UUIDv7 session ID
    pub required: u32,
    pub coin_total: u32,
    pub bill_total: u32,
    pub change_requested: u32,
    pub change_dispensed: u32,
    pub outcome: SessionOutcome,
    pub status_text: String,
    pub started_at: u64,       // epoch ms
    pub ended_at: Option<u64>, // epoch ms
    pub events: SmallVec<[SessionEvent; 8]>,
}

impl SessionRecord {
    pub fn new(required: u32) -> Self {
        let mut record = Self {
            sid: new_uuid_v7(),
            required,
            coin_total: 0,
            bill_total: 0,
            change_requested: 0,
            change_dispensed: 0,
            outcome: SessionOutcome::InProgress,
            status_text: String::new(),
            started_at: epoch_ms(),
            ended_at: None,
            events: SmallVec::new(),
        };
        record.add_event(SessionEvent::new(SessionEventType::Started).with_amount(required));
        record
    }

    pub fn add_event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub fn collected(&self) -> u32 {
        self.coin_total + self.bill_total
    }

    /// Mark the record terminal
    pub fn complete(&mut self, outcome: SessionOutcome, status_text: &str) {
        self.outcome = outcome;
        self.status_text = status_text.to_string();
        self.ended_at = Some(epoch_ms());
    }

    /// Convert to short-key JSON string (without site)
    pub fn to_json(&self) -> String {
        self.to_json_with_site_opt(None)
    }

    /// Convert to short-key JSON string with site_id included
    pub fn to_json_with_site(&self, site_id: &str) -> String {
        self.to_json_with_site_opt(Some(site_id))
    }

    fn to_json_with_site_opt(&self, site_id: Option<&str>) -> String {
        let mut obj = serde_json::Map::new();

        if let Some(site) = site_id {
            obj.insert("site".to_string(), serde_json::Value::String(site.to_string()));
        }

        obj.insert("sid".to_string(), serde_json::Value::String(self.sid.clone()));
        obj.insert("req".to_string(), serde_json::Value::Number(self.required.into()));
        obj.insert("coins".to_string(), serde_json::Value::Number(self.coin_total.into()));
        obj.insert("bills".to_string(), serde_json::Value::Number(self.bill_total.into()));
        obj.insert("collected".to_string(), serde_json::Value::Number(self.collected().into()));
        obj.insert(
            "change_req".to_string(),
            serde_json::Value::Number(self.change_requested.into()),
        );
        obj.insert(
            "change_out".to_string(),
            serde_json::Value::Number(self.change_dispensed.into()),
        );
        obj.insert("out".to_string(), serde_json::Value::String(self.outcome.as_str().to_string()));
        if !self.status_text.is_empty() {
            obj.insert("status".to_string(), serde_json::Value::String(self.status_text.clone()));
        }
        obj.insert("t0".to_string(), serde_json::Value::Number(self.started_at.into()));
        if let Some(ended) = self.ended_at {
            obj.insert("t1".to_string(), serde_json::Value::Number(ended.into()));
        }

        let events: Vec<serde_json::Value> =
            self.events.iter().map(|e| e.to_json_value()).collect();
        obj.insert("ev".to_string(), serde_json::Value::Array(events));

        serde_json::Value::Object(obj).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record() {
        let record = SessionRecord::new(50);

        assert!(!record.sid.is_empty());
        assert_eq!(record.required, 50);
        assert_eq!(record.collected(), 0);
        assert_eq!(record.outcome, SessionOutcome::InProgress);
        assert!(record.ended_at.is_none());
        // Start event is recorded automatically
        assert_eq!(record.events.len(), 1);
        assert_eq!(record.events[0].t, SessionEventType::Started);
    }

    #[test]
    fn test_session_event_builders() {
        let event = SessionEvent::new(SessionEventType::Coin)
            .with_amount(5)
            .with_extra("denom=5");

        assert_eq!(event.t, SessionEventType::Coin);
        assert_eq!(event.amount, Some(5));
        assert_eq!(event.extra, Some("denom=5".to_string()));
    }

    #[test]
    fn test_record_to_json() {
        let mut record = SessionRecord::new(42);
        record.coin_total = 45;
        record.change_requested = 3;
        record.change_dispensed = 3;
        record.add_event(SessionEvent::new(SessionEventType::Coin).with_amount(10));
        record.add_event(
            SessionEvent::new(SessionEventType::ChangeDispensed)
                .with_amount(3)
                .with_extra("fives=0 ones=3"),
        );
        record.complete(SessionOutcome::Completed, "Change dispensed: 3");

        let json = record.to_json_with_site("kiosk-7");
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["site"], "kiosk-7");
        assert_eq!(parsed["req"], 42);
        assert_eq!(parsed["coins"], 45);
        assert_eq!(parsed["collected"], 45);
        assert_eq!(parsed["change_req"], 3);
        assert_eq!(parsed["change_out"], 3);
        assert_eq!(parsed["out"], "completed");
        assert_eq!(parsed["status"], "Change dispensed: 3");

        let events = parsed["ev"].as_array().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["t"], "started");
        assert_eq!(events[1]["t"], "coin");
        assert_eq!(events[1]["a"], 10);
        assert_eq!(events[2]["x"], "fives=0 ones=3");
    }

    #[test]
    fn test_cancelled_record_omits_status_when_empty() {
        let mut record = SessionRecord::new(0);
        record.complete(SessionOutcome::Cancelled, "");

        let parsed: serde_json::Value = serde_json::from_str(&record.to_json()).unwrap();
        assert_eq!(parsed["out"], "cancelled");
        assert!(parsed.get("status").is_none());
        assert!(parsed.get("site").is_none());
    }

    #[test]
    fn test_uuid_v7_generation() {
        let a = new_uuid_v7();
        let b = new_uuid_v7();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
