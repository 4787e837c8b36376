use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::FailoverEvent;

// -----------------------------------------------------------------------------
// Channels / Streams
// -----------------------------------------------------------------------------

pub const CHANNEL_FAILOVER_EVENTS: &str = "failover_events";

// -----------------------------------------------------------------------------
// Failover domain events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum FailoverEventType {
    #[serde(rename = "EVT:FAILOVER")]
    Failover,
    #[serde(rename = "EVT:FAILBACK")]
    Failback,
}

impl FailoverEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverEventType::Failover => "EVT:FAILOVER",
            FailoverEventType::Failback => "EVT:FAILBACK",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FailoverEventEnvelope {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: FailoverEventType,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub source: String,
}

impl FailoverEventEnvelope {
    pub fn new(event_type: FailoverEventType, payload: serde_json::Value, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            occurred_at: Utc::now(),
            payload,
            source: source.to_string(),
        }
    }

    pub fn from_event(evt: &FailoverEvent, source: &str) -> Self {
        let event_type = match evt.reason {
            crate::FailoverReason::GpuRecovered => FailoverEventType::Failback,
            _ => FailoverEventType::Failover,
        };
        let payload = serde_json::to_value(evt).unwrap_or(serde_json::Value::Null);
        Self {
            occurred_at: evt.at,
            ..Self::new(event_type, payload, source)
        }
    }
}
