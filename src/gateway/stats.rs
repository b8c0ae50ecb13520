use chrono::{DateTime, Utc};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct GatewayStats {
    pub started_at: DateTime<Utc>,
    pub requests_forwarded: u64,
    pub busy_rejections: u64,
    pub broadcasts_acknowledged: u64,
    pub responses_delivered: u64,
    pub delivery_failures: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub stray_frames: u64,
    pub keep_alive_probes: u64,
    pub released_on_disconnect: u64,
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            requests_forwarded: 0,
            busy_rejections: 0,
            broadcasts_acknowledged: 0,
            responses_delivered: 0,
            delivery_failures: 0,
            timeouts: 0,
            transport_errors: 0,
            stray_frames: 0,
            keep_alive_probes: 0,
            released_on_disconnect: 0,
        }
    }
}

impl GatewayStats {
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "started_at": self.started_at.to_rfc3339(),
            "uptime_seconds": self.uptime_seconds(),
            "requests_forwarded": self.requests_forwarded,
            "busy_rejections": self.busy_rejections,
            "broadcasts_acknowledged": self.broadcasts_acknowledged,
            "responses_delivered": self.responses_delivered,
            "delivery_failures": self.delivery_failures,
            "timeouts": self.timeouts,
            "transport_errors": self.transport_errors,
            "stray_frames": self.stray_frames,
            "keep_alive_probes": self.keep_alive_probes,
            "released_on_disconnect": self.released_on_disconnect,
        })
    }
}
