use chrono::Utc;

pub struct PulseTime;

impl PulseTime {
    /// Unix time in milliseconds.
    pub fn now() -> u64 {
        Utc::now().timestamp_millis() as u64
    }
}
