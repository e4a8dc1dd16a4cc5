use std::cmp::Ordering;

use meridian_types::PeerId;
use tokio::time::Instant;

/// Samples kept for the rolling speed and request-time averages.
pub const RECORD_WINDOW: usize = 3;

/// Speed assumed for a peer before it has served anything, in KB/s.
pub const INITIAL_SPEED: f32 = 100.0 * 1024.0;

/// How desirable a peer is as a sync source.
///
/// The weight is the average observed speed plus the average time since the
/// last few requests, so fast peers we have not asked recently come first.
#[derive(Clone, Debug)]
pub struct NodeWeight {
    id: PeerId,
    speed: [f32; RECORD_WINDOW],
    req_time: [Instant; RECORD_WINDOW],
    timeout_cnt: u32,
    error_resp_cnt: u32,
}

impl NodeWeight {
    pub fn new(id: PeerId, now: Instant) -> Self {
        Self {
            id,
            speed: [INITIAL_SPEED; RECORD_WINDOW],
            req_time: [now; RECORD_WINDOW],
            timeout_cnt: 0,
            error_resp_cnt: 0,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn timeout_cnt(&self) -> u32 {
        self.timeout_cnt
    }

    pub fn error_resp_cnt(&self) -> u32 {
        self.error_resp_cnt
    }

    pub fn add_timeout(&mut self) {
        self.timeout_cnt += 1;
    }

    pub fn add_error_resp(&mut self) {
        self.error_resp_cnt += 1;
    }

    pub fn append_req_time(&mut self, now: Instant) {
        self.req_time.rotate_left(1);
        self.req_time[RECORD_WINDOW - 1] = now;
    }

    /// Record a transfer speed in KB/s, dropping the oldest sample.
    pub fn append_speed(&mut self, speed: f32) {
        self.speed.rotate_left(1);
        self.speed[RECORD_WINDOW - 1] = speed;
    }

    pub fn weight(&self, now: Instant) -> f32 {
        let avg_speed = self.speed.iter().sum::<f32>() / RECORD_WINDOW as f32;
        let avg_interval = self
            .req_time
            .iter()
            .map(|t| now.saturating_duration_since(*t).as_millis() as f32)
            .sum::<f32>()
            / RECORD_WINDOW as f32;
        avg_speed + avg_interval
    }

    /// Best first: higher weight, then fewer errors, then fewer timeouts.
    /// The id breaks remaining ties so the order is stable.
    pub fn rank(&self, other: &Self, now: Instant) -> Ordering {
        other
            .weight(now)
            .total_cmp(&self.weight(now))
            .then(self.error_resp_cnt.cmp(&other.error_resp_cnt))
            .then(self.timeout_cnt.cmp(&other.timeout_cnt))
            .then(self.id.cmp(&other.id))
    }
}
