use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Smallest packet size we are willing to operate with.  Anything smaller can't even carry
/// a reasonable set of options.
const MIN_PACKET_SIZE: usize = 64;

/// Timing and sizing knobs applied to an endpoint before its listener is created, and to any
/// client transport built from the same profile.
///
/// Default values come from the
/// [CoAP RFC](https://datatracker.ietf.org/doc/html/rfc7252#section-4.8.2).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingProfile {
    #[serde(with = "millis")]
    ack_timeout: Duration,
    ack_random_factor: f32,
    max_retransmit: usize,
    #[serde(with = "millis")]
    max_latency: Duration,
    #[serde(rename = "piggybackReplyMs", with = "millis")]
    piggyback_reply_delay: Duration,
    max_packet_size: usize,
    #[serde(rename = "sendAcksForNonConfirmablePackets")]
    send_acks_for_non_confirmable: bool,
}

impl Default for TimingProfile {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            max_latency: Duration::from_secs(100),
            piggyback_reply_delay: Duration::from_millis(50),
            max_packet_size: 1280,
            send_acks_for_non_confirmable: true,
        }
    }
}

impl TimingProfile {
    pub fn new(
        ack_timeout: Duration,
        ack_random_factor: f32,
        max_retransmit: usize,
    ) -> anyhow::Result<Self> {
        Self {
            ack_timeout,
            ack_random_factor,
            max_retransmit,
            ..Default::default()
        }
        .validate()
    }

    pub fn set_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    /// How long a handler may take before a Confirmable request is acknowledged with an empty
    /// ACK and the response is delivered separately.
    pub fn set_piggyback_reply_delay(mut self, delay: Duration) -> Self {
        self.piggyback_reply_delay = delay;
        self
    }

    pub fn set_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn set_send_acks_for_non_confirmable(mut self, enabled: bool) -> Self {
        self.send_acks_for_non_confirmable = enabled;
        self
    }

    /// Checks the invariants that cannot be expressed in the type system.  Profiles loaded
    /// through serde should always be passed through here.
    pub fn validate(self) -> anyhow::Result<Self> {
        let Self {
            ack_timeout,
            ack_random_factor,
            max_packet_size,
            ..
        } = self;
        if ack_random_factor < 1.0 {
            return Err(anyhow!("Invalid ack_random_factor={ack_random_factor}"));
        }
        if ack_timeout.is_zero() {
            return Err(anyhow!("Invalid ack_timeout={ack_timeout:?}"));
        }
        if max_packet_size < MIN_PACKET_SIZE {
            return Err(anyhow!("Invalid max_packet_size={max_packet_size}"));
        }
        Ok(self)
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn ack_random_factor(&self) -> f32 {
        self.ack_random_factor
    }

    pub fn max_retransmit(&self) -> usize {
        self.max_retransmit
    }

    pub fn max_latency(&self) -> Duration {
        self.max_latency
    }

    pub fn piggyback_reply_delay(&self) -> Duration {
        self.piggyback_reply_delay
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn send_acks_for_non_confirmable(&self) -> bool {
        self.send_acks_for_non_confirmable
    }

    pub fn ack_timeout_range(&self) -> RangeInclusive<Duration> {
        let timeout_low = self.ack_timeout;
        if self.ack_random_factor != 1.0 {
            let timeout_high = timeout_low.mul_f32(self.ack_random_factor);
            timeout_low..=timeout_high
        } else {
            timeout_low..=timeout_low
        }
    }

    /// MAX_TRANSMIT_SPAN from RFC 7252 section 4.8.2.
    pub fn max_transmit_span(&self) -> Duration {
        let backoff = (1u32 << self.max_retransmit.min(31)).saturating_sub(1);
        self.ack_timeout
            .saturating_mul(backoff)
            .mul_f32(self.ack_random_factor)
    }

    /// EXCHANGE_LIFETIME from RFC 7252 section 4.8.2, with PROCESSING_DELAY = ACK_TIMEOUT.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + self.max_latency * 2 + self.ack_timeout
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
