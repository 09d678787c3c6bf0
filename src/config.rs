use std::time::Duration;

use anyhow::bail;

use crate::wsrm::spec_version::SpecVersion;


#[derive(Debug, Clone)]
pub struct RmConfig {
    /// base interval between two sends of the same unacknowledged message
    pub retransmission_interval: Duration,
    /// if true, the interval doubles with every resend, up to `max_retransmission_interval`
    pub exponential_backoff: bool,
    pub max_retransmission_interval: Duration,

    /// delay for sending an acknowledgement that can not go on a back channel. Acks for
    ///  messages arriving within this interval are coalesced into a single ack message.
    pub acknowledgement_interval: Duration,

    /// maximum age of a send task: a message that is not acknowledged within this time is
    ///  dropped and reported as failed
    pub global_timeout: Option<Duration>,
    /// maximum number of sends per message before it is dropped and reported as failed
    pub maximum_retransmission_count: Option<u32>,

    /// sequences without any activity for this long are timed out
    pub inactivity_timeout: Option<Duration>,
    /// terminated sequences are kept for reporting for this long, and then deleted
    pub sequence_removal_timeout: Option<Duration>,

    /// TerminateSequence is delayed by this so it does not overtake the final application
    ///  message / ack exchange
    pub terminate_delay: Duration,

    /// deliver messages to the application strictly in message number order
    pub invoke_in_order: bool,
    /// send TerminateSequence as soon as all messages of a sequence are acknowledged
    pub auto_terminate: bool,

    pub scheduler_tick: Duration,
    pub invoker_tick: Duration,

    pub default_spec_version: SpecVersion,
}

impl RmConfig {
    pub fn new() -> RmConfig {
        RmConfig {
            retransmission_interval: Duration::from_secs(6),
            exponential_backoff: true,
            max_retransmission_interval: Duration::from_secs(60),
            acknowledgement_interval: Duration::from_secs(3),
            global_timeout: Some(Duration::from_secs(600)),
            maximum_retransmission_count: Some(10),
            inactivity_timeout: None,
            sequence_removal_timeout: Some(Duration::from_secs(60)),
            terminate_delay: Duration::from_millis(100),
            invoke_in_order: true,
            auto_terminate: true,
            scheduler_tick: Duration::from_millis(100),
            invoker_tick: Duration::from_millis(100),
            default_spec_version: SpecVersion::V1_1,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmission_interval.is_zero() {
            bail!("retransmission interval must be positive");
        }
        if self.max_retransmission_interval < self.retransmission_interval {
            bail!("max retransmission interval must not be smaller than the retransmission interval");
        }
        if self.scheduler_tick.is_zero() || self.invoker_tick.is_zero() {
            bail!("worker ticks must be positive");
        }
        if self.maximum_retransmission_count == Some(0) {
            bail!("maximum retransmission count must allow at least one send");
        }
        Ok(())
    }

    /// The delay until the next send of a message that was sent `sent_count` times. This is
    ///  monotonically non-decreasing in `sent_count`.
    pub fn retransmission_delay(&self, sent_count: u32) -> Duration {
        if !self.exponential_backoff || sent_count <= 1 {
            return self.retransmission_interval;
        }

        let factor = 1u32.checked_shl(sent_count - 1).unwrap_or(u32::MAX);
        self.retransmission_interval
            .checked_mul(factor)
            .unwrap_or(self.max_retransmission_interval)
            .min(self.max_retransmission_interval)
    }
}

impl Default for RmConfig {
    fn default() -> Self {
        RmConfig::new()
    }
}
