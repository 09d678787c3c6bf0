use std::sync::Arc;

use tokio::select;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::collaborators::DeliveryFailure;
use crate::context::RmContext;
use crate::lifecycle::SequenceLifecycle;
use crate::outbound::{build_outbound, mark_sent};
use crate::polling::{poll_target, schedule_poll};
use crate::store::records::{SendTask, TaskKind};


/// The background worker that sends what is due: first sends, retransmissions, scheduled acks
///  and protocol messages. It also expires tasks and sequences that ran into a timeout.
pub struct RetransmissionScheduler {
    ctx: Arc<RmContext>,
    lifecycle: Arc<SequenceLifecycle>,
}

impl RetransmissionScheduler {
    pub fn new(ctx: Arc<RmContext>, lifecycle: Arc<SequenceLifecycle>) -> RetransmissionScheduler {
        RetransmissionScheduler { ctx, lifecycle }
    }

    pub async fn run(&self, mut cancel: broadcast::Receiver<()>) {
        info!("starting retransmission scheduler");
        let mut ticks = time::interval(self.ctx.config.scheduler_tick);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => {}
                _ = cancel.recv() => {
                    info!("shutting down retransmission scheduler");
                    break;
                }
            }

            if let Err(e) = self.tick(Instant::now()).await {
                error!(error = ?e, "error in scheduler tick");
            }
        }
    }

    /// One pass over everything that is due. Returns the number of messages handed to the
    ///  transport.
    pub async fn tick(&self, now: Instant) -> anyhow::Result<usize> {
        let mut due = self.ctx.storage.send_tasks.find(&|t| t.is_due(now))?;
        due.sort_by_key(|t| (t.next_send_time, t.message_number));

        let mut num_sent = 0;
        for task in due {
            match self.process_task(&task.message_id, now).await {
                Ok(true) => num_sent += 1,
                Ok(false) => {}
                Err(e) => warn!("error sending task {}: {}", task.message_id, e),
            }
        }

        self.check_timeouts(now).await?;
        self.schedule_polls(now)?;
        Ok(num_sent)
    }

    async fn process_task(&self, message_id: &str, now: Instant) -> anyhow::Result<bool> {
        let Some(task) = self.ctx.storage.send_tasks.get(&message_id.to_string())? else {
            return Ok(false);
        };

        let guard = self.ctx.registry.lock_for_task(&task).await;

        // re-read under the lock: the task may have been acknowledged or rescheduled meanwhile
        let Some(task) = self.ctx.storage.send_tasks.get(&message_id.to_string())? else {
            trace!("task {} is gone", message_id);
            return Ok(false);
        };
        if !task.is_due(now) {
            return Ok(false);
        }

        if let Some(reason) = self.expiry_reason(&task, now) {
            drop(guard);
            self.expire(task, &reason).await?;
            return Ok(false);
        }

        let Some(message) = build_outbound(&self.ctx, &task).await? else {
            debug!("task {} can not be sent any more - dropping it", task.message_id);
            self.ctx.storage.delete_send_task(&task.message_id)?;
            return Ok(false);
        };

        trace!("sending {:?} task {} to {} (send #{})", task.kind, task.message_id, task.destination, task.sent_count + 1);
        if let Err(e) = self.ctx.transport.send(&task.destination, message).await {
            warn!(to = ?task.destination, kind = ?task.kind, error = ?e, "failed to send task {}", task.message_id);
        }
        mark_sent(&self.ctx, &task, now)?;
        Ok(true)
    }

    fn expiry_reason(&self, task: &SendTask, now: Instant) -> Option<String> {
        if !task.resend {
            return None;
        }
        if let Some(max_count) = self.ctx.config.maximum_retransmission_count {
            if task.sent_count >= max_count {
                return Some(format!("no acknowledgement after {} sends", task.sent_count));
            }
        }
        if let Some(timeout) = self.ctx.config.global_timeout {
            if now.duration_since(task.created_at) > timeout {
                return Some(format!("no acknowledgement within {:?}", timeout));
            }
        }
        None
    }

    async fn expire(&self, task: SendTask, reason: &str) -> anyhow::Result<()> {
        match task.kind {
            TaskKind::CreateSequence => {
                self.lifecycle.fail_sending_sequence(&task.sequence_ref, &format!("sequence creation failed: {}", reason)).await?;
            }
            TaskKind::TerminateSequence => {
                debug!("TerminateSequence for {} was never confirmed: {}", task.sequence_ref, reason);
                let _guard = self.ctx.registry.lock_sending(&task.sequence_ref).await;
                self.ctx.registry.cleanup_sending(&task.sequence_ref, Instant::now())?;
            }
            TaskKind::Application => {
                if self.ctx.storage.delete_send_task(&task.message_id)?.is_some() {
                    warn!("giving up on message #{:?} of {}: {}", task.message_number, task.sequence_ref, reason);
                    self.ctx.listener.on_delivery_failure(DeliveryFailure {
                        internal_sequence_id: task.sequence_ref.clone(),
                        message_number: task.message_number,
                        reason: reason.to_string(),
                    }).await;
                }
            }
            _ => {
                debug!("giving up on {:?} task {}: {}", task.kind, task.message_id, reason);
                self.ctx.storage.delete_send_task(&task.message_id)?;
            }
        }
        Ok(())
    }

    /// Times out idle sequences and removes terminated sequences for good once the removal
    ///  timeout has passed
    async fn check_timeouts(&self, now: Instant) -> anyhow::Result<()> {
        let config = self.ctx.config.clone();

        if let Some(inactivity_timeout) = config.inactivity_timeout {
            let idle_sending = self.ctx.storage.sending.find(&|s| !s.is_terminated() && now.duration_since(s.last_activity) > inactivity_timeout)?;
            for sequence in idle_sending {
                self.lifecycle.fail_sending_sequence(&sequence.internal_id, "sequence timed out").await?;
            }

            let idle_receiving = self.ctx.storage.receiving.find(&|s| !s.is_terminated() && now.duration_since(s.last_activity) > inactivity_timeout)?;
            for sequence in idle_receiving {
                info!("receiving sequence {} timed out", sequence.wire_id);
                let _guard = self.ctx.registry.lock_receiving(&sequence.wire_id).await;
                self.ctx.registry.cleanup_receiving(&sequence.wire_id, now)?;
            }
        }

        if let Some(removal_timeout) = config.sequence_removal_timeout {
            let expired = |terminated_at: Option<Instant>| terminated_at.map(|t| now.duration_since(t) > removal_timeout).unwrap_or(false);

            for sequence in self.ctx.storage.sending.find(&|s| s.is_terminated() && expired(s.terminated_at))? {
                let _guard = self.ctx.registry.lock_sending(&sequence.internal_id).await;
                self.ctx.registry.remove_sending(&sequence.internal_id)?;
            }
            for sequence in self.ctx.storage.receiving.find(&|s| s.is_terminated() && expired(s.terminated_at))? {
                let _guard = self.ctx.registry.lock_receiving(&sequence.wire_id).await;
                self.ctx.registry.remove_receiving(&sequence.wire_id)?;
            }
        }
        Ok(())
    }

    /// receiving sequences in polling mode get a poll every retransmission interval
    fn schedule_polls(&self, now: Instant) -> anyhow::Result<()> {
        for sequence in self.ctx.storage.receiving.find(&|s| s.polling_mode && !s.is_terminated())? {
            if let Some(target) = poll_target(&self.ctx, &sequence)? {
                schedule_poll(&self.ctx, &sequence.wire_id, &target, now + self.ctx.config.retransmission_interval)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::rstest;

    use super::*;
    use crate::registry::tests::{receiving_sequence, sending_sequence};
    use crate::test_util::listener::RecordingListener;
    use crate::test_util::test_context_with_listener;
    use crate::test_util::transport::TrackingTransport;
    use crate::wsrm::endpoint::EndpointAddr;
    use crate::wsrm::message::RmMessageKind;

    struct Setup {
        ctx: Arc<RmContext>,
        transport: Arc<TrackingTransport>,
        listener: Arc<RecordingListener>,
        scheduler: RetransmissionScheduler,
    }

    fn setup(configure: impl FnOnce(&mut crate::config::RmConfig)) -> Setup {
        let transport = Arc::new(TrackingTransport::new());
        let listener = Arc::new(RecordingListener::default());
        let mut ctx = test_context_with_listener(transport.clone(), listener.clone());
        let mut config = (*ctx.config).clone();
        configure(&mut config);
        ctx.config = Arc::new(config);
        let ctx = Arc::new(ctx);

        let lifecycle = Arc::new(SequenceLifecycle::new(ctx.clone()));
        let scheduler = RetransmissionScheduler::new(ctx.clone(), lifecycle);
        Setup { ctx, transport, listener, scheduler }
    }

    async fn with_messages(ctx: &RmContext, num_messages: u64) {
        ctx.registry.insert_sending(sending_sequence("s", Some("w"))).unwrap();
        for _ in 0..num_messages {
            ctx.registry.allocate_message("s", Bytes::from_static(b"x"), false, Instant::now()).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_and_backs_off() {
        let s = setup(|_| {});
        with_messages(&s.ctx, 2).await;

        assert_eq!(s.scheduler.tick(Instant::now()).await.unwrap(), 2);
        let sent = s.transport.take_sent();
        assert_eq!(sent.iter().map(|(_, m)| m.headers.sequence.as_ref().unwrap().message_number).collect::<Vec<_>>(), vec![1, 2]);
        assert!(sent.iter().all(|(to, _)| to == &EndpointAddr::new("http://peer")));

        // nothing is due before the retransmission interval passed
        assert_eq!(s.scheduler.tick(Instant::now()).await.unwrap(), 0);
        time::advance(s.ctx.config.retransmission_interval).await;
        assert_eq!(s.scheduler.tick(Instant::now()).await.unwrap(), 2);
        let resent = s.transport.take_sent();
        assert!(resent.iter().all(|(_, m)| !m.headers.ack_requests.is_empty()));

        // the second resend comes after twice the interval
        time::advance(s.ctx.config.retransmission_interval).await;
        assert_eq!(s.scheduler.tick(Instant::now()).await.unwrap(), 0);
        time::advance(s.ctx.config.retransmission_interval).await;
        assert_eq!(s.scheduler.tick(Instant::now()).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_task_is_not_resent() {
        let s = setup(|_| {});
        with_messages(&s.ctx, 2).await;
        s.scheduler.tick(Instant::now()).await.unwrap();
        s.transport.take_sent();

        let task = s.ctx.registry.sending_tasks("s", None).unwrap()
            .into_iter()
            .find(|t| t.message_number == Some(1))
            .unwrap();
        s.ctx.storage.delete_send_task(&task.message_id).unwrap();

        time::advance(s.ctx.config.retransmission_interval).await;
        s.scheduler.tick(Instant::now()).await.unwrap();
        let resent = s.transport.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].1.headers.sequence.as_ref().unwrap().message_number, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_is_retried() {
        let s = setup(|_| {});
        with_messages(&s.ctx, 1).await;
        s.transport.set_failing(true);

        s.scheduler.tick(Instant::now()).await.unwrap();
        assert_eq!(s.transport.take_sent().len(), 1);
        assert_eq!(s.ctx.registry.sending_tasks("s", None).unwrap()[0].sent_count, 1);

        s.transport.set_failing(false);
        time::advance(s.ctx.config.retransmission_interval).await;
        s.scheduler.tick(Instant::now()).await.unwrap();
        assert_eq!(s.transport.take_sent().len(), 1);
    }

    #[rstest]
    #[case::max_count(Some(2), None, 3)]
    #[case::global_timeout(None, Some(Duration::from_secs(10)), 3)]
    #[tokio::test(start_paused = true)]
    async fn test_expired_message_is_reported(#[case] max_count: Option<u32>, #[case] global_timeout: Option<Duration>, #[case] num_ticks: u32) {
        let s = setup(|c| {
            c.maximum_retransmission_count = max_count;
            c.global_timeout = global_timeout;
            c.exponential_backoff = false;
        });
        with_messages(&s.ctx, 1).await;

        for _ in 0..num_ticks {
            s.scheduler.tick(Instant::now()).await.unwrap();
            time::advance(s.ctx.config.retransmission_interval).await;
        }

        assert!(s.ctx.registry.sending_tasks("s", None).unwrap().is_empty());
        let failures = s.listener.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].internal_sequence_id, "s");
        assert_eq!(failures[0].message_number, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_task_is_sent_once() {
        let s = setup(|_| {});
        let mut seq = receiving_sequence("r");
        seq.received.insert_range(1, 4);
        s.ctx.registry.insert_receiving(seq).unwrap();
        let mut task = SendTask::new(TaskKind::Ack, "r", EndpointAddr::new("http://peer"), Instant::now());
        task.resend = false;
        s.ctx.storage.send_tasks.insert(task).unwrap();

        s.scheduler.tick(Instant::now()).await.unwrap();
        let acks = s.transport.sent_of_kind(RmMessageKind::Ack);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].headers.acks[0].ranges, vec![crate::wsrm::elements::AckRange::new(1, 4)]);
        assert!(s.ctx.storage.send_tasks.find(&|_| true).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unestablished_tasks_wait() {
        let s = setup(|_| {});
        s.ctx.registry.insert_sending(sending_sequence("s", None)).unwrap();
        s.ctx.registry.allocate_message("s", Bytes::new(), false, Instant::now()).await.unwrap();

        assert_eq!(s.scheduler.tick(Instant::now()).await.unwrap(), 0);
        s.transport.assert_no_remaining_messages();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_and_removal() {
        let s = setup(|c| {
            c.inactivity_timeout = Some(Duration::from_secs(30));
            c.sequence_removal_timeout = Some(Duration::from_secs(60));
        });
        with_messages(&s.ctx, 1).await;
        s.ctx.registry.insert_receiving(receiving_sequence("r")).unwrap();

        time::advance(Duration::from_secs(31)).await;
        s.scheduler.tick(Instant::now()).await.unwrap();
        assert!(s.ctx.registry.sending("s").unwrap().unwrap().is_terminated());
        assert!(s.ctx.registry.receiving("r").unwrap().unwrap().is_terminated());
        assert_eq!(s.listener.failures().len(), 2);

        time::advance(Duration::from_secs(61)).await;
        s.scheduler.tick(Instant::now()).await.unwrap();
        assert!(s.ctx.registry.sending("s").unwrap().is_none());
        assert!(s.ctx.registry.receiving("r").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_1_0_completes_on_send() {
        let s = setup(|_| {});
        let mut seq = sending_sequence("s", Some("w"));
        seq.version = crate::wsrm::spec_version::SpecVersion::V1_0;
        s.ctx.registry.insert_sending(seq).unwrap();
        let lifecycle = SequenceLifecycle::new(s.ctx.clone());
        lifecycle.request_termination("s").await.unwrap();

        assert_eq!(s.scheduler.tick(Instant::now()).await.unwrap(), 0);
        time::advance(s.ctx.config.terminate_delay).await;
        assert_eq!(s.scheduler.tick(Instant::now()).await.unwrap(), 1);

        assert_eq!(s.transport.sent_of_kind(RmMessageKind::TerminateSequence).len(), 1);
        assert!(s.ctx.registry.sending("s").unwrap().unwrap().is_terminated());
    }
}
