use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::select;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::context::RmContext;
use crate::store::records::InvocationTask;
use crate::wsrm::message::RmBody;


/// Hands stored inbound messages to the application in strict message number order, one
///  sequence at a time. A message is delivered once its predecessor was delivered, so a gap
///  holds back everything after it until the missing message arrives.
pub struct InOrderInvoker {
    ctx: Arc<RmContext>,
}

impl InOrderInvoker {
    pub fn new(ctx: Arc<RmContext>) -> InOrderInvoker {
        InOrderInvoker { ctx }
    }

    pub async fn run(&self, mut cancel: broadcast::Receiver<()>) {
        info!("starting in-order invoker");
        let mut ticks = time::interval(self.ctx.config.invoker_tick);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => {}
                _ = self.ctx.invoker_wakeup.notified() => {}
                _ = cancel.recv() => {
                    info!("shutting down in-order invoker");
                    break;
                }
            }

            if let Err(e) = self.invoke_ready().await {
                error!(error = ?e, "error invoking messages");
            }
        }
    }

    /// Delivers everything that is ready, returning the number of delivered messages. The
    ///  invocation tasks are read once per pass: tasks added meanwhile wake the invoker up again.
    pub async fn invoke_ready(&self) -> anyhow::Result<usize> {
        let mut by_sequence: BTreeMap<String, BTreeMap<u64, InvocationTask>> = BTreeMap::new();
        for task in self.ctx.storage.invocation_tasks.find(&|_| true)? {
            by_sequence.entry(task.sequence_id.clone())
                .or_default()
                .insert(task.message_number, task);
        }

        let mut num_invoked = 0;
        for (sequence_id, tasks) in by_sequence {
            num_invoked += self.invoke_sequence(&sequence_id, tasks).await?;
        }
        Ok(num_invoked)
    }

    async fn invoke_sequence(&self, sequence_id: &str, mut tasks: BTreeMap<u64, InvocationTask>) -> anyhow::Result<usize> {
        let _guard = self.ctx.registry.lock_receiving(sequence_id).await;

        let Some(sequence) = self.ctx.registry.receiving(sequence_id)? else {
            warn!("invocation tasks for unknown sequence {} - discarding them", sequence_id);
            for task in tasks.into_values() {
                self.ctx.storage.invocation_tasks.delete(&task.message_key)?;
                self.ctx.storage.remove_message(&task.message_key)?;
            }
            return Ok(0);
        };

        let mut next = sequence.next_to_invoke;
        let mut num_invoked = 0;
        while let Some(task) = tasks.remove(&next) {
            match self.ctx.storage.retrieve_message(&task.message_key)? {
                Some(message) => match message.body {
                    RmBody::Application(payload) => {
                        debug!("invoking message #{} of {}", next, sequence_id);
                        self.ctx.listener.on_sequence_message(sequence_id, next, payload).await;
                    }
                    _ => {
                        trace!("message #{} of {} has no payload", next, sequence_id);
                    }
                }
                None => warn!("stored message #{} of {} is missing - skipping it", next, sequence_id),
            }

            self.ctx.storage.invocation_tasks.delete(&task.message_key)?;
            self.ctx.storage.remove_message(&task.message_key)?;
            self.ctx.storage.receiving.modify(&sequence_id.to_string(), &mut |s| s.next_to_invoke = next + 1)?;
            next += 1;
            num_invoked += 1;
        }

        if num_invoked == 0 {
            trace!("message #{} of {} is not there yet", next, sequence_id);
        }
        Ok(num_invoked)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::runtime::Builder;

    use super::*;
    use crate::collaborators::NoSecurity;
    use crate::registry::tests::receiving_sequence;
    use crate::store::in_memory::tests::InstrumentedTable;
    use crate::store::StorageManager;
    use crate::test_util::listener::RecordingListener;
    use crate::test_util::{test_config, test_context_with_listener};
    use crate::test_util::transport::TrackingTransport;
    use crate::wsrm::elements::SequenceHeader;
    use crate::wsrm::message::RmMessage;
    use crate::wsrm::spec_version::SpecVersion;

    fn add_message(ctx: &RmContext, sequence_id: &str, message_number: u64) {
        let mut message = RmMessage::new(SpecVersion::V1_1, RmBody::Application(Bytes::from(format!("{}", message_number))));
        message.headers.sequence = Some(SequenceHeader { identifier: sequence_id.to_string(), message_number, last_message: false });
        let message_key = ctx.storage.store_message(message).unwrap();
        ctx.storage.invocation_tasks.insert(InvocationTask {
            message_key,
            sequence_id: sequence_id.to_string(),
            message_number,
        }).unwrap();
    }

    fn setup() -> (Arc<RmContext>, Arc<RecordingListener>, InOrderInvoker) {
        let listener = Arc::new(RecordingListener::default());
        let ctx = Arc::new(test_context_with_listener(Arc::new(TrackingTransport::new()), listener.clone()));
        ctx.registry.insert_receiving(receiving_sequence("a")).unwrap();
        ctx.registry.insert_receiving(receiving_sequence("b")).unwrap();
        (ctx.clone(), listener, InOrderInvoker::new(ctx))
    }

    #[tokio::test]
    async fn test_gap_holds_back() {
        let (ctx, listener, invoker) = setup();
        add_message(&ctx, "a", 2);
        add_message(&ctx, "a", 3);

        assert_eq!(invoker.invoke_ready().await.unwrap(), 0);
        assert!(listener.messages().is_empty());

        add_message(&ctx, "a", 1);
        assert_eq!(invoker.invoke_ready().await.unwrap(), 3);
        assert_eq!(listener.message_numbers("a"), vec![1, 2, 3]);
        assert_eq!(ctx.registry.receiving("a").unwrap().unwrap().next_to_invoke, 4);
        assert!(ctx.storage.invocation_tasks.find(&|_| true).unwrap().is_empty());
        assert!(ctx.storage.messages.find(&|_| true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequences_are_independent() {
        let (ctx, listener, invoker) = setup();
        add_message(&ctx, "a", 2);
        add_message(&ctx, "b", 1);
        add_message(&ctx, "b", 2);

        invoker.invoke_ready().await.unwrap();
        assert_eq!(listener.message_numbers("a"), Vec::<u64>::new());
        assert_eq!(listener.message_numbers("b"), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_tasks_of_unknown_sequence_are_discarded() {
        let (ctx, listener, invoker) = setup();
        add_message(&ctx, "gone", 1);

        invoker.invoke_ready().await.unwrap();
        assert!(listener.messages().is_empty());
        assert!(ctx.storage.invocation_tasks.find(&|_| true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_scan_per_pass() {
        let invocation_tasks = Arc::new(InstrumentedTable::<InvocationTask>::default());
        let mut storage = StorageManager::in_memory();
        storage.invocation_tasks = invocation_tasks.clone();
        let listener = Arc::new(RecordingListener::default());
        let ctx = Arc::new(RmContext::new(Arc::new(test_config()), Arc::new(storage), Arc::new(TrackingTransport::new()), Arc::new(NoSecurity {}), listener.clone()));
        ctx.registry.insert_receiving(receiving_sequence("a")).unwrap();
        ctx.registry.insert_receiving(receiving_sequence("b")).unwrap();
        for n in 1..=5 {
            add_message(&ctx, "a", n);
            add_message(&ctx, "b", n);
        }
        invocation_tasks.take_num_finds();

        let invoker = InOrderInvoker::new(ctx.clone());
        assert_eq!(invoker.invoke_ready().await.unwrap(), 10);
        assert_eq!(invocation_tasks.take_num_finds(), 1);
        assert_eq!(listener.message_numbers("a"), vec![1, 2, 3, 4, 5]);
        assert_eq!(listener.message_numbers("b"), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_run_is_woken_up() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (ctx, listener, invoker) = setup();
            let (cancel_sender, cancel_receiver) = broadcast::channel(1);
            let handle = tokio::spawn(async move { invoker.run(cancel_receiver).await });

            add_message(&ctx, "a", 1);
            ctx.invoker_wakeup.notify_one();
            time::sleep(Duration::from_millis(1)).await;
            assert_eq!(listener.message_numbers("a"), vec![1]);

            cancel_sender.send(()).unwrap();
            handle.await.unwrap();
        });
    }
}
