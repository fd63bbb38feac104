// Event dispatcher and worker pool.
//
// One delivery loop pulls events from the source, turns them into tasks and
// pushes them onto a bounded queue; a fixed pool of workers drains the queue
// into the coordinator. The queue is sized from the disk budget, and a full
// queue stalls the delivery loop, which stalls the source.

pub mod requeue;

use std::sync::Arc;

use repomirror_common::event::task::{TaskGenerator, TaskOutcome};
use repomirror_common::event::InboundEvent;
use repomirror_common::types::SyncTask;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use self::requeue::{FailureSink, ForwardOutcome};
use crate::coordinator::RepoSyncer;
use crate::error::{SyncError, SyncOutcome};
use crate::retry::RetryPolicy;
use crate::source::{DeliveryAck, EventSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    /// Pulling deliveries; workers started.
    Running,
    /// Shutdown requested: no new deliveries, workers finishing the queue.
    Draining,
    Stopped,
}

/// A queued unit of work. The original event travels with the task so the
/// failure path can send it back unchanged.
#[derive(Debug)]
struct QueuedTask {
    task: SyncTask,
    event: InboundEvent,
}

type SharedQueue = Arc<Mutex<mpsc::Receiver<QueuedTask>>>;

/// Upper bound on queue size and worker count.
pub const MAX_CAPACITY: usize = 1024;

pub struct Dispatcher<S, F> {
    generator: TaskGenerator,
    syncer: Arc<S>,
    failures: Arc<F>,
    capacity: usize,
    forward_retry: RetryPolicy,
    state: watch::Sender<DispatcherState>,
}

impl<S: RepoSyncer, F: FailureSink> Dispatcher<S, F> {
    /// `capacity` is both the queue size and the worker count, clamped to
    /// `1..=MAX_CAPACITY`.
    pub fn new(
        generator: TaskGenerator,
        syncer: S,
        failures: F,
        capacity: usize,
        forward_retry: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            generator,
            syncer: Arc::new(syncer),
            failures: Arc::new(failures),
            capacity: capacity.clamp(1, MAX_CAPACITY),
            forward_retry,
            state,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped) or the
    /// source is exhausted, then drain the queue and join every worker.
    pub async fn run<Src: EventSource>(self, mut source: Src, mut shutdown: watch::Receiver<bool>) {
        let (queue_tx, queue_rx) = mpsc::channel::<QueuedTask>(self.capacity);
        let queue: SharedQueue = Arc::new(Mutex::new(queue_rx));

        let mut workers = JoinSet::new();
        for worker in 0..self.capacity {
            workers.spawn(worker_loop(
                worker,
                Arc::clone(&queue),
                Arc::clone(&self.syncer),
                Arc::clone(&self.failures),
                self.forward_retry,
            ));
        }
        self.state.send_replace(DispatcherState::Running);
        info!(capacity = self.capacity, "dispatcher running");

        loop {
            let mut delivery = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                next = source.next_delivery() => match next {
                    Some(delivery) => delivery,
                    None => {
                        info!("event source exhausted");
                        break;
                    }
                },
            };

            let task = match self.generator.generate(&delivery.event) {
                Ok(TaskOutcome::Task(task)) => task,
                Ok(TaskOutcome::Ignored { event_type }) => {
                    debug!(%event_type, "ignoring non-push event");
                    delivery.acknowledge(DeliveryAck::Ignored);
                    continue;
                }
                Err(error) => {
                    warn!(error = %error, "rejecting invalid event");
                    delivery.acknowledge(DeliveryAck::Rejected(error.to_string()));
                    continue;
                }
            };

            // Blocks while the queue is full; that is the backpressure.
            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    delivery.acknowledge(DeliveryAck::ShuttingDown);
                    break;
                }
                permit = queue_tx.reserve() => permit,
            };
            let Ok(permit) = permit else {
                delivery.acknowledge(DeliveryAck::ShuttingDown);
                break;
            };

            debug!(repo = %task, "task queued");
            permit.send(QueuedTask { task, event: delivery.event.clone() });
            delivery.acknowledge(DeliveryAck::Queued);
        }

        self.state.send_replace(DispatcherState::Draining);
        info!("dispatcher draining");
        // Unsubscribe, then close the queue so idle workers see the end.
        drop(source);
        drop(queue_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                error!(error = %error, "sync worker aborted");
            }
        }
        self.state.send_replace(DispatcherState::Stopped);
        info!("dispatcher stopped");
    }
}

/// Resolves once shutdown is requested. A dropped sender counts as a request.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn worker_loop<S: RepoSyncer, F: FailureSink>(
    worker: usize,
    queue: SharedQueue,
    syncer: Arc<S>,
    failures: Arc<F>,
    forward_retry: RetryPolicy,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(queued) = next else {
            debug!(worker, "queue closed; worker exiting");
            return;
        };

        let span = info_span!(
            "repomirror.sync",
            worker,
            owner = %queued.task.owner,
            repo_id = %queued.task.repo_id,
        );
        process(&*syncer, &*failures, forward_retry, queued).instrument(span).await;
    }
}

async fn process<S: RepoSyncer, F: FailureSink>(
    syncer: &S,
    failures: &F,
    forward_retry: RetryPolicy,
    queued: QueuedTask,
) {
    let error = match syncer.sync_repo(&queued.task).await {
        Ok(SyncOutcome::Synced { commit }) => {
            debug!(%commit, "task done");
            return;
        }
        Ok(outcome) => {
            debug!(?outcome, "task done without changes");
            return;
        }
        Err(error) => error,
    };

    handle_failure(failures, forward_retry, &queued, &error).await;
}

async fn handle_failure<F: FailureSink>(
    failures: &F,
    forward_retry: RetryPolicy,
    queued: &QueuedTask,
    error: &SyncError,
) {
    if !error.is_retryable() {
        error!(kind = error.kind(), error = %error, "sync failed permanently; dropping event");
        return;
    }
    warn!(kind = error.kind(), error = %error, "sync failed; sending event back");

    let forwarded =
        forward_retry.run("forward failed event", || failures.forward(&queued.event)).await;
    match forwarded {
        Ok(ForwardOutcome::Forwarded { resend_count }) => {
            info!(resend_count, "event forwarded for redelivery");
        }
        Ok(ForwardOutcome::DeadLettered { resend_count }) => {
            error!(repo = %queued.task, resend_count, "resend budget exhausted; event dead-lettered");
        }
        Err(forward_error) => {
            error!(repo = %queued.task, error = %forward_error, "failed to forward event; it is lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::requeue::ForwardError;
    use crate::source::{channel_source, EventSender};
    use repomirror_common::event::{
        HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_RESEND_COUNT, HEADER_USER_AGENT,
    };
    use repomirror_common::manifest::ManifestError;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    const AGENT: &str = "gitlab-hook";

    type Verdict = Box<dyn Fn(&SyncTask) -> Result<SyncOutcome, SyncError> + Send + Sync>;

    /// Each sync waits for one gate permit, then answers with `verdict`.
    struct GatedSyncer {
        gate: Arc<Semaphore>,
        started: Arc<StdMutex<Vec<String>>>,
        finished: Arc<StdMutex<Vec<String>>>,
        verdict: Verdict,
    }

    impl RepoSyncer for GatedSyncer {
        async fn sync_repo(&self, task: &SyncTask) -> Result<SyncOutcome, SyncError> {
            self.started.lock().expect("started lock").push(task.repo_id.clone());
            self.gate.acquire().await.expect("gate open").forget();
            self.finished.lock().expect("finished lock").push(task.repo_id.clone());
            (self.verdict)(task)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        forwarded: Arc<StdMutex<Vec<u32>>>,
    }

    impl FailureSink for RecordingSink {
        async fn forward(&self, event: &InboundEvent) -> Result<ForwardOutcome, ForwardError> {
            let resend_count = event.resend_count() + 1;
            self.forwarded.lock().expect("forwarded lock").push(resend_count);
            Ok(ForwardOutcome::Forwarded { resend_count })
        }
    }

    struct Harness {
        sender: EventSender,
        shutdown: watch::Sender<bool>,
        state: watch::Receiver<DispatcherState>,
        gate: Arc<Semaphore>,
        started: Arc<StdMutex<Vec<String>>>,
        finished: Arc<StdMutex<Vec<String>>>,
        sink: RecordingSink,
        run: tokio::task::JoinHandle<()>,
    }

    fn start(capacity: usize, verdict: Verdict) -> Harness {
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(StdMutex::new(Vec::new()));
        let finished = Arc::new(StdMutex::new(Vec::new()));
        let sink = RecordingSink::default();
        let syncer = GatedSyncer {
            gate: Arc::clone(&gate),
            started: Arc::clone(&started),
            finished: Arc::clone(&finished),
            verdict,
        };
        let dispatcher = Dispatcher::new(
            TaskGenerator::new(AGENT),
            syncer,
            sink.clone(),
            capacity,
            RetryPolicy::immediate(1),
        );
        let state = dispatcher.state();
        let (sender, source) = channel_source(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(dispatcher.run(source, shutdown_rx));
        Harness { sender, shutdown, state, gate, started, finished, sink, run }
    }

    fn ok_verdict() -> Verdict {
        Box::new(|task| Ok(SyncOutcome::Synced { commit: format!("c-{}", task.repo_id) }))
    }

    #[test]
    fn capacity_is_clamped_into_range() {
        let build = |capacity| {
            let syncer = GatedSyncer {
                gate: Arc::new(Semaphore::new(0)),
                started: Arc::default(),
                finished: Arc::default(),
                verdict: ok_verdict(),
            };
            Dispatcher::new(
                TaskGenerator::new(AGENT),
                syncer,
                RecordingSink::default(),
                capacity,
                RetryPolicy::immediate(1),
            )
            .capacity()
        };
        assert_eq!(build(0), 1);
        assert_eq!(build(8), 8);
        assert_eq!(build(usize::MAX), MAX_CAPACITY);
    }

    fn push(repo_id: u64) -> InboundEvent {
        push_with(repo_id, AGENT, None)
    }

    fn push_with(repo_id: u64, agent: &str, resend: Option<&str>) -> InboundEvent {
        let mut headers = vec![
            (HEADER_USER_AGENT, agent),
            (HEADER_EVENT_TYPE, "Push Hook"),
            (HEADER_EVENT_ID, "9f6c1d9e-0000-4000-8000-000000000001"),
        ];
        if let Some(count) = resend {
            headers.push((HEADER_RESEND_COUNT, count));
        }
        let body = format!(
            r#"{{"object_kind":"push","project_id":{repo_id},"project":{{"path_with_namespace":"alice/proj{repo_id}"}}}}"#
        );
        InboundEvent::new(headers, body.into_bytes())
    }

    async fn wait_for_started(harness: &Harness, count: usize) {
        while harness.started.lock().expect("started lock").len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn acks_reflect_task_generation() {
        let harness = start(1, ok_verdict());
        let tag_push = InboundEvent::new(
            [(HEADER_USER_AGENT, AGENT), (HEADER_EVENT_TYPE, "Tag Push Hook"), (HEADER_EVENT_ID, "id")],
            b"{}".to_vec(),
        );

        assert_eq!(harness.sender.deliver(tag_push).await, DeliveryAck::Ignored);
        assert!(matches!(
            harness.sender.deliver(push_with(1, "curl/8.0", None)).await,
            DeliveryAck::Rejected(_)
        ));
        assert_eq!(harness.sender.deliver(push(1)).await, DeliveryAck::Queued);

        harness.gate.add_permits(1);
        harness.shutdown.send_replace(true);
        harness.run.await.expect("dispatcher run");
        assert_eq!(*harness.finished.lock().expect("finished lock"), vec!["1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_until_one_task_is_consumed() {
        let harness = start(1, ok_verdict());

        // One task in the worker, one in the queue.
        assert_eq!(harness.sender.deliver(push(1)).await, DeliveryAck::Queued);
        wait_for_started(&harness, 1).await;
        assert_eq!(harness.sender.deliver(push(2)).await, DeliveryAck::Queued);

        let third = {
            let sender = harness.sender.clone();
            tokio::spawn(async move { sender.deliver(push(3)).await })
        };
        let fourth = {
            let sender = harness.sender.clone();
            tokio::spawn(async move { sender.deliver(push(4)).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!third.is_finished());
        assert!(!fourth.is_finished());

        // One consumed item admits exactly one blocked producer.
        harness.gate.add_permits(1);
        wait_for_started(&harness, 2).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(third.is_finished() as u8 + fourth.is_finished() as u8, 1);

        harness.gate.add_permits(3);
        assert_eq!(third.await.expect("third"), DeliveryAck::Queued);
        assert_eq!(fourth.await.expect("fourth"), DeliveryAck::Queued);
        harness.shutdown.send_replace(true);
        harness.run.await.expect("dispatcher run");
        assert_eq!(harness.finished.lock().expect("finished lock").len(), 4);
    }

    #[tokio::test]
    async fn failed_tasks_are_forwarded_and_final_failures_dropped() {
        let verdict: Verdict = Box::new(|task| match task.repo_id.as_str() {
            "1" => Err(SyncError::Busy { repo: task.storage_path() }),
            _ => Err(SyncError::Manifest(ManifestError::Traversal { line: 1, path: "../x".into() })),
        });
        let harness = start(2, verdict);
        harness.gate.add_permits(2);

        assert_eq!(harness.sender.deliver(push_with(1, AGENT, Some("2"))).await, DeliveryAck::Queued);
        assert_eq!(harness.sender.deliver(push(2)).await, DeliveryAck::Queued);
        harness.shutdown.send_replace(true);
        harness.run.await.expect("dispatcher run");

        assert_eq!(*harness.sink.forwarded.lock().expect("forwarded lock"), vec![3]);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_tasks_then_stops() {
        let harness = start(1, ok_verdict());
        let mut state = harness.state.clone();
        state.wait_for(|s| *s == DispatcherState::Running).await.expect("running");

        assert_eq!(harness.sender.deliver(push(1)).await, DeliveryAck::Queued);
        wait_for_started(&harness, 1).await;
        assert_eq!(harness.sender.deliver(push(2)).await, DeliveryAck::Queued);

        harness.shutdown.send_replace(true);
        state.wait_for(|s| *s == DispatcherState::Draining).await.expect("draining");
        assert_eq!(harness.sender.deliver(push(3)).await, DeliveryAck::ShuttingDown);

        harness.gate.add_permits(2);
        harness.run.await.expect("dispatcher run");
        assert_eq!(*harness.state.borrow(), DispatcherState::Stopped);
        assert_eq!(
            *harness.finished.lock().expect("finished lock"),
            vec!["1".to_string(), "2".to_string()]
        );
    }

    #[tokio::test]
    async fn exhausted_source_stops_the_dispatcher() {
        let harness = start(1, ok_verdict());
        harness.gate.add_permits(1);
        assert!(harness.sender.publish(push(7)).await);

        let Harness { sender, run, finished, state, .. } = harness;
        drop(sender);
        run.await.expect("dispatcher run");

        assert_eq!(*state.borrow(), DispatcherState::Stopped);
        assert_eq!(*finished.lock().expect("finished lock"), vec!["7".to_string()]);
    }
}
