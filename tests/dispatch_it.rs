#[path = "common/fixtures.rs"]
mod fixtures;

use crossbeam::channel::{self, Receiver};
use fixtures::{stored_state, CascadeFixture};
use hacore::leader::{EQ_PREFIX, STOB_IOQ_ERROR};
use hacore::{
    CommandScheduler, DeliveryHerald, Dispatcher, EventQueue, EventQueueProcessor, EventSink,
    ExecutorLimits, HaCommand, HaError, HeraldError, KvStore, LoopbackBridge, ObjectId,
    ObjectState, RetryPolicy, SchedulerSink, SinkError, SnsAction, SnsControl, SnsKind, SnsOp,
    SnsProgress, SnsStatus, StoreExecutor, Synchronizer, WorkerPool,
};
use serde_json::json;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const REPLY_WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingSns {
    ops: Mutex<Vec<(ObjectId, SnsOp)>>,
}

impl SnsControl for RecordingSns {
    fn apply(&self, pool: ObjectId, op: SnsOp) -> Result<(), HaError> {
        self.ops.lock().push((pool, op));
        Ok(())
    }

    fn status(&self, pool: ObjectId, kind: SnsKind) -> Result<Vec<SnsProgress>, HaError> {
        let running = self
            .ops
            .lock()
            .iter()
            .any(|(seen, op)| *seen == pool && *op == SnsOp::Run(kind, SnsAction::Start));
        let status = if running {
            SnsStatus::Running
        } else {
            SnsStatus::Idle
        };
        Ok(vec![SnsProgress { fid: pool, status }])
    }
}

struct Harness {
    fixture: CascadeFixture,
    herald: Arc<DeliveryHerald>,
    bridge: Arc<LoopbackBridge>,
    sns: Arc<RecordingSns>,
    scheduler: Arc<CommandScheduler<HaCommand>>,
    dispatcher: Arc<Dispatcher>,
    pool: Option<WorkerPool<HaCommand>>,
}

impl Harness {
    fn start(delivery_timeout: Duration) -> Self {
        let mut harness = Self::idle(delivery_timeout);
        harness.start_workers();
        harness
    }

    /// Everything but the worker pool.
    fn idle(delivery_timeout: Duration) -> Self {
        let fixture = CascadeFixture::new();
        let herald = Arc::new(DeliveryHerald::new());
        let bridge = Arc::new(LoopbackBridge::start(herald.clone(), Duration::ZERO));
        let executor = Arc::new(StoreExecutor::new(
            fixture.kv.clone(),
            bridge.clone(),
            ExecutorLimits::default(),
            RetryPolicy::none(),
        ));
        let sns = Arc::new(RecordingSns::default());
        let dispatcher = Dispatcher::new(
            Arc::new(fixture.workflow()),
            executor,
            bridge.clone(),
            herald.clone(),
            delivery_timeout,
        )
        .with_sns_control(sns.clone());
        Self {
            fixture,
            herald,
            bridge,
            sns,
            scheduler: Arc::new(CommandScheduler::new()),
            dispatcher: Arc::new(dispatcher),
            pool: None,
        }
    }

    fn start_workers(&mut self) {
        let pool = WorkerPool::start(self.scheduler.clone(), self.dispatcher.clone(), 3).unwrap();
        self.pool = Some(pool);
    }

    fn sink(&self, delivery_timeout: Duration) -> SchedulerSink {
        SchedulerSink::new(self.scheduler.clone(), self.herald.clone(), delivery_timeout)
    }

    /// Queue processor over the fixture store, feeding this harness.
    fn processor(&self, delivery_timeout: Duration) -> EventQueueProcessor {
        EventQueueProcessor::new(
            self.fixture.kv.clone(),
            Arc::new(Synchronizer::new(Duration::ZERO)),
            Arc::new(self.sink(delivery_timeout)),
            RetryPolicy::none(),
            Duration::from_millis(5),
        )
    }

    fn queued(&self) -> usize {
        self.fixture.kv.get_prefix(EQ_PREFIX).unwrap().len()
    }

    fn stop(self) {
        match self.pool {
            Some(pool) => pool.shutdown(),
            None => self.scheduler.shutdown(),
        }
    }
}

fn wait_for_history(bridge: &LoopbackBridge, len: usize) {
    let started = Instant::now();
    while bridge.history().len() < len && started.elapsed() < REPLY_WAIT {
        thread::sleep(Duration::from_millis(5));
    }
}

fn reply<T>(rx: &Receiver<Result<T, HaError>>) -> Result<T, HaError> {
    rx.recv_timeout(REPLY_WAIT).expect("worker replied")
}

#[test]
fn first_entrypoint_flushes_the_process_as_failed() {
    let harness = Harness::start(REPLY_WAIT);
    let process = harness.fixture.process;
    let (tx, rx) = channel::bounded(1);
    harness.scheduler.submit(HaCommand::Entrypoint {
        process,
        first_request: true,
        reply: tx,
    });
    reply(&rx).unwrap();
    assert_eq!(harness.bridge.history(), vec![(process, ObjectState::Failed)]);

    let (tx, rx) = channel::bounded(1);
    harness.scheduler.submit(HaCommand::Entrypoint {
        process,
        first_request: false,
        reply: tx,
    });
    reply(&rx).unwrap();
    assert_eq!(harness.bridge.history().len(), 1);
    harness.stop();
}

#[test]
fn undelivered_flush_fails_the_entrypoint() {
    let harness = Harness::start(Duration::from_millis(30));
    harness.bridge.hold_deliveries(true);
    let (tx, rx) = channel::bounded(1);
    harness.scheduler.submit(HaCommand::Entrypoint {
        process: harness.fixture.process,
        first_request: true,
        reply: tx,
    });
    let err = reply(&rx).unwrap_err();
    assert!(matches!(err, HaError::Herald(HeraldError::NotDelivered { .. })));
    harness.stop();
}

#[test]
fn broadcast_then_read_back_states() {
    let harness = Harness::start(REPLY_WAIT);
    let fixture = &harness.fixture;
    let (tx, rx) = channel::bounded(1);
    harness.scheduler.submit(HaCommand::BroadcastStates {
        states: vec![(fixture.process, ObjectState::Online)],
        reply: Some(tx),
    });
    assert_eq!(reply(&rx).unwrap().len(), 5);
    assert_eq!(
        stored_state(&fixture.kv, &fixture.process_key),
        ObjectState::Online
    );

    let (tx, rx) = channel::bounded(1);
    let mut objects = vec![fixture.process];
    objects.extend(fixture.drives.iter().copied());
    harness.scheduler.submit(HaCommand::NvecGet {
        objects: objects.clone(),
        reply: tx,
    });
    let states = reply(&rx).unwrap();
    assert_eq!(
        states,
        objects
            .into_iter()
            .map(|object| (object, ObjectState::Online))
            .collect::<Vec<_>>()
    );
    harness.stop();
}

#[test]
fn rejected_broadcast_is_reported_to_the_caller() {
    let harness = Harness::start(REPLY_WAIT);
    let (tx, rx) = channel::bounded(1);
    harness.scheduler.submit(HaCommand::BroadcastStates {
        states: vec![(harness.fixture.process, ObjectState::Repair)],
        reply: Some(tx),
    });
    assert!(matches!(reply(&rx), Err(HaError::Workflow(_))));
    assert!(harness.bridge.history().is_empty());
    harness.stop();
}

#[test]
fn queue_events_reach_the_workflow_through_the_scheduler() {
    let harness = Harness::start(REPLY_WAIT);
    let sink = harness.sink(REPLY_WAIT);
    let failed = harness.fixture.drives[0];
    sink.set_states(vec![(failed, ObjectState::Failed)]).unwrap();
    assert_eq!(harness.bridge.history(), vec![(failed, ObjectState::Failed)]);
    sink.process_state(harness.fixture.process, ObjectState::Online)
        .unwrap();
    wait_for_history(&harness.bridge, 6);
    let history = harness.bridge.history();
    assert_eq!(history.len(), 6);
    assert_eq!(
        stored_state(&harness.fixture.kv, &harness.fixture.process_key),
        ObjectState::Online
    );
    harness.stop();
}

#[test]
fn queue_message_stays_until_its_broadcast_is_confirmed() {
    let mut harness = Harness::idle(REPLY_WAIT);
    let failed = harness.fixture.drives[1];
    EventQueue::new(harness.fixture.kv.clone(), RetryPolicy::none())
        .publish(STOB_IOQ_ERROR, json!({ "conf_sdev": failed.to_string() }))
        .unwrap();

    let processor = harness.processor(REPLY_WAIT);
    let draining = thread::spawn(move || processor.process_next());
    thread::sleep(Duration::from_millis(50));
    assert!(!draining.is_finished());
    assert_eq!(harness.queued(), 1);

    harness.start_workers();
    assert!(draining.join().unwrap().unwrap());
    assert_eq!(harness.queued(), 0);
    assert_eq!(harness.bridge.history(), vec![(failed, ObjectState::Failed)]);
    harness.stop();
}

#[test]
fn unconfirmed_broadcast_leaves_the_message_queued() {
    let harness = Harness::start(REPLY_WAIT);
    harness.bridge.hold_deliveries(true);
    let failed = harness.fixture.drives[0];
    EventQueue::new(harness.fixture.kv.clone(), RetryPolicy::none())
        .publish(STOB_IOQ_ERROR, json!({ "conf_sdev": failed.to_string() }))
        .unwrap();

    let err = harness
        .processor(Duration::from_millis(30))
        .process_next()
        .unwrap_err();
    assert!(matches!(err, HaError::Herald(HeraldError::NotDelivered { .. })));
    assert_eq!(harness.queued(), 1);
    harness.stop();
}

#[test]
fn sink_reports_a_stopped_scheduler() {
    let harness = Harness::start(REPLY_WAIT);
    let sink = harness.sink(REPLY_WAIT);
    let drive = harness.fixture.drives[0];
    harness.stop();
    let err = sink
        .set_states(vec![(drive, ObjectState::Failed)])
        .unwrap_err();
    assert!(matches!(err, HaError::Sink(SinkError::SchedulerClosed)));
}

#[test]
fn sink_gives_up_when_no_worker_replies() {
    let harness = Harness::idle(REPLY_WAIT);
    let sink = harness
        .sink(REPLY_WAIT)
        .with_reply_timeout(Duration::from_millis(30));
    let err = sink
        .set_states(vec![(harness.fixture.drives[0], ObjectState::Failed)])
        .unwrap_err();
    assert!(matches!(err, HaError::Sink(SinkError::ReplyTimeout(_))));
    harness.stop();
}

#[test]
fn sns_operations_go_to_the_engine_control() {
    let harness = Harness::start(REPLY_WAIT);
    let pool = ObjectId::new(0x6f00_0000_0000_0001, 1);
    let start = SnsOp::Run(SnsKind::Repair, SnsAction::Start);
    let sink = harness.sink(REPLY_WAIT);
    sink.sns_operation(pool, start).unwrap();
    sink.sns_operation(pool, SnsOp::DiskDetach).unwrap();
    let sns = harness.sns.clone();
    let started = Instant::now();
    while sns.ops.lock().len() < 2 && started.elapsed() < REPLY_WAIT {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*sns.ops.lock(), vec![(pool, start), (pool, SnsOp::DiskDetach)]);

    let (tx, rx) = channel::bounded(1);
    harness.scheduler.submit(HaCommand::SnsStatus {
        pool,
        kind: SnsKind::Repair,
        reply: tx,
    });
    assert_eq!(
        reply(&rx).unwrap(),
        vec![SnsProgress {
            fid: pool,
            status: SnsStatus::Running
        }]
    );
    harness.stop();
}
