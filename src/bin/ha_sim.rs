use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossbeam::channel::{self, Receiver};
use env_logger::Env;
use hacore::leader::{DEVICE_STATE_SET, SNS_OP, STOB_IOQ_ERROR};
use hacore::{
    CommandScheduler, DeliveryHerald, Dispatcher, EventQueue, EventQueueProcessor, HaCommand,
    HaConfig, HaError, KvStore, KvTopology, LeaderMonitor, LoopbackBridge, MemoryKv, ObjectId,
    ObjectKind, ObjectState, ObjectWorkflow, PersistedRecord, SchedulerSink, SnsKind,
    StoreExecutor, Synchronizer, WorkerPool,
};
use log::info;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Runs the HA core against an in-memory store and a loopback bridge.
#[derive(Parser, Debug, Clone)]
struct Cli {
    /// Path to the HA configuration YAML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node name to run as (overrides the config)
    #[arg(long)]
    node: Option<String>,

    /// Number of storage processes to simulate
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    processes: u64,

    /// Drives under each service
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    drives: u64,

    /// env_logger-style filter string (e.g. "info,hacore=debug"); overrides RUST_LOG/defaults
    #[arg(long)]
    log_filter: Option<String>,
}

const DEFAULT_LOG_FILTER: &str = "info,hacore=info";
const SERVICES_PER_PROCESS: u64 = 2;
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const SIM_POOL_TAG: u64 = 0x6f00_0000_0000_0000;

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_millis();
    builder.format(|buf, record| {
        let ts = buf.timestamp();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

/// Seeds one node with `processes` processes, two services each and
/// `drives` drives per service, everything transient. Drive `n` sits on
/// block device `/dev/vd<n>`.
fn seed_cluster(kv: &MemoryKv, node: &str, processes: u64, drives: u64) -> Vec<ObjectId> {
    let transient = PersistedRecord::new(ObjectState::Transient);
    let mut roots = Vec::new();
    let mut next_key = 1u64;
    for p in 0..processes {
        let process = ObjectId::of(ObjectKind::Process, 0x100 + p);
        let pkey = format!("m0conf/nodes/{node}/processes/{process}");
        kv.insert(
            &pkey,
            transient
                .clone()
                .with_field("name", format!("m0d-{p}"))
                .to_json(),
        );
        for _ in 0..SERVICES_PER_PROCESS {
            let service = ObjectId::of(ObjectKind::Service, next_key);
            next_key += 1;
            let skey = format!("{pkey}/services/{service}");
            kv.insert(&skey, transient.clone().with_field("type", "ios").to_json());
            for _ in 0..drives {
                let drive = ObjectId::of(ObjectKind::Drive, next_key);
                next_key += 1;
                kv.insert(
                    &format!("{skey}/sdevs/{drive}"),
                    transient
                        .clone()
                        .with_field("path", device_path(drive))
                        .to_json(),
                );
            }
        }
        roots.push(process);
    }
    roots
}

fn device_path(drive: ObjectId) -> String {
    format!("/dev/vd{}", drive.key)
}

fn await_reply<T>(rx: &Receiver<Result<T, HaError>>, what: &str) -> Result<T> {
    rx.recv_timeout(REPLY_TIMEOUT)
        .with_context(|| format!("no reply to {what}"))?
        .map_err(|err| anyhow!("{what} failed: {err}"))
}

fn wait_for_empty_queue(kv: &MemoryKv, deadline: Duration) -> Result<()> {
    let started = Instant::now();
    while !kv.get_prefix(hacore::leader::EQ_PREFIX)?.is_empty() {
        if started.elapsed() > deadline {
            bail!("event queue not drained after {:?}", deadline);
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());
    let mut config = match &cli.config {
        Some(path) => HaConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HaConfig {
            leader_settle_ms: 100,
            queue_poll_ms: 50,
            leader_poll_ms: 50,
            ..HaConfig::default()
        },
    };
    if let Some(node) = cli.node {
        config.node_name = node;
    }
    config.validate()?;
    info!(
        "event=ha_sim_starting node={} workers={}",
        config.node_name, config.worker_threads
    );

    let kv = Arc::new(MemoryKv::with_tx_limit(config.kv_tx_limit));
    let processes = seed_cluster(&kv, &config.node_name, cli.processes, cli.drives);
    kv.create_session("sim-session", &config.node_name);
    kv.acquire(hacore::leader::LEADER_KEY, &config.node_name, "sim-session");
    let store: Arc<dyn KvStore> = kv.clone();

    let herald = Arc::new(DeliveryHerald::with_unsorted_ttl(config.unsorted_ttl()));
    let bridge = Arc::new(LoopbackBridge::start(herald.clone(), Duration::from_millis(2)));
    let workflow = Arc::new(ObjectWorkflow::new(
        store.clone(),
        Arc::new(KvTopology::new(config.ha_process)),
    ));
    let executor = Arc::new(StoreExecutor::new(
        store.clone(),
        bridge.clone(),
        config.executor_limits(),
        config.store_retry(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        workflow,
        executor,
        bridge.clone(),
        herald.clone(),
        config.delivery_timeout(),
    ));
    let scheduler = Arc::new(CommandScheduler::<HaCommand>::new());
    let pool = WorkerPool::start(scheduler.clone(), dispatcher, config.worker_threads)?;

    let gate = Arc::new(Synchronizer::new(config.leader_settle()));
    let monitor = LeaderMonitor::new(
        store.clone(),
        gate.clone(),
        config.node_name.clone(),
        config.leader_poll(),
    )
    .spawn()?;
    let processor = EventQueueProcessor::new(
        store.clone(),
        gate.clone(),
        Arc::new(SchedulerSink::new(
            scheduler.clone(),
            herald.clone(),
            config.delivery_timeout(),
        )),
        config.store_retry(),
        config.queue_poll(),
    )
    .spawn()?;

    for process in &processes {
        let (tx, rx) = channel::bounded(1);
        scheduler.submit(HaCommand::Entrypoint {
            process: *process,
            first_request: true,
            reply: tx,
        });
        await_reply(&rx, "entrypoint")?;

        for target in [ObjectState::Recovering, ObjectState::Online] {
            let (tx, rx) = channel::bounded(1);
            scheduler.submit(HaCommand::BroadcastStates {
                states: vec![(*process, target)],
                reply: Some(tx),
            });
            let ids = await_reply(&rx, "broadcast_states")?;
            info!(
                "event=ha_sim_process_moved process={} state={} messages={}",
                process,
                target,
                ids.len()
            );
        }
    }

    let victim = ObjectId::of(ObjectKind::Drive, 2);
    let queue = EventQueue::new(store.clone(), config.store_retry());
    let pool_id = ObjectId::new(SIM_POOL_TAG, 1);
    let events = [
        (STOB_IOQ_ERROR, json!({ "conf_sdev": victim.to_string() })),
        (
            DEVICE_STATE_SET,
            json!({ "node": config.node_name, "device": device_path(victim), "state": "repair" }),
        ),
        (SNS_OP, json!({ "op_name": "repair-start", "fid": pool_id.to_string() })),
    ];
    for (message_type, payload) in events {
        let offset = queue.publish(message_type, payload)?;
        info!(
            "event=ha_sim_published offset={} message_type={}",
            offset, message_type
        );
    }
    wait_for_empty_queue(&kv, Duration::from_secs(10))?;

    let (tx, rx) = channel::bounded(1);
    scheduler.submit(HaCommand::SnsStatus {
        pool: pool_id,
        kind: SnsKind::Repair,
        reply: tx,
    });
    for progress in await_reply(&rx, "sns_status")? {
        info!(
            "event=ha_sim_repair_status pool={} status={}",
            progress.fid,
            serde_json::to_string(&progress.status)?
        );
    }

    let (tx, rx) = channel::bounded(1);
    scheduler.submit(HaCommand::NvecGet {
        objects: processes.iter().copied().chain([victim]).collect(),
        reply: tx,
    });
    for (object, state) in await_reply(&rx, "nvec_get")? {
        info!("event=ha_sim_state object={} state={}", object, state);
    }

    gate.stop();
    pool.shutdown();
    for (name, handle) in [("leader-monitor", monitor), ("eq-processor", processor)] {
        if handle.join().is_err() {
            bail!("{name} thread panicked");
        }
    }
    bridge.close();
    info!(
        "event=ha_sim_done broadcasts={} transactions={}",
        bridge.history().len(),
        kv.transactions()
    );
    Ok(())
}
