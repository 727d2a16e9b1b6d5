use super::{CommandScheduler, Schedulable};
use crate::util::HaError;
use log::{debug, error, info, warn};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Work performed for one taken command.
pub trait CommandHandler<P>: Send + Sync {
    fn handle(&self, payload: &P) -> Result<(), HaError>;
}

/// Fixed set of threads draining a [`CommandScheduler`].
pub struct WorkerPool<P> {
    scheduler: Arc<CommandScheduler<P>>,
    workers: Vec<JoinHandle<()>>,
}

impl<P: Schedulable + 'static> WorkerPool<P> {
    pub fn start<H>(
        scheduler: Arc<CommandScheduler<P>>,
        handler: Arc<H>,
        threads: usize,
    ) -> io::Result<Self>
    where
        H: CommandHandler<P> + 'static,
    {
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let scheduler = scheduler.clone();
            let handler = handler.clone();
            let worker = thread::Builder::new()
                .name(format!("ha-worker-{index}"))
                .spawn(move || worker_loop(index, &scheduler, handler.as_ref()))?;
            workers.push(worker);
        }
        info!("event=worker_pool_started threads={}", threads);
        Ok(Self { scheduler, workers })
    }

    pub fn scheduler(&self) -> &Arc<CommandScheduler<P>> {
        &self.scheduler
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wakes every worker with a poison and waits for all of them.
    pub fn shutdown(self) {
        self.scheduler.shutdown();
        self.join();
    }

    /// Waits for the workers without shutting the scheduler down; they exit
    /// once each has taken a submitted poison.
    pub fn join(self) {
        for worker in self.workers {
            let name = worker.thread().name().unwrap_or("ha-worker").to_string();
            if worker.join().is_err() {
                error!("event=worker_panicked worker={}", name);
            }
        }
    }
}

fn worker_loop<P, H>(index: usize, scheduler: &CommandScheduler<P>, handler: &H)
where
    P: Schedulable,
    H: CommandHandler<P> + ?Sized,
{
    loop {
        let assignment = scheduler.take();
        let Some(payload) = assignment.payload() else {
            debug!("event=worker_poisoned worker={}", index);
            break;
        };
        let kind = payload.kind();
        match handler.handle(payload) {
            Ok(()) => debug!(
                "event=command_done worker={} seq={} group={} kind={}",
                index,
                assignment.seq(),
                assignment.group(),
                kind
            ),
            Err(err) => warn!(
                "event=command_failed worker={} seq={} group={} kind={} error={}",
                index,
                assignment.seq(),
                assignment.group(),
                kind,
                err
            ),
        }
    }
}
