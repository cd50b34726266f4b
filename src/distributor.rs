use super::{
    errors::{AbortReason, JobError},
    job::{JobCore, QueuedJob},
    model::{JobStatus, PoolMetrics},
    pool::Config,
    worker::{Worker, WorkerId},
};
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};


/// Сообщения дистрибьютору. Только он владеет очередью и наборами воркеров.
pub(crate) enum Command {
    Enqueue(QueuedJob),
    Nudge,
    WorkerFinished(WorkerId),
    WorkerExited { worker: WorkerId, panicked: bool },
    Shutdown,
}


/// Счётчики, которые дистрибьютор публикует для `metrics()` и `join_all()`
#[derive(Default)]
pub(crate) struct PoolCounters {
    pub(crate) busy_workers: AtomicUsize,
    pub(crate) free_workers: AtomicUsize,
    pub(crate) queued_jobs: AtomicUsize,
    pub(crate) live_threads: AtomicUsize,
    pub(crate) total_enqueued: AtomicUsize,
    pub(crate) completed_jobs: AtomicUsize,
    pub(crate) failed_jobs: AtomicUsize,
    pub(crate) aborted_jobs: AtomicUsize,
    pub(crate) workers_created: AtomicUsize,
    pub(crate) workers_retired: AtomicUsize,
    pub(crate) workers_abandoned: AtomicUsize,
    pub(crate) peak_workers: AtomicUsize,
    outstanding: Mutex<usize>,
    drained: Condvar,
}

impl PoolCounters {
    pub(crate) fn snapshot(&self) -> PoolMetrics {
        PoolMetrics {
            busy_workers: self.busy_workers.load(Ordering::Relaxed),
            free_workers: self.free_workers.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            live_threads: self.live_threads.load(Ordering::Relaxed),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            completed_jobs: self.completed_jobs.load(Ordering::Relaxed),
            failed_jobs: self.failed_jobs.load(Ordering::Relaxed),
            aborted_jobs: self.aborted_jobs.load(Ordering::Relaxed),
            workers_created: self.workers_created.load(Ordering::Relaxed),
            workers_retired: self.workers_retired.load(Ordering::Relaxed),
            workers_abandoned: self.workers_abandoned.load(Ordering::Relaxed),
            peak_workers: self.peak_workers.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn job_accepted(&self) {
        *self.outstanding.lock() += 1;
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.queued_jobs.fetch_add(1, Ordering::Relaxed);
    }

    /// Откат `job_accepted`, если команду не удалось отправить
    pub(crate) fn job_rejected(&self) {
        self.total_enqueued.fetch_sub(1, Ordering::Relaxed);
        self.queued_jobs.fetch_sub(1, Ordering::Relaxed);
        self.finish_one();
    }

    fn job_dequeued(&self) {
        self.queued_jobs.fetch_sub(1, Ordering::Relaxed);
    }

    fn job_settled(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Completed => &self.completed_jobs,
            JobStatus::Failed => &self.failed_jobs,
            _ => &self.aborted_jobs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.finish_one();
    }

    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }

    /// Ждёт, пока все принятые задачи не получат терминальный статус
    pub(crate) fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut outstanding, deadline).timed_out() {
                        return *outstanding == 0;
                    }
                }
                None => self.drained.wait(&mut outstanding),
            }
        }
        true
    }
}


pub(crate) struct DistributorHandle {
    thread: thread::JoinHandle<()>,
    stopped: Receiver<()>,
}

impl DistributorHandle {
    #[inline]
    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread.thread().id()
    }

    /// Ограниченное ожидание остановки. Зависший дистрибьютор отсоединяется.
    pub(crate) fn join_timeout(self, timeout: Duration) -> bool {
        match self.stopped.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                // Disconnected без сигнала значит, что поток умер до конца teardown
                if self.thread.join().is_err() {
                    warn!("distributor thread panicked");
                    return false;
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "distributor did not stop in time, detaching it");
                false
            }
        }
    }
}


pub(crate) fn spawn(
    config: Config,
    commands: Receiver<Command>,
    events: Sender<Command>,
    counters: Arc<PoolCounters>,
) -> io::Result<DistributorHandle> {
    let (stopped_tx, stopped_rx) = bounded(1);
    let thread = thread::Builder::new()
        .name(format!("{}-distributor", config.thread_name))
        .spawn(move || {
            let mut distributor = Distributor::new(config, commands, events, counters);
            distributor.run();
            let _ = stopped_tx.send(());
        })?;

    Ok(DistributorHandle {
        thread,
        stopped: stopped_rx,
    })
}


enum Verdict {
    Finished,
    Lost(Arc<JobCore>),
    Overdue(Arc<JobCore>),
    AbortRequested,
    Expired(Arc<JobCore>),
    Running,
}


struct Distributor {
    config: Config,
    commands: Receiver<Command>,
    events: Sender<Command>,
    counters: Arc<PoolCounters>,
    queue: VecDeque<QueuedJob>,
    busy: HashMap<WorkerId, Worker>,
    free: Vec<Worker>,
    next_worker_id: WorkerId,
    shutting_down: bool,
}

impl Distributor {
    fn new(
        config: Config,
        commands: Receiver<Command>,
        events: Sender<Command>,
        counters: Arc<PoolCounters>,
    ) -> Self {
        Self {
            config,
            commands,
            events,
            counters,
            queue: VecDeque::new(),
            busy: HashMap::new(),
            free: Vec::new(),
            next_worker_id: 0,
            shutting_down: false,
        }
    }

    fn run(&mut self) {
        info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "distributor started",
        );
        self.prestart();

        loop {
            match self.commands.recv_timeout(self.config.poll_interval) {
                Ok(cmd) => self.handle(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while !self.shutting_down {
                match self.commands.try_recv() {
                    Ok(cmd) => self.handle(cmd),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
            if self.shutting_down {
                break;
            }
            self.pass(Instant::now());
        }

        self.teardown();
        info!("distributor stopped");
    }

    fn pass(&mut self, now: Instant) {
        self.drop_aborted_head();
        self.sweep(now);
        self.dispatch(now);
        self.reclaim_idle(now);
        self.publish();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue(job) => {
                if self.shutting_down {
                    self.counters.job_dequeued();
                    job.core.abort(JobStatus::AbortedBeforeStart, JobError::AbortedBeforeStart);
                    self.record(&job.core);
                } else {
                    self.queue.push_back(job);
                }
            }
            Command::Nudge => {}
            Command::WorkerFinished(id) => {
                if let Some(worker) = self.busy.get_mut(&id) {
                    if let Some(core) = worker.release() {
                        self.record(&core);
                    }
                }
            }
            Command::WorkerExited { worker, panicked } => {
                if let Some(w) = self.busy.get_mut(&worker) {
                    w.mark_exited();
                } else if let Some(pos) = self.free.iter().position(|w| w.id() == worker) {
                    warn!(worker, panicked, "idle worker exited unexpectedly");
                    let w = self.free.remove(pos);
                    w.retire();
                }
            }
            Command::Shutdown => self.shutting_down = true,
        }
    }

    fn record(&self, core: &JobCore) {
        if !core.status().is_terminal() {
            core.abort(
                JobStatus::AbortedDuringExecution,
                JobError::AbortedDuringExecution(AbortReason::WorkerLost),
            );
        }
        self.counters.job_settled(core.status());
    }

    #[inline]
    fn total_workers(&self) -> usize {
        self.busy.len() + self.free.len()
    }

    fn create_worker(&mut self) -> Worker {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        self.counters.workers_created.fetch_add(1, Ordering::Relaxed);
        self.counters
            .peak_workers
            .fetch_max(self.total_workers() + 1, Ordering::Relaxed);
        debug!(worker = id, total = self.total_workers() + 1, "creating worker");

        Worker::new(
            id,
            self.config.thread_name.clone(),
            self.config.stack_size,
            self.events.clone(),
            self.counters.clone(),
        )
    }

    fn prestart(&mut self) {
        for _ in 0..self.config.min_workers {
            let mut worker = self.create_worker();
            match worker.start() {
                Ok(()) => self.free.push(worker),
                Err(e) => warn!(worker = worker.id(), error = %e, "failed to prestart worker"),
            }
        }
        self.publish();
    }

    fn drop_aborted_head(&mut self) {
        while self
            .queue
            .front()
            .is_some_and(|job| job.core.is_abort_requested())
        {
            if let Some(job) = self.queue.pop_front() {
                self.counters.job_dequeued();
                job.core.abort(JobStatus::AbortedBeforeStart, JobError::AbortedBeforeStart);
                trace!(job = job.core.id(), "dropped job aborted while queued");
                self.record(&job.core);
            }
        }
    }

    fn judge(&self, worker: &Worker, now: Instant) -> Verdict {
        let Some(core) = worker.current() else {
            return Verdict::Finished;
        };
        if !worker.is_alive() {
            return Verdict::Lost(core.clone());
        }
        if let Some(since) = worker.stopping_since() {
            if now.saturating_duration_since(since) >= self.config.stop_grace_period {
                return Verdict::Overdue(core.clone());
            }
            return Verdict::Running;
        }
        if core.is_abort_requested() {
            return Verdict::AbortRequested;
        }
        if core.budget_exceeded(now) {
            return Verdict::Expired(core.clone());
        }
        Verdict::Running
    }

    fn sweep(&mut self, now: Instant) {
        let ids: Vec<WorkerId> = self.busy.keys().copied().collect();
        for id in ids {
            let verdict = match self.busy.get(&id) {
                Some(worker) => self.judge(worker, now),
                None => continue,
            };

            match verdict {
                Verdict::Finished => {
                    if let Some(worker) = self.busy.remove(&id) {
                        self.release_to_free(worker);
                    }
                }
                Verdict::Lost(core) => {
                    warn!(worker = id, job = core.id(), "worker thread died while running a job");
                    core.abort(
                        JobStatus::AbortedDuringExecution,
                        JobError::AbortedDuringExecution(AbortReason::WorkerLost),
                    );
                    self.record(&core);
                    if let Some(worker) = self.busy.remove(&id) {
                        worker.retire();
                    }
                }
                Verdict::Overdue(core) => {
                    let reason = core.abort_reason();
                    core.abort(
                        JobStatus::AbortedDuringExecution,
                        JobError::AbortedDuringExecution(reason),
                    );
                    self.record(&core);
                    if let Some(worker) = self.busy.remove(&id) {
                        worker.abandon();
                        self.counters.workers_abandoned.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Verdict::AbortRequested => {
                    if let Some(worker) = self.busy.get_mut(&id) {
                        worker.request_stop(AbortReason::Requested);
                    }
                }
                Verdict::Expired(core) => {
                    warn!(
                        worker = id,
                        job = core.id(),
                        limit = ?core.max_running_time(),
                        "job exceeded max running time",
                    );
                    core.cancel(AbortReason::TimeLimit);
                    core.abort(
                        JobStatus::AbortedDuringExecution,
                        JobError::AbortedDuringExecution(AbortReason::TimeLimit),
                    );
                    if let Some(worker) = self.busy.get_mut(&id) {
                        worker.request_stop(AbortReason::TimeLimit);
                    }
                }
                Verdict::Running => {}
            }
        }
    }

    fn release_to_free(&mut self, worker: Worker) {
        if worker.is_alive() {
            self.free.push(worker);
        } else {
            warn!(worker = worker.id(), "discarding dead worker");
            worker.retire();
        }
    }

    fn dispatch(&mut self, now: Instant) {
        loop {
            self.drop_aborted_head();
            let Some(head) = self.queue.front() else {
                break;
            };

            let mut worker = if let Some(worker) = self.free.pop() {
                worker
            } else if self.total_workers() < self.config.max_workers
                && head.waited(now) >= self.config.max_wait_before_worker_creation
            {
                self.create_worker()
            } else {
                break;
            };

            let Some(job) = self.queue.pop_front() else {
                self.free.push(worker);
                break;
            };

            let job_id = job.core.id();
            match worker.bind(job) {
                Ok(()) => {
                    self.counters.job_dequeued();
                    trace!(worker = worker.id(), job = job_id, "job dispatched");
                    self.busy.insert(worker.id(), worker);
                }
                Err(job) => {
                    // Задача остаётся головой очереди
                    self.queue.push_front(job);
                    debug!(worker = worker.id(), state = ?worker.state(), "bind rejected");
                    if worker.current().is_none() {
                        worker.release();
                    }
                    self.release_to_free(worker);
                    break;
                }
            }
        }
    }

    /// Не больше одного воркера за проход
    fn reclaim_idle(&mut self, now: Instant) {
        if self.free.len() <= self.config.min_workers {
            return;
        }
        let oldest = self
            .free
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.idle_since())
            .map(|(idx, w)| (idx, now.saturating_duration_since(w.idle_since())));

        if let Some((idx, idle)) = oldest {
            if idle >= self.config.max_worker_idle_time {
                let worker = self.free.remove(idx);
                debug!(worker = worker.id(), ?idle, "retiring idle worker");
                worker.retire();
                self.counters.workers_retired.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn publish(&self) {
        self.counters.busy_workers.store(self.busy.len(), Ordering::Relaxed);
        self.counters.free_workers.store(self.free.len(), Ordering::Relaxed);
    }

    fn teardown(&mut self) {
        while let Some(job) = self.queue.pop_front() {
            self.counters.job_dequeued();
            job.core.abort(JobStatus::AbortedBeforeStart, JobError::AbortedBeforeStart);
            self.record(&job.core);
        }

        for worker in self.busy.values_mut() {
            if worker.current().is_some() {
                worker.request_stop(AbortReason::Shutdown);
            }
        }

        let deadline = Instant::now().checked_add(self.config.stop_grace_period);
        while self
            .busy
            .values()
            .any(|w| w.current().is_some() && w.is_alive())
        {
            let received = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    self.commands.recv_timeout(remaining).ok()
                }
                None => self.commands.recv().ok(),
            };
            match received {
                Some(cmd) => self.handle(cmd),
                None => break,
            }
        }

        let busy: Vec<Worker> = self.busy.drain().map(|(_, w)| w).collect();
        for worker in busy {
            match worker.current().cloned() {
                Some(core) => {
                    core.abort(
                        JobStatus::AbortedDuringExecution,
                        JobError::AbortedDuringExecution(core.abort_reason()),
                    );
                    self.record(&core);
                    if worker.is_alive() {
                        worker.abandon();
                        self.counters.workers_abandoned.fetch_add(1, Ordering::Relaxed);
                    } else {
                        worker.retire();
                    }
                }
                None => worker.retire(),
            }
        }

        for worker in self.free.drain(..) {
            worker.retire();
        }
        self.publish();
    }
}
