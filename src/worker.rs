use super::{
    distributor::{Command, PoolCounters},
    errors::{AbortReason, JobError},
    job::{JobContext, JobCore, QueuedJob},
    model::{JobStatus, WorkerState},
};
use std::{
    io,
    sync::{atomic::Ordering, Arc},
    thread,
    time::Instant,
};
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};


pub(crate) type WorkerId = usize;


/// Один многоразовый контекст исполнения поверх OS потока.
/// Принадлежит дистрибьютору; поток запускается лениво при первом bind.
pub(crate) struct Worker {
    id: WorkerId,
    thread_name: String,
    stack_size: Option<usize>,
    events: Sender<Command>,
    counters: Arc<PoolCounters>,
    bind_tx: Option<Sender<QueuedJob>>,
    thread: Option<thread::JoinHandle<()>>,
    current: Option<Arc<JobCore>>,
    idle_since: Instant,
    stopping_since: Option<Instant>,
    exited: bool,
    state: WorkerState,
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        thread_name: String,
        stack_size: Option<usize>,
        events: Sender<Command>,
        counters: Arc<PoolCounters>,
    ) -> Self {
        Self {
            id,
            thread_name,
            stack_size,
            events,
            counters,
            bind_tx: None,
            thread: None,
            current: None,
            idle_since: Instant::now(),
            stopping_since: None,
            exited: false,
            state: WorkerState::Unstarted,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    #[inline]
    pub(crate) fn current(&self) -> Option<&Arc<JobCore>> {
        self.current.as_ref()
    }

    #[inline]
    pub(crate) fn idle_since(&self) -> Instant {
        self.idle_since
    }

    #[inline]
    pub(crate) fn stopping_since(&self) -> Option<Instant> {
        self.stopping_since
    }

    /// Поток жив или ещё не запускался
    pub(crate) fn is_alive(&self) -> bool {
        if self.exited {
            return false;
        }
        match &self.thread {
            Some(handle) => !handle.is_finished(),
            None => self.state == WorkerState::Unstarted,
        }
    }

    pub(crate) fn start(&mut self) -> io::Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        let (tx, rx) = unbounded::<QueuedJob>();
        let mut builder = thread::Builder::new().name(format!("{}-{}", self.thread_name, self.id));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let id = self.id;
        let events = self.events.clone();
        let counters = self.counters.clone();
        counters.live_threads.fetch_add(1, Ordering::Relaxed);

        match builder.spawn(move || run(id, rx, events, counters)) {
            Ok(handle) => {
                self.thread = Some(handle);
                self.bind_tx = Some(tx);
                self.state = WorkerState::Sleeping;
                self.idle_since = Instant::now();
                debug!(worker = id, "worker thread started");
                Ok(())
            }
            Err(e) => {
                self.counters.live_threads.fetch_sub(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Отклоняет задачу, если воркер останавливается или уже занят.
    /// Отклонённая задача возвращается вызывающему.
    pub(crate) fn bind(&mut self, job: QueuedJob) -> Result<(), QueuedJob> {
        if self.stopping_since.is_some() || self.current.is_some() || self.exited {
            return Err(job);
        }

        if let Err(e) = self.start() {
            warn!(worker = self.id, error = %e, "failed to spawn worker thread");
            self.state = WorkerState::Dead;
            return Err(job);
        }

        let Some(tx) = self.bind_tx.as_ref() else {
            return Err(job);
        };

        let core = job.core.clone();
        core.mark_started();
        match tx.send(job) {
            Ok(()) => {
                trace!(worker = self.id, job = core.id(), "job bound");
                self.current = Some(core);
                self.state = WorkerState::Running;
                Ok(())
            }
            Err(e) => {
                core.reset_to_queued();
                self.state = WorkerState::Dead;
                Err(e.into_inner())
            }
        }
    }

    /// Кооперативная остановка: отменяет токен текущей задачи.
    /// Эскалацию по истечении grace периода делает дистрибьютор через `abandon`.
    pub(crate) fn request_stop(&mut self, reason: AbortReason) {
        if self.stopping_since.is_some() {
            return;
        }
        if let Some(core) = &self.current {
            core.cancel(reason);
        }
        self.stopping_since = Some(Instant::now());
        self.state = WorkerState::StoppingCooperative;
    }

    /// Поток сообщил, что закончил текущую задачу
    pub(crate) fn release(&mut self) -> Option<Arc<JobCore>> {
        let core = self.current.take();
        self.stopping_since = None;
        self.idle_since = Instant::now();
        if self.state != WorkerState::Dead {
            self.state = WorkerState::Sleeping;
        }
        core
    }

    pub(crate) fn mark_exited(&mut self) {
        self.exited = true;
        self.state = WorkerState::Dead;
    }

    /// Штатное завершение простаивающего воркера
    pub(crate) fn retire(mut self) {
        self.bind_tx.take();
        self.state = WorkerState::Dead;
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!(worker = self.id, "worker thread panicked on exit");
            }
        }
        debug!(worker = self.id, "worker retired");
    }

    /// Принудительная остановка. Поток нельзя безопасно убить, поэтому он
    /// отсоединяется и завершится сам, когда тело задачи вернёт управление.
    pub(crate) fn abandon(mut self) {
        self.bind_tx.take();
        self.state = WorkerState::StoppingForced;
        drop(self.thread.take());
        warn!(
            worker = self.id,
            state = ?self.state,
            job = ?self.current.as_ref().map(|c| c.id()),
            "worker did not yield in time, thread abandoned",
        );
    }
}


struct ExitGuard {
    id: WorkerId,
    events: Sender<Command>,
    counters: Arc<PoolCounters>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.counters.live_threads.fetch_sub(1, Ordering::Relaxed);
        let _ = self.events.send(Command::WorkerExited {
            worker: self.id,
            panicked: thread::panicking(),
        });
    }
}


fn run(
    id: WorkerId,
    jobs: Receiver<QueuedJob>,
    events: Sender<Command>,
    counters: Arc<PoolCounters>,
) {
    let _guard = ExitGuard {
        id,
        events: events.clone(),
        counters,
    };

    // recv вернёт ошибку, когда дистрибьютор закроет канал
    while let Ok(job) = jobs.recv() {
        let QueuedJob { core, run: body } = job;

        if core.is_abort_requested() {
            core.abort(JobStatus::AbortedBeforeStart, JobError::AbortedBeforeStart);
        } else {
            let ctx = JobContext::new(core);
            body(&ctx);
        }

        if events.send(Command::WorkerFinished(id)).is_err() {
            break;
        }
    }
}
