use super::{
    errors::{AbortReason, JobError},
    model::JobStatus,
    result::JobResult,
};
use std::{
    any::Any,
    fmt::Display,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};
use crossbeam::atomic::AtomicCell;
use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;


pub type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type Thunk = Box<dyn FnOnce(&JobContext) + Send + 'static>;
type Body<T> = Box<dyn FnOnce(&JobContext) -> Result<T, String> + Send + 'static>;
type Observer<T> = Box<dyn FnOnce(&JobResult<T>) + Send + 'static>;


/// Контекст, который получает тело задачи на потоке воркера.
/// Через него тело проверяет запрос кооперативной отмены.
pub struct JobContext {
    core: Arc<JobCore>,
    started_at: Instant,
}

impl JobContext {
    pub(crate) fn new(core: Arc<JobCore>) -> Self {
        Self {
            core,
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn id(&self) -> JobId {
        self.core.id
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.core.token.is_cancelled()
    }

    /// Токен можно клонировать и передать дальше, например в async код
    #[inline]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.core.token
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.core.abort_reason.load()
    }

    /// Точка кооперативной отмены: `ctx.checkpoint()?` внутри тела задачи
    pub fn checkpoint(&self) -> JobResult<()> {
        if self.is_cancelled() {
            let reason = self.abort_reason().unwrap_or(AbortReason::Requested);
            return Err(JobError::AbortedDuringExecution(reason));
        }
        Ok(())
    }
}


/// Задача до постановки в очередь: тело, бюджет времени и наблюдатели
pub struct Job<T> {
    body: Body<T>,
    max_running_time: Option<Duration>,
    observers: Vec<Observer<T>>,
}

impl<T: Send + 'static> Job<T> {
    pub fn new<A, E, F>(arg: A, work: F) -> Self
    where
        A: Send + 'static,
        E: Display,
        F: FnOnce(A, &JobContext) -> Result<T, E> + Send + 'static,
    {
        Self {
            body: Box::new(move |ctx: &JobContext| work(arg, ctx).map_err(|e| e.to_string())),
            max_running_time: None,
            observers: Vec::new(),
        }
    }

    pub fn from_fn<F>(work: F) -> Self
    where
        F: FnOnce(&JobContext) -> T + Send + 'static,
    {
        Self {
            body: Box::new(move |ctx: &JobContext| Ok(work(ctx))),
            max_running_time: None,
            observers: Vec::new(),
        }
    }

    pub fn max_running_time(mut self, limit: Duration) -> Self {
        self.max_running_time = Some(limit);
        self
    }

    /// Наблюдатель вызывается синхронно на том потоке, который завершил задачу
    pub fn on_complete<F>(mut self, observer: F) -> Self
    where
        F: FnOnce(&JobResult<T>) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
        self
    }

    pub(crate) fn into_parts(
        self,
        default_budget: Option<Duration>,
    ) -> (QueuedJob, Arc<Completion<T>>) {
        let completion = Arc::new(Completion::new(self.observers));
        let core = Arc::new(JobCore::new(
            self.max_running_time.or(default_budget),
            completion.clone(),
        ));

        let body = self.body;
        let done = completion.clone();
        let run: Thunk = Box::new(move |ctx: &JobContext| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(ctx)));

            // После отмены результат тела отбрасывается
            let (status, result) = if ctx.is_cancelled() {
                let reason = ctx.abort_reason().unwrap_or(AbortReason::Requested);
                (
                    JobStatus::AbortedDuringExecution,
                    Err(JobError::AbortedDuringExecution(reason)),
                )
            } else {
                match outcome {
                    Ok(Ok(value)) => (JobStatus::Completed, Ok(value)),
                    Ok(Err(msg)) => (JobStatus::Failed, Err(JobError::Failed(msg))),
                    Err(payload) => (
                        JobStatus::Failed,
                        Err(JobError::Panic(panic_message(payload))),
                    ),
                }
            };

            ctx.core.settle_with(status, move || done.settle(result));
        });

        (QueuedJob { core, run }, completion)
    }
}


pub(crate) struct QueuedJob {
    pub(crate) core: Arc<JobCore>,
    pub(crate) run: Thunk,
}

impl QueuedJob {
    #[inline]
    pub(crate) fn waited(&self, now: Instant) -> Duration {
        self.core
            .enqueued_at
            .load()
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }
}


pub(crate) trait Settle: Send + Sync {
    fn settle_err(&self, err: JobError);
}


/// Нетипизированная часть задачи: общая для handle, дистрибьютора и воркера
pub(crate) struct JobCore {
    id: JobId,
    max_running_time: Option<Duration>,
    enqueued_at: AtomicCell<Option<Instant>>,
    started_at: AtomicCell<Option<Instant>>,
    finished_at: AtomicCell<Option<Instant>>,
    status: AtomicU8,
    abort_requested: AtomicBool,
    abort_reason: AtomicCell<Option<AbortReason>>,
    token: CancellationToken,
    sink: Arc<dyn Settle>,
}

impl JobCore {
    fn new(max_running_time: Option<Duration>, sink: Arc<dyn Settle>) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            max_running_time,
            enqueued_at: AtomicCell::new(None),
            started_at: AtomicCell::new(None),
            finished_at: AtomicCell::new(None),
            status: AtomicU8::new(JobStatus::Queued as u8),
            abort_requested: AtomicBool::new(false),
            abort_reason: AtomicCell::new(None),
            token: CancellationToken::new(),
            sink,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    #[inline]
    pub(crate) fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn max_running_time(&self) -> Option<Duration> {
        self.max_running_time
    }

    #[inline]
    pub(crate) fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at.load()
    }

    #[inline]
    pub(crate) fn started_at(&self) -> Option<Instant> {
        self.started_at.load()
    }

    #[inline]
    pub(crate) fn finished_at(&self) -> Option<Instant> {
        self.finished_at.load()
    }

    #[inline]
    pub(crate) fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    pub(crate) fn mark_enqueued(&self) {
        self.enqueued_at.store(Some(Instant::now()));
    }

    pub(crate) fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
        self.cancel(AbortReason::Requested);
    }

    /// Запоминает только первую причину отмены
    pub(crate) fn cancel(&self, reason: AbortReason) {
        let _ = self.abort_reason.compare_exchange(None, Some(reason));
        self.token.cancel();
    }

    pub(crate) fn abort_reason(&self) -> AbortReason {
        self.abort_reason.load().unwrap_or(AbortReason::Requested)
    }

    pub(crate) fn mark_started(&self) -> bool {
        let swapped = self
            .status
            .compare_exchange(
                JobStatus::Queued as u8,
                JobStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            self.started_at.store(Some(Instant::now()));
        }
        swapped
    }

    /// Откат `mark_started`, когда bind был отклонён
    pub(crate) fn reset_to_queued(&self) {
        if self
            .status
            .compare_exchange(
                JobStatus::Running as u8,
                JobStatus::Queued as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.started_at.store(None);
        }
    }

    pub(crate) fn budget_exceeded(&self, now: Instant) -> bool {
        match (self.max_running_time, self.started_at.load()) {
            (Some(limit), Some(started)) => now.saturating_duration_since(started) >= limit,
            _ => false,
        }
    }

    /// Единственный переход в терминальный статус. `settle` вызывается только победителем.
    pub(crate) fn settle_with<F: FnOnce()>(&self, status: JobStatus, settle: F) -> bool {
        debug_assert!(status.is_terminal());
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if JobStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.status.compare_exchange(
                current,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.finished_at.store(Some(Instant::now()));
        settle();
        true
    }

    pub(crate) fn abort(&self, status: JobStatus, err: JobError) -> bool {
        self.settle_with(status, || self.sink.settle_err(err))
    }
}


struct Slot<T> {
    settled: bool,
    result: Option<JobResult<T>>,
}

/// Слот результата: блокирующее ожидание через Condvar и async через AtomicWaker
pub(crate) struct Completion<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    waker: AtomicWaker,
    observers: Mutex<Vec<Observer<T>>>,
}

impl<T> Completion<T> {
    fn new(observers: Vec<Observer<T>>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                settled: false,
                result: None,
            }),
            ready: Condvar::new(),
            waker: AtomicWaker::new(),
            observers: Mutex::new(observers),
        }
    }

    fn settle(&self, result: JobResult<T>) {
        let observers = std::mem::take(&mut *self.observers.lock());
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(&result))).is_err() {
                warn!("job completion observer panicked");
            }
        }

        {
            let mut slot = self.slot.lock();
            if slot.settled {
                return;
            }
            slot.settled = true;
            slot.result = Some(result);
        }
        self.ready.notify_all();
        self.waker.wake();
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.slot.lock().settled
    }

    pub(crate) fn wait(&self) -> JobResult<T> {
        let mut slot = self.slot.lock();
        while !slot.settled {
            self.ready.wait(&mut slot);
        }
        slot.result.take().unwrap_or(Err(JobError::ResultTaken))
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> JobResult<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait();
        };
        let mut slot = self.slot.lock();
        while !slot.settled {
            if self.ready.wait_until(&mut slot, deadline).timed_out() && !slot.settled {
                return Err(JobError::Timeout);
            }
        }
        slot.result.take().unwrap_or(Err(JobError::ResultTaken))
    }

    /// Таймаут, не представимый как `Instant`, означает ожидание без ограничения
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.slot.lock();
        while !slot.settled {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        return slot.settled;
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
        true
    }

    pub(crate) fn poll_result(&self, cx: &mut Context<'_>) -> Poll<JobResult<T>> {
        self.waker.register(cx.waker());
        let mut slot = self.slot.lock();
        if slot.settled {
            Poll::Ready(slot.result.take().unwrap_or(Err(JobError::ResultTaken)))
        } else {
            Poll::Pending
        }
    }
}

impl<T: Send> Settle for Completion<T> {
    fn settle_err(&self, err: JobError) {
        self.settle(Err(err));
    }
}


pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{:?}", payload)
    }
}
