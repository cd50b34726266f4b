use super::{
    distributor::Command,
    job::{Completion, JobCore, JobId},
    model::JobStatus,
    result::JobResult,
};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use crossbeam::channel::Sender;


/// Handle на принятую пулом задачу с поддержкой отмены и timeout
pub struct JobHandle<T> {
    core: Arc<JobCore>,
    completion: Arc<Completion<T>>,
    commands: Sender<Command>,
}

impl<T> JobHandle<T> {

    pub(crate) fn new
    (
        core: Arc<JobCore>,
        completion: Arc<Completion<T>>,
        commands: Sender<Command>,
    ) -> Self {
        Self {
            core,
            completion,
            commands,
        }
    }

    #[inline]
    pub fn id(&self) -> JobId {
        self.core.id()
    }

    #[inline]
    pub fn status(&self) -> JobStatus {
        self.core.status()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.completion.is_settled()
    }

    /// Задача в очереди не будет запущена; запущенная получит кооперативную отмену
    pub fn abort(&self) {
        self.core.request_abort();
        // Дистрибьютор может уже не работать, тогда будить некого
        let _ = self.commands.send(Command::Nudge);
    }

    #[inline]
    pub fn is_abort_requested(&self) -> bool {
        self.core.is_abort_requested()
    }

    #[inline]
    pub fn max_running_time(&self) -> Option<Duration> {
        self.core.max_running_time()
    }

    #[inline]
    pub fn enqueued_at(&self) -> Option<Instant> {
        self.core.enqueued_at()
    }

    #[inline]
    pub fn started_at(&self) -> Option<Instant> {
        self.core.started_at()
    }

    #[inline]
    pub fn finished_at(&self) -> Option<Instant> {
        self.core.finished_at()
    }

    pub fn wait(self) -> JobResult<T> {
        self.completion.wait()
    }

    pub fn wait_timeout(self, timeout: Duration) -> JobResult<T> {
        self.completion.wait_timeout(timeout)
    }

    /// Ждёт завершения, не забирая результат. `true` если задача завершилась.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.completion.wait_for(timeout)
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

impl<T> Future for JobHandle<T> {
    type Output = JobResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().completion.poll_result(cx)
    }
}
