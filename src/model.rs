/// Состояние задачи. `Queued -> Running -> {терминальный}` либо сразу
/// `Queued -> AbortedBeforeStart`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum JobStatus {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    AbortedBeforeStart = 4,
    AbortedDuringExecution = 5,
}

impl JobStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    #[inline]
    pub fn is_aborted(self) -> bool {
        matches!(self, JobStatus::AbortedBeforeStart | JobStatus::AbortedDuringExecution)
    }

    #[inline]
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => JobStatus::Queued,
            1 => JobStatus::Running,
            2 => JobStatus::Completed,
            3 => JobStatus::Failed,
            4 => JobStatus::AbortedBeforeStart,
            _ => JobStatus::AbortedDuringExecution,
        }
    }
}


/// Жизненный цикл воркера:
/// `Unstarted -> Sleeping -> Running -> Sleeping | StoppingCooperative -> StoppingForced | Dead`
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum WorkerState {
    Unstarted,
    Sleeping,
    Running,
    /// Токен задачи отменён, ждём выхода в пределах grace периода
    StoppingCooperative,
    /// Поток отсоединён и завершится сам
    StoppingForced,
    Dead,
}


#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub busy_workers: usize,
    pub free_workers: usize,
    pub queued_jobs: usize,
    pub live_threads: usize,
    pub total_enqueued: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub aborted_jobs: usize,
    pub workers_created: usize,
    pub workers_retired: usize,
    pub workers_abandoned: usize,
    pub peak_workers: usize,
}

impl PoolMetrics {
    #[inline]
    pub fn total_workers(&self) -> usize {
        self.busy_workers + self.free_workers
    }

    pub fn utilization(&self) -> f64 {
        if self.total_workers() == 0 {
            return 0.0;
        }
        self.busy_workers as f64 / self.total_workers() as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed_jobs + self.failed_jobs + self.aborted_jobs;
        if total == 0 {
            return 1.0;
        }
        self.completed_jobs as f64 / total as f64
    }
}
