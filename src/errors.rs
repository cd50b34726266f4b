use std::fmt;
use thiserror::Error;


/// Причина прерывания задачи, которая уже была привязана к воркеру
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum AbortReason {
    /// Вызывающая сторона запросила отмену
    Requested,
    /// Превышен бюджет времени выполнения
    TimeLimit,
    /// Поток воркера завершился, не завершив задачу
    WorkerLost,
    /// Пул останавливается
    Shutdown,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::Requested => "abort requested",
            AbortReason::TimeLimit => "max running time exceeded",
            AbortReason::WorkerLost => "worker thread died",
            AbortReason::Shutdown => "pool shutdown",
        };
        f.write_str(s)
    }
}


#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),
    #[error("job panicked: {0}")]
    Panic(String),
    #[error("job aborted before start")]
    AbortedBeforeStart,
    #[error("job aborted during execution: {0}")]
    AbortedDuringExecution(AbortReason),
    #[error("timed out waiting for job completion")]
    Timeout,
    #[error("job result was already taken")]
    ResultTaken,
}


#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum PoolError {
    #[error("pool is shutting down")]
    ShuttingDown,
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}
