//! Динамический пул OS потоков с центральным дистрибьютором
//!
//! # Features
//! - Эластичный набор воркеров между `min_workers` и `max_workers`
//! - FIFO очередь, пропуск задач, отменённых до запуска
//! - Бюджет времени выполнения на задачу
//! - Кооперативная отмена через `CancellationToken` с эскалацией
//! - Освобождение простаивающих воркеров
//! - Graceful shutdown с таймаутами
//! - Метрики и мониторинг

mod distributor;
pub mod errors;
pub mod handle;
pub mod job;
pub mod model;
pub mod pool;
pub mod result;
mod worker;

pub use errors::{AbortReason, JobError, PoolError};
pub use handle::JobHandle;
pub use job::{Job, JobContext, JobId};
pub use model::{JobStatus, PoolMetrics};
pub use pool::{Config, Monitor, ThreadPool, ThreadPoolInner};
pub use result::{JobResult, PoolResult};
