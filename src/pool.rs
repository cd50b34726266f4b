use super::{
    distributor::{self, Command, DistributorHandle, PoolCounters},
    errors::PoolError,
    handle::JobHandle,
    job::{Job, JobContext},
    model::PoolMetrics,
    result::PoolResult,
};
use std::{
    fmt::Display,
    sync::{Arc, OnceLock},
    thread::{self, ThreadId},
    time::Duration,
};
use crossbeam::channel::{bounded, select, tick, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};


/// Конфигурация пула потоков
#[derive(Debug, Clone)]
pub struct Config {
    pub min_workers: usize,
    pub max_workers: usize,
    pub max_wait_before_worker_creation: Duration,
    pub max_worker_idle_time: Duration,
    pub poll_interval: Duration,
    pub lazy_start: bool,
    /// Бюджет по умолчанию для задач без собственного `max_running_time`
    pub task_timeout: Option<Duration>,
    pub stop_grace_period: Duration,
    pub shutdown_timeout: Duration,
    pub thread_name: String,
    pub stack_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            min_workers: 1,
            max_workers: num_cpus * 2, // Для I/O-bound задач
            max_wait_before_worker_creation: Duration::from_millis(10),
            max_worker_idle_time: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            lazy_start: true,
            task_timeout: None,
            stop_grace_period: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            thread_name: "pool-worker".to_string(),
            stack_size: None,
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            min_workers: num_cpus,
            max_workers: num_cpus,
            max_wait_before_worker_creation: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            min_workers: 1,
            max_workers: num_cpus * 4,
            max_worker_idle_time: Duration::from_secs(30),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_max_wait_before_worker_creation(mut self, wait: Duration) -> Self {
        self.max_wait_before_worker_creation = wait;
        self
    }

    pub fn with_max_worker_idle_time(mut self, idle: Duration) -> Self {
        self.max_worker_idle_time = idle;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lazy_start(mut self, lazy: bool) -> Self {
        self.lazy_start = lazy;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_thread_name<T: Into<String>>(mut self, name: T) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig("max_workers must be greater than zero".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "min_workers ({}) cannot be larger than max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(PoolError::InvalidConfig("poll_interval must be non-zero".into()));
        }
        // Teardown сам может длиться весь grace период, join должен его пережить.
        // `Duration::MAX` означает ожидание без ограничения.
        if self.shutdown_timeout <= self.stop_grace_period && self.shutdown_timeout != Duration::MAX {
            return Err(PoolError::InvalidConfig(
                "shutdown_timeout must be longer than stop_grace_period".into(),
            ));
        }
        if self.thread_name.contains('\0') {
            return Err(PoolError::InvalidConfig("thread_name must not contain null bytes".into()));
        }
        Ok(())
    }
}


pub type ThreadPool = Arc<ThreadPoolInner>;


struct Gate {
    accepting: bool,
    started: bool,
}

/// Динамический пул: задачи выполняются на эластичном наборе OS потоков,
/// которым управляет единственный поток-дистрибьютор
pub struct ThreadPoolInner {
    config: Config,
    commands: Sender<Command>,
    // Получатель забирает дистрибьютор при старте
    pending_receiver: Mutex<Option<Receiver<Command>>>,
    gate: RwLock<Gate>,
    distributor: Mutex<Option<DistributorHandle>>,
    distributor_thread: OnceLock<ThreadId>,
    counters: Arc<PoolCounters>,
}

impl std::fmt::Debug for ThreadPoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolInner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ThreadPoolInner {
    pub fn new(min_workers: usize, max_workers: usize) -> PoolResult<ThreadPool> {
        let config = Config::default().with_workers(min_workers, max_workers);
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> PoolResult<ThreadPool> {
        config.validate()?;

        let (tx, rx) = unbounded();
        let lazy = config.lazy_start;
        let pool = Arc::new(ThreadPoolInner {
            config,
            commands: tx,
            pending_receiver: Mutex::new(Some(rx)),
            gate: RwLock::new(Gate {
                accepting: true,
                started: false,
            }),
            distributor: Mutex::new(None),
            distributor_thread: OnceLock::new(),
            counters: Arc::new(PoolCounters::default()),
        });

        if !lazy {
            pool.ensure_started()?;
        }

        Ok(pool)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.gate.read().started
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.gate.read().accepting
    }

    fn ensure_started(&self) -> PoolResult<()> {
        if self.gate.read().started {
            return Ok(());
        }

        let mut gate = self.gate.write();
        if gate.started {
            return Ok(());
        }
        if !gate.accepting {
            return Err(PoolError::ShuttingDown);
        }

        let receiver = self
            .pending_receiver
            .lock()
            .take()
            .ok_or(PoolError::ShuttingDown)?;

        let handle = distributor::spawn(
            self.config.clone(),
            receiver,
            self.commands.clone(),
            self.counters.clone(),
        )
        .map_err(|e| PoolError::Spawn(e.to_string()))?;

        let _ = self.distributor_thread.set(handle.thread_id());
        *self.distributor.lock() = Some(handle);
        gate.started = true;
        Ok(())
    }

    /// Ставит задачу в хвост очереди. Не блокируется.
    pub fn enqueue<T>(&self, job: Job<T>) -> PoolResult<JobHandle<T>>
    where
        T: Send + 'static,
    {
        self.ensure_started()?;

        let (queued, completion) = job.into_parts(self.config.task_timeout);
        let core = queued.core.clone();

        let gate = self.gate.read();
        if !gate.accepting {
            return Err(PoolError::ShuttingDown);
        }

        core.mark_enqueued();
        self.counters.job_accepted();
        if self.commands.send(Command::Enqueue(queued)).is_err() {
            self.counters.job_rejected();
            return Err(PoolError::ShuttingDown);
        }
        drop(gate);

        Ok(JobHandle::new(core, completion, self.commands.clone()))
    }

    pub fn submit<A, T, E, F>(&self, arg: A, work: F) -> PoolResult<JobHandle<T>>
    where
        A: Send + 'static,
        T: Send + 'static,
        E: Display,
        F: FnOnce(A, &JobContext) -> Result<T, E> + Send + 'static,
    {
        self.enqueue(Job::new(arg, work))
    }

    pub fn submit_with_limit<A, T, E, F>(
        &self,
        arg: A,
        work: F,
        max_running_time: Duration,
    ) -> PoolResult<JobHandle<T>>
    where
        A: Send + 'static,
        T: Send + 'static,
        E: Display,
        F: FnOnce(A, &JobContext) -> Result<T, E> + Send + 'static,
    {
        self.enqueue(Job::new(arg, work).max_running_time(max_running_time))
    }

    #[inline]
    pub fn execute<T, F>(&self, work: F) -> PoolResult<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&JobContext) -> T + Send + 'static,
    {
        self.enqueue(Job::from_fn(work))
    }

    /// Фактическое удаление из очереди делает дистрибьютор на следующем проходе
    pub fn request_abort<T>(&self, handle: &JobHandle<T>) {
        handle.abort();
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        self.counters.snapshot()
    }

    pub fn join_all(&self) {
        self.counters.wait_drained(None);
    }

    pub fn join_all_timeout(&self, timeout: Duration) -> bool {
        self.counters.wait_drained(Some(timeout))
    }

    /// Идемпотентна и безопасна при конкурентных вызовах: второй вызов
    /// дожидается окончания первого. `false`, если дистрибьютор не
    /// остановился за `shutdown_timeout` и был отсоединён.
    ///
    /// На потоке дистрибьютора (например, из наблюдателя задачи) только
    /// инициирует остановку и сразу возвращает `true`: ждать себя он не может.
    pub fn shutdown(&self) -> bool {
        {
            let mut gate = self.gate.write();
            if gate.accepting {
                info!("pool shutdown requested");
            }
            gate.accepting = false;
        }

        if self.distributor_thread.get() == Some(&thread::current().id()) {
            let _ = self.commands.send(Command::Shutdown);
            debug!("shutdown requested from the distributor thread, not joining");
            return true;
        }

        let mut slot = self.distributor.lock();
        let Some(handle) = slot.take() else {
            return true;
        };

        let _ = self.commands.send(Command::Shutdown);
        let stopped = handle.join_timeout(self.config.shutdown_timeout);
        debug!(stopped, "pool shutdown finished");
        stopped
    }

    /// Мониторинг метрик с callback.
    /// Остановка через `Monitor::stop()` или drop.
    pub fn start_monitoring<F>(&self, interval: Duration, callback: F) -> PoolResult<Monitor>
    where
        F: Fn(PoolMetrics) + Send + 'static,
    {
        let counters = self.counters.clone();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(interval);

        let thread = thread::Builder::new()
            .name(format!("{}-monitor", self.config.thread_name))
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => callback(counters.snapshot()),
                    recv(stop_rx) -> _ => break,
                }
            })
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        Ok(Monitor {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for ThreadPoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}


pub struct Monitor {
    stop: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Monitor {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        // Закрытие канала будит select в потоке мониторинга
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.halt();
    }
}
