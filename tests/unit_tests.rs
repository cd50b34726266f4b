#[cfg(test)]
mod tests {
    use dynamic_pool::{
        errors::{AbortReason, JobError, PoolError},
        job::Job,
        model::JobStatus,
        pool::{
            Config,
            ThreadPool,
            ThreadPoolInner,
        },
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
            Mutex,
        },
        thread,
        time::{Duration, Instant},
    };
    use crossbeam::channel::{bounded, unbounded};

    fn pool_with(config: Config) -> ThreadPool {
        ThreadPoolInner::with_config(config).expect("valid config")
    }

    fn fast_config(min: usize, max: usize) -> Config {
        Config::default()
            .with_workers(min, max)
            .with_max_wait_before_worker_creation(Duration::ZERO)
            .with_poll_interval(Duration::from_millis(10))
            .with_stop_grace_period(Duration::from_millis(100))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_all_jobs_complete() {
        println!("\n=== TEST: Все задачи завершаются ===");
        let pool = pool_with(fast_config(2, 8));

        let handles: Vec<_> = (0..200u64)
            .map(|i| pool.submit(i, |i, _ctx| Ok::<_, String>(i * 2)).unwrap())
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait(), Ok(i as u64 * 2));
        }

        assert!(pool.join_all_timeout(Duration::from_secs(5)));
        let metrics = pool.metrics();
        println!("  Создано воркеров: {}", metrics.workers_created);
        assert_eq!(metrics.total_enqueued, 200);
        assert_eq!(metrics.completed_jobs, 200);
        assert_eq!(metrics.queued_jobs, 0);
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[test]
    fn test_abort_before_start() {
        println!("\n=== TEST: Отмена задачи до запуска ===");
        let pool = pool_with(fast_config(1, 1));

        let (release_tx, release_rx) = bounded::<()>(0);
        let blocker = pool
            .execute(move |_| {
                let _ = release_rx.recv();
                1
            })
            .unwrap();
        assert!(wait_until(|| blocker.status() == JobStatus::Running, Duration::from_secs(2)));

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let aborted = pool
            .execute(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        aborted.abort();
        assert!(aborted.is_abort_requested());
        release_tx.send(()).unwrap();

        assert_eq!(blocker.wait(), Ok(1));
        assert!(aborted.wait_for(Duration::from_secs(2)));
        assert_eq!(aborted.status(), JobStatus::AbortedBeforeStart);
        assert_eq!(aborted.wait(), Err(JobError::AbortedBeforeStart));
        assert_eq!(counter.load(Ordering::SeqCst), 0, "Тело отменённой задачи не должно выполняться");

        let after = pool.execute(|_| "ok").unwrap();
        assert_eq!(after.wait_timeout(Duration::from_secs(2)), Ok("ok"));
        println!("  ✓ Задача пропущена, пул работает дальше");
    }

    #[test]
    fn test_running_time_budget_non_cooperative() {
        println!("\n=== TEST: Бюджет времени, тело игнорирует отмену ===");
        let pool = pool_with(fast_config(0, 2));

        let (hold_tx, hold_rx) = bounded::<()>(0);
        let start = Instant::now();
        let stuck = pool
            .submit_with_limit(
                (),
                move |(), _ctx| {
                    let _ = hold_rx.recv();
                    Ok::<_, String>(0)
                },
                Duration::from_millis(50),
            )
            .unwrap();
        assert_eq!(stuck.max_running_time(), Some(Duration::from_millis(50)));

        let result = stuck.wait_timeout(Duration::from_secs(2));
        let elapsed = start.elapsed();
        println!("  Прервана через {:?}", elapsed);
        assert_eq!(result, Err(JobError::AbortedDuringExecution(AbortReason::TimeLimit)));
        assert!(elapsed < Duration::from_secs(1));

        let next = pool.execute(|_| 7).unwrap();
        assert_eq!(next.wait_timeout(Duration::from_secs(2)), Ok(7));

        assert!(pool.join_all_timeout(Duration::from_secs(2)));
        let metrics = pool.metrics();
        assert_eq!(metrics.workers_abandoned, 1, "Зависший воркер должен быть отброшен");
        assert_eq!(metrics.aborted_jobs, 1);

        drop(hold_tx);
    }

    #[test]
    fn test_running_time_budget_cooperative() {
        println!("\n=== TEST: Бюджет времени, тело проверяет отмену ===");
        let pool = pool_with(fast_config(1, 1));

        let job = Job::from_fn(|ctx| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            ctx.elapsed()
        })
        .max_running_time(Duration::from_millis(50));

        let handle = pool.enqueue(job).unwrap();
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(2)),
            Err(JobError::AbortedDuringExecution(AbortReason::TimeLimit))
        );

        // Тот же единственный воркер должен быть переиспользован
        let next = pool.execute(|_| thread::current().name().map(str::to_owned)).unwrap();
        assert!(next.wait_timeout(Duration::from_secs(2)).is_ok());

        assert!(pool.join_all_timeout(Duration::from_secs(2)));
        let metrics = pool.metrics();
        assert_eq!(metrics.workers_abandoned, 0);
        assert_eq!(metrics.workers_created, 1);
    }

    #[test]
    fn test_default_task_timeout_applies() {
        let pool = pool_with(fast_config(0, 1).with_task_timeout(Some(Duration::from_millis(30))));

        let handle = pool
            .execute(|ctx| {
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();

        assert_eq!(handle.max_running_time(), Some(Duration::from_millis(30)));
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(2)),
            Err(JobError::AbortedDuringExecution(AbortReason::TimeLimit))
        );
    }

    #[test]
    fn test_worker_bounds() {
        println!("\n=== TEST: Границы числа воркеров ===");
        let pool = pool_with(fast_config(1, 3).with_max_worker_idle_time(Duration::from_secs(10)));

        let handles: Vec<_> = (0..60)
            .map(|i| {
                pool.execute(move |_| {
                    thread::sleep(Duration::from_millis(2));
                    i
                })
                .unwrap()
            })
            .collect();

        for handle in handles {
            assert!(handle.wait().is_ok());
        }
        assert!(pool.join_all_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));

        let metrics = pool.metrics();
        println!(
            "  Пик: {}, свободно: {}, занято: {}",
            metrics.peak_workers, metrics.free_workers, metrics.busy_workers
        );
        assert!(metrics.peak_workers <= 3);
        assert!(metrics.workers_created <= 3);
        assert!(metrics.free_workers >= 1);
        assert!(metrics.total_workers() <= 3);
    }

    #[test]
    fn test_concurrent_dispose() {
        println!("\n=== TEST: Конкурентный shutdown ===");
        let pool = pool_with(fast_config(2, 4).with_lazy_start(false));

        let handles: Vec<_> = (0..10).map(|i| pool.execute(move |_| i).unwrap()).collect();
        for handle in handles {
            assert!(handle.wait().is_ok());
        }

        let a = pool.clone();
        let b = pool.clone();
        let t1 = thread::spawn(move || a.shutdown());
        let t2 = thread::spawn(move || b.shutdown());
        assert!(t1.join().unwrap());
        assert!(t2.join().unwrap());

        let metrics = pool.metrics();
        assert_eq!(metrics.live_threads, 0, "Не должно остаться живых потоков воркеров");
        assert_eq!(metrics.total_workers(), 0);
        assert!(pool.is_shutting_down());
        assert!(pool.shutdown(), "Повторный вызов должен быть no-op");
    }

    #[test]
    fn test_single_worker_fifo() {
        println!("\n=== TEST: Порядок FIFO на одном воркере ===");
        let pool = pool_with(fast_config(1, 1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                pool.execute(move |_| {
                    order.lock().unwrap().push(i);
                    i
                })
                .unwrap()
            })
            .collect();

        for handle in &handles {
            assert!(handle.wait_for(Duration::from_secs(2)));
        }

        let finished: Vec<Instant> = handles.iter().filter_map(|h| h.finished_at()).collect();
        assert_eq!(finished.len(), 5);
        assert!(finished.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_third_job_waits_for_free_worker() {
        println!("\n=== TEST: Не больше двух воркеров для трёх задач ===");
        let pool = pool_with(fast_config(0, 2));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                pool.execute(move |_| {
                    thread::sleep(Duration::from_millis(50));
                    i
                })
                .unwrap()
            })
            .collect();

        for handle in &handles {
            assert!(handle.wait_for(Duration::from_secs(2)));
            assert_eq!(handle.status(), JobStatus::Completed);
        }

        let metrics = pool.metrics();
        assert!(metrics.workers_created <= 2);
        assert!(metrics.peak_workers <= 2);

        // Третья задача стартует только после освобождения воркера
        let first_free = handles[..2]
            .iter()
            .filter_map(|h| h.finished_at())
            .min()
            .unwrap();
        let third_start = handles[2].started_at().unwrap();
        assert!(third_start >= first_free);
    }

    #[test]
    fn test_enqueue_after_shutdown() {
        let pool = pool_with(fast_config(0, 2));
        assert!(pool.execute(|_| 1).unwrap().wait().is_ok());

        assert!(pool.shutdown());
        let err = pool.execute(|_| 2).unwrap_err();
        assert_eq!(err, PoolError::ShuttingDown);

        let lazy = pool_with(fast_config(0, 2));
        assert!(!lazy.is_started());
        lazy.shutdown();
        assert_eq!(lazy.execute(|_| 3).unwrap_err(), PoolError::ShuttingDown);
        assert!(!lazy.is_started());
    }

    #[test]
    fn test_failed_and_panicked_jobs() {
        println!("\n=== TEST: Ошибки и паники в теле задачи ===");
        let pool = pool_with(fast_config(1, 1));

        let failed = pool.submit("boom", |msg, _| Err::<(), _>(msg)).unwrap();
        assert_eq!(failed.wait(), Err(JobError::Failed("boom".into())));

        let prev_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let panicked = pool.execute(|_| -> i32 { panic!("oh no") }).unwrap();
        let result = panicked.wait_timeout(Duration::from_secs(2));
        std::panic::set_hook(prev_hook);

        assert_eq!(result, Err(JobError::Panic("oh no".into())));

        // Воркер пережил панику и переиспользуется
        let ok = pool.execute(|_| 5).unwrap();
        assert_eq!(ok.wait_timeout(Duration::from_secs(2)), Ok(5));

        assert!(pool.join_all_timeout(Duration::from_secs(2)));
        let metrics = pool.metrics();
        assert_eq!(metrics.failed_jobs, 2);
        assert_eq!(metrics.completed_jobs, 1);
        assert_eq!(metrics.workers_created, 1);
    }

    #[test]
    fn test_cooperative_abort_while_running() {
        println!("\n=== TEST: Кооперативная отмена запущенной задачи ===");
        let pool = pool_with(fast_config(0, 2));

        let polling = pool
            .submit((), |(), ctx| {
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok::<_, String>(1)
            })
            .unwrap();

        let checkpointed = pool
            .submit((), |(), ctx| -> Result<(), JobError> {
                loop {
                    ctx.checkpoint()?;
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();

        assert!(wait_until(
            || polling.status() == JobStatus::Running && checkpointed.status() == JobStatus::Running,
            Duration::from_secs(2),
        ));

        pool.request_abort(&polling);
        checkpointed.abort();

        let expected = JobError::AbortedDuringExecution(AbortReason::Requested);
        assert_eq!(polling.wait_timeout(Duration::from_secs(2)), Err(expected.clone()));
        assert_eq!(checkpointed.wait_timeout(Duration::from_secs(2)), Err(expected));

        assert!(pool.join_all_timeout(Duration::from_secs(2)));
        assert_eq!(pool.metrics().workers_abandoned, 0);
    }

    #[test]
    fn test_completion_observer() {
        let pool = pool_with(fast_config(1, 1));
        let (tx, rx) = unbounded();

        let observed = tx.clone();
        let job = Job::from_fn(|_| 5).on_complete(move |result| {
            let _ = observed.send(result.clone());
        });
        let handle = pool.enqueue(job).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(Ok(5)));
        assert_eq!(handle.wait(), Ok(5));

        // Паника в наблюдателе не ломает задачу
        let prev_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let job = Job::from_fn(|_| 6).on_complete(|_| panic!("observer"));
        let result = pool.enqueue(job).unwrap().wait_timeout(Duration::from_secs(2));
        std::panic::set_hook(prev_hook);
        assert_eq!(result, Ok(6));
    }

    #[test]
    fn test_wait_timeout() {
        let pool = pool_with(fast_config(0, 1));

        let handle = pool
            .execute(|_| {
                thread::sleep(Duration::from_millis(300));
                1
            })
            .unwrap();

        assert!(!handle.wait_for(Duration::from_millis(20)));
        assert!(!handle.is_finished());
        assert_eq!(handle.wait_timeout(Duration::from_millis(20)), Err(JobError::Timeout));
    }

    #[tokio::test]
    async fn test_await_handle() {
        let pool = pool_with(fast_config(0, 2));

        let handle = pool.execute(|_| 42).unwrap();
        assert_eq!(handle.await, Ok(42));

        let failing = pool.submit(1, |_, _| Err::<i32, _>("bad")).unwrap();
        assert_eq!(failing.await, Err(JobError::Failed("bad".into())));
    }

    #[test]
    fn test_idle_reclamation() {
        println!("\n=== TEST: Освобождение простаивающих воркеров ===");
        let pool = pool_with(
            fast_config(1, 4).with_max_worker_idle_time(Duration::from_millis(50)),
        );

        let handles: Vec<_> = (0..4)
            .map(|i| {
                pool.execute(move |_| {
                    thread::sleep(Duration::from_millis(30));
                    i
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            assert!(handle.wait().is_ok());
        }

        let created = pool.metrics().workers_created;
        assert!(created >= 1);

        assert!(wait_until(
            || {
                let m = pool.metrics();
                m.free_workers == 1 && m.busy_workers == 0
            },
            Duration::from_secs(3),
        ));
        thread::sleep(Duration::from_millis(200));

        let metrics = pool.metrics();
        println!("  Создано: {}, освобождено: {}", metrics.workers_created, metrics.workers_retired);
        assert_eq!(metrics.free_workers, 1, "Нельзя опускаться ниже min_workers");
        assert_eq!(metrics.workers_retired, metrics.workers_created - 1);
    }

    #[test]
    fn test_config_validation() {
        let err = ThreadPoolInner::with_config(Config::default().with_workers(3, 2)).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));

        let err = ThreadPoolInner::with_config(Config::default().with_workers(0, 0)).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));

        let err = ThreadPoolInner::with_config(Config::default().with_poll_interval(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));

        let config = Config::default()
            .with_stop_grace_period(Duration::from_secs(10))
            .with_shutdown_timeout(Duration::from_secs(1));
        assert!(config.validate().is_err());

        // Join должен пережить весь grace период
        let config = Config::default()
            .with_stop_grace_period(Duration::from_secs(1))
            .with_shutdown_timeout(Duration::from_secs(1));
        assert!(config.validate().is_err());

        let config = Config::default()
            .with_stop_grace_period(Duration::MAX)
            .with_shutdown_timeout(Duration::MAX);
        assert!(config.validate().is_ok());

        assert!(Config::cpu_bound().validate().is_ok());
        assert!(Config::io_bound().validate().is_ok());
    }

    #[test]
    fn test_lazy_start() {
        let lazy = pool_with(fast_config(2, 4));
        assert!(!lazy.is_started());
        assert_eq!(lazy.metrics().live_threads, 0);

        assert_eq!(lazy.execute(|_| 1).unwrap().wait(), Ok(1));
        assert!(lazy.is_started());

        let eager = pool_with(fast_config(2, 4).with_lazy_start(false));
        assert!(eager.is_started());
        assert!(wait_until(
            || eager.metrics().free_workers == 2 && eager.metrics().live_threads == 2,
            Duration::from_secs(2),
        ));
    }

    #[test]
    fn test_shutdown_settles_every_job() {
        println!("\n=== TEST: Shutdown завершает все задачи ===");
        let pool = pool_with(fast_config(1, 1));

        let running = pool
            .execute(|ctx| {
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        assert!(wait_until(|| running.status() == JobStatus::Running, Duration::from_secs(2)));

        let queued: Vec<_> = (0..3).map(|i| pool.execute(move |_| i).unwrap()).collect();

        assert!(pool.shutdown());

        assert_eq!(
            running.wait(),
            Err(JobError::AbortedDuringExecution(AbortReason::Shutdown))
        );
        for handle in queued {
            assert_eq!(handle.status(), JobStatus::AbortedBeforeStart);
            assert_eq!(handle.wait(), Err(JobError::AbortedBeforeStart));
        }

        let metrics = pool.metrics();
        assert_eq!(metrics.aborted_jobs, 4);
        assert_eq!(metrics.live_threads, 0);
    }

    #[test]
    fn test_shutdown_forces_unresponsive_job() {
        println!("\n=== TEST: Shutdown отбрасывает воркер, игнорирующий отмену ===");
        let pool = pool_with(fast_config(1, 1));

        let (hold_tx, hold_rx) = bounded::<()>(0);
        let stuck = pool
            .execute(move |_| {
                let _ = hold_rx.recv();
                0
            })
            .unwrap();
        assert!(wait_until(|| stuck.status() == JobStatus::Running, Duration::from_secs(2)));

        let start = Instant::now();
        assert!(pool.shutdown());
        println!("  Shutdown за {:?}", start.elapsed());
        assert!(start.elapsed() < Duration::from_secs(2));

        assert_eq!(stuck.status(), JobStatus::AbortedDuringExecution);
        assert_eq!(
            stuck.wait(),
            Err(JobError::AbortedDuringExecution(AbortReason::Shutdown))
        );

        let metrics = pool.metrics();
        assert_eq!(metrics.workers_abandoned, 1);
        assert_eq!(metrics.aborted_jobs, 1);
        assert_eq!(metrics.busy_workers, 0);

        drop(hold_tx);
    }

    #[test]
    fn test_shutdown_from_completion_observer() {
        println!("\n=== TEST: Shutdown из наблюдателя на потоке дистрибьютора ===");
        let pool = pool_with(fast_config(1, 1));

        let blocker = pool
            .execute(|ctx| {
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        assert!(wait_until(|| blocker.status() == JobStatus::Running, Duration::from_secs(2)));

        let (tx, rx) = unbounded();
        let observer_pool = pool.clone();
        let queued = pool
            .enqueue(Job::from_fn(|_| 0).on_complete(move |result| {
                let start = Instant::now();
                let stopped = observer_pool.shutdown();
                let name = thread::current().name().map(String::from);
                let _ = tx.send((result.clone(), stopped, start.elapsed(), name));
            }))
            .unwrap();
        queued.abort();

        let (result, stopped, elapsed, name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        println!("  shutdown -> {} за {:?} на {:?}", stopped, elapsed, name);
        assert_eq!(result, Err(JobError::AbortedBeforeStart));
        assert!(stopped);
        assert!(elapsed < Duration::from_millis(500), "Дистрибьютор не должен ждать сам себя");
        assert_eq!(name.as_deref(), Some("pool-worker-distributor"));
        assert!(pool.is_shutting_down());

        assert_eq!(
            blocker.wait_timeout(Duration::from_secs(2)),
            Err(JobError::AbortedDuringExecution(AbortReason::Shutdown))
        );
        assert!(pool.shutdown());
        assert_eq!(pool.metrics().live_threads, 0);
    }

    #[test]
    fn test_unbounded_timeouts() {
        println!("\n=== TEST: Duration::MAX означает ожидание без ограничения ===");
        let config = fast_config(1, 2)
            .with_stop_grace_period(Duration::MAX)
            .with_shutdown_timeout(Duration::MAX);
        let pool = pool_with(config);

        let handle = pool
            .execute(|_| {
                thread::sleep(Duration::from_millis(20));
                5
            })
            .unwrap();
        assert!(handle.wait_for(Duration::MAX));
        assert_eq!(handle.wait_timeout(Duration::MAX), Ok(5));
        assert!(pool.join_all_timeout(Duration::MAX));

        let running = pool
            .execute(|ctx| {
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        assert!(wait_until(|| running.status() == JobStatus::Running, Duration::from_secs(2)));

        assert!(pool.shutdown());
        assert_eq!(
            running.wait(),
            Err(JobError::AbortedDuringExecution(AbortReason::Shutdown))
        );
        let metrics = pool.metrics();
        assert_eq!(metrics.workers_abandoned, 0);
        assert_eq!(metrics.live_threads, 0);
    }

    #[test]
    fn test_monitoring() {
        println!("\n=== TEST: Мониторинг в реальном времени ===");
        let pool = pool_with(fast_config(1, 4));
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();

        let monitor = pool
            .start_monitoring(Duration::from_millis(10), move |metrics| {
                t.fetch_add(1, Ordering::SeqCst);
                assert!(metrics.total_workers() <= 4);
            })
            .unwrap();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                pool.execute(move |_| {
                    thread::sleep(Duration::from_millis(5));
                    i
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            assert!(handle.wait().is_ok());
        }

        assert!(wait_until(|| ticks.load(Ordering::SeqCst) >= 2, Duration::from_secs(2)));
        monitor.stop();
        let after_stop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
        println!("  ✓ Мониторинг завершен");
    }
}
