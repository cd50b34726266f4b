use dynamic_pool::{Config, ThreadPoolInner};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;


fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let now = Instant::now();
    let config = Config::io_bound().with_max_worker_idle_time(Duration::from_millis(200));
    let pool = match ThreadPoolInner::with_config(config) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("failed to create pool: {e}");
            return;
        }
    };

    let handles: Vec<_> = (0..10_000u64)
        .filter_map(|i| {
            pool.submit(i, |i, _ctx| Ok::<_, String>(i * i)).ok()
        })
        .collect();

    let sum: u64 = handles
        .into_iter()
        .filter_map(|h| h.wait().ok())
        .sum();

    let metrics = pool.metrics();
    pool.shutdown();
    println!("sum: {sum}");
    println!("workers created: {}, peak: {}", metrics.workers_created, metrics.peak_workers);
    println!("elapsed: {:?}", now.elapsed());
}
