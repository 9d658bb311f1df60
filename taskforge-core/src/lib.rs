//! # taskforge-core
//!
//! A dynamically-scaled task scheduler and worker pool running on blocking
//! OS threads: task units with a state machine and result channel, a
//! strategy-pluggable bounded queue with backpressure, adaptive worker
//! threads, an autoscaling scheduler, and the user-facing pool facade.
//!
//! ## Modules
//!
//! - `unit`: task unit hierarchy — standard, timed, dependent variants
//! - `queue`: FIFO / priority / delay task queue, all bounded + backpressure
//! - `worker`: adaptive-polling worker thread
//! - `scheduler`: owns the queue and worker set, runs autoscaling
//! - `pool`: the user-facing submission API and lifecycle state machine
//! - `stats`: pool statistics snapshot
//!
//! ## Example
//!
//! ```no_run
//! use taskforge_core::pool::ThreadPool;
//! use taskforge_shared::config::PoolConfig;
//!
//! let pool = ThreadPool::new(PoolConfig::default(), None);
//! pool.start();
//! let handle = pool.submit(|| 2 + 2).unwrap();
//! assert_eq!(handle.get_result().unwrap(), 4);
//! pool.stop();
//! ```

pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod unit;
pub mod worker;
