//! Thread fan-out primitives: [`ShardedExecutor`] for parallel tree search
//! and [`PollThread`] for periodic background work.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Runs a function over `num_shards` parallel shards.
///
/// One shard runs on the calling thread; the remainder run on a persistent
/// worker pool. When `num_shards > 1`, concurrent `execute` calls are
/// serialized. This blocking property is load-bearing: it pipelines CPU tree
/// search against model inference, so that while one self-play thread
/// searches, another can be inside the model, and vice versa.
pub struct ShardedExecutor {
    num_shards: usize,
    pool: Option<rayon::ThreadPool>,
    serialize: Mutex<()>,
}

/// Half-open element range assigned to one shard.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShardRange {
    pub begin: usize,
    pub end: usize,
}

impl ShardedExecutor {
    pub fn new(num_shards: usize) -> ShardedExecutor {
        assert!(num_shards >= 1);
        let pool = (num_shards > 1).then(|| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(num_shards - 1)
                .thread_name(|i| format!("sharded-executor-{}", i))
                .build()
                .expect("failed to build sharded executor pool")
        });
        ShardedExecutor {
            num_shards,
            pool,
            serialize: Mutex::new(()),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Maps a shard to its sub-range of `num_elements` work items.
    pub fn shard_range(shard: usize, num_shards: usize, num_elements: usize) -> ShardRange {
        ShardRange {
            begin: shard * num_elements / num_shards,
            end: (shard + 1) * num_elements / num_shards,
        }
    }

    /// Invokes `f(shard, num_shards)` once per shard and blocks until every
    /// shard completes.
    pub fn execute<F>(&self, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        if self.num_shards == 1 {
            f(0, 1);
            return;
        }

        let _guard = self.serialize.lock().unwrap();
        let pool = self.pool.as_ref().unwrap();
        let num_shards = self.num_shards;
        pool.in_place_scope(|scope| {
            let f = &f;
            for shard in 1..num_shards {
                scope.spawn(move |_| f(shard, num_shards));
            }
            f(0, num_shards);
        });
    }
}

struct PollShared {
    is_joining: Mutex<bool>,
    cv: Condvar,
}

/// Calls a function at a regular interval on a background thread until
/// joined. The callback runs on the polling thread and must not block for
/// long.
pub struct PollThread {
    name: String,
    poll_interval: Duration,
    poll_fn: Option<Box<dyn FnMut() + Send>>,
    shared: Arc<PollShared>,
    handle: Option<JoinHandle<()>>,
}

impl PollThread {
    pub fn new(
        name: &str,
        poll_interval: Duration,
        poll_fn: impl FnMut() + Send + 'static,
    ) -> PollThread {
        PollThread {
            name: name.to_string(),
            poll_interval,
            poll_fn: Some(Box::new(poll_fn)),
            shared: Arc::new(PollShared {
                is_joining: Mutex::new(false),
                cv: Condvar::new(),
            }),
            handle: None,
        }
    }

    pub fn start(&mut self) {
        assert!(self.handle.is_none(), "poll thread already started");
        let shared = Arc::clone(&self.shared);
        let interval = self.poll_interval;
        let mut poll_fn = self.poll_fn.take().expect("poll thread already started");
        self.handle = Some(
            std::thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || {
                    let mut guard = shared.is_joining.lock().unwrap();
                    loop {
                        poll_fn();
                        // Wait until either the interval elapses or join is
                        // requested; exits at the next wake-up.
                        let (g, _) = shared
                            .cv
                            .wait_timeout_while(guard, interval, |joining| !*joining)
                            .unwrap();
                        guard = g;
                        if *guard {
                            break;
                        }
                    }
                })
                .expect("failed to spawn poll thread"),
        );
    }

    /// Signals the polling loop to exit and waits for it.
    pub fn join(&mut self) {
        {
            let mut joining = self.shared.is_joining.lock().unwrap();
            *joining = true;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            handle.join().expect("poll thread panicked");
        }
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.join();
        }
    }
}
