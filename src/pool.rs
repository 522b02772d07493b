//! Fan-out of generator routines onto OS threads and their orderly shutdown.

use crate::cancel::CancellationToken;
use crate::error::{LoadError, LoadResult};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One spawned execution unit.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the unit to exit. Threads cannot be killed, so this re-asserts the
    /// shared token; the unit leaves at its next poll.
    pub fn terminate(&self) {
        debug!("Requesting termination of {}", self.name);
        self.token.set();
    }

    /// Block until the unit has exited. A panic inside the unit is logged, not propagated.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if let Err(payload) = thread.join() {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Worker {} panicked: {}", self.name, msg);
            }
        }
    }

    /// Join, warning once if the unit is slower than `warn_after` to leave.
    fn join_watched(&mut self, warn_after: Duration) {
        let start = Instant::now();
        let mut warned = false;
        while self.is_alive() {
            if !warned && start.elapsed() >= warn_after {
                warn!(
                    "Worker {} still running {:?} after stop; waiting for it to observe cancellation",
                    self.name,
                    start.elapsed()
                );
                warned = true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.join();
    }
}

/// Set of units bound to one cancellation token.
///
/// Units differ only in the routine they run; spawning and joining is shared.
#[derive(Debug)]
pub struct WorkerPool {
    token: CancellationToken,
    handles: Vec<WorkerHandle>,
    warn_after: Duration,
}

impl WorkerPool {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            handles: Vec::new(),
            warn_after: Duration::from_secs(2),
        }
    }

    pub fn with_warn_after(mut self, warn_after: Duration) -> Self {
        self.warn_after = warn_after;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn alive(&self) -> usize {
        self.handles.iter().filter(|h| h.is_alive()).count()
    }

    /// Spawn a single named unit running `routine(token)`.
    pub fn spawn<F>(&mut self, name: impl Into<String>, routine: F) -> LoadResult<()>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let name = name.into();
        let token = self.token.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || routine(token))
            .map_err(|source| LoadError::Spawn {
                name: name.clone(),
                source,
            })?;
        debug!("Spawned worker {}", name);
        self.handles.push(WorkerHandle {
            name,
            token: self.token.clone(),
            thread: Some(thread),
        });
        Ok(())
    }

    /// Spawn `n` units, each running `routine(index, token)`.
    pub fn start<F>(&mut self, label: &str, n: usize, routine: F) -> LoadResult<()>
    where
        F: Fn(usize, CancellationToken) + Send + Sync + 'static,
    {
        let routine = Arc::new(routine);
        for index in 0..n {
            let routine = Arc::clone(&routine);
            self.spawn(format!("{label}-{index}"), move |token| routine(index, token))?;
        }
        info!("Launched {} {} unit(s)", n, label);
        Ok(())
    }

    /// Set the token, then terminate and join every unit. Returns the number of units joined.
    ///
    /// Returns only once every unit has exited.
    pub fn stop_all(&mut self) -> usize {
        self.token.set();
        let joined = self.handles.len();
        for handle in &mut self.handles {
            if handle.is_alive() {
                handle.terminate();
            }
            handle.join_watched(self.warn_after);
        }
        self.handles.clear();
        if joined > 0 {
            info!("All {} worker(s) stopped", joined);
        }
        joined
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop_all();
        }
    }
}

/// Units for CPU load: one per available core.
pub fn default_cpu_units() -> usize {
    num_cpus::get().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn polling_routine(counter: Arc<AtomicUsize>) -> impl Fn(usize, CancellationToken) + Send + Sync {
        move |_, token| {
            counter.fetch_add(1, Ordering::SeqCst);
            while !token.sleep(Duration::from_millis(20)) {}
        }
    }

    fn run_pool(n: usize) {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(CancellationToken::new());
        pool.start("test", n, polling_routine(Arc::clone(&counter))).unwrap();
        assert_eq!(pool.len(), n);

        let start = Instant::now();
        while counter.load(Ordering::SeqCst) < n && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), n);

        let before: Vec<_> = pool.handles().iter().map(|h| h.name().to_string()).collect();
        assert_eq!(before.len(), n);
        assert_eq!(pool.stop_all(), n);
        assert_eq!(pool.alive(), 0);
        assert!(pool.is_empty());
        assert!(pool.token().is_set());
    }

    #[test]
    fn stop_all_with_no_units() {
        run_pool(0);
    }

    #[test]
    fn stop_all_with_one_unit() {
        run_pool(1);
    }

    #[test]
    fn stop_all_with_eight_units() {
        run_pool(8);
    }

    #[test]
    fn stop_all_tolerates_preset_token() {
        let token = CancellationToken::new();
        let mut pool = WorkerPool::new(token.clone());
        pool.spawn("quick", |t| while !t.sleep(Duration::from_millis(10)) {}).unwrap();
        token.set();
        assert_eq!(pool.stop_all(), 1);
    }

    #[test]
    fn panicking_unit_is_contained() {
        let mut pool = WorkerPool::new(CancellationToken::new());
        pool.spawn("boom", |_| panic!("generator failure")).unwrap();
        pool.spawn("steady", |t| while !t.sleep(Duration::from_millis(10)) {}).unwrap();
        assert_eq!(pool.stop_all(), 2);
        assert_eq!(pool.alive(), 0);
    }

    #[test]
    fn units_are_named_by_label_and_index() {
        let mut pool = WorkerPool::new(CancellationToken::new());
        pool.start("cpu", 2, |_, t| while !t.sleep(Duration::from_millis(10)) {}).unwrap();
        let names: Vec<_> = pool.handles().iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, vec!["cpu-0", "cpu-1"]);
        pool.stop_all();
    }

    #[test]
    fn drop_stops_units() {
        let token = CancellationToken::new();
        {
            let mut pool = WorkerPool::new(token.clone());
            pool.start("dropped", 3, |_, t| while !t.sleep(Duration::from_millis(10)) {}).unwrap();
        }
        assert!(token.is_set());
        assert_eq!(token.holders(), 1);
    }
}
