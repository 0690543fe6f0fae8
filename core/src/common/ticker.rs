//! Cooperative tick scheduler.
//!
//! Components register named routines measured in ticks. A routine is either
//! periodic or one-time; one-time routines are dropped after they fire. The
//! node drives `tick()` from a tokio interval, tests drive it by hand with
//! `advance()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;

/// Default wall-clock length of one tick.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

pub type Routine = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Every(u64),
    Once,
}

struct Entry {
    schedule: Schedule,
    due: u64,
    routine: Routine,
}

#[derive(Default)]
struct TickerState {
    ticks: u64,
    routines: HashMap<String, Entry>,
}

#[derive(Default)]
pub struct Ticker {
    state: Mutex<TickerState>,
}

impl Ticker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }

    /// Registers (or replaces) a periodic routine firing every `interval` ticks.
    /// With `trigger_now` the routine also runs once immediately.
    pub fn register_periodic<F>(&self, name: &str, interval: u64, trigger_now: bool, routine: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let routine: Routine = Arc::new(routine);
        let interval = interval.max(1);
        {
            let mut state = self.state.lock();
            let due = state.ticks + interval;
            state.routines.insert(
                name.to_string(),
                Entry {
                    schedule: Schedule::Every(interval),
                    due,
                    routine: routine.clone(),
                },
            );
        }
        debug!("[ticker] periodic routine {} every {} ticks", name, interval);
        if trigger_now {
            routine();
        }
    }

    /// Registers (or re-arms) a routine that fires once, `after` ticks from now.
    pub fn register_one_time<F>(&self, name: &str, after: u64, routine: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let due = state.ticks + after.max(1);
        state.routines.insert(
            name.to_string(),
            Entry {
                schedule: Schedule::Once,
                due,
                routine: Arc::new(routine),
            },
        );
        trace!("[ticker] one-time routine {} due at tick {}", name, due);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.state.lock().routines.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().routines.contains_key(name)
    }

    /// Runs a registered routine right now without touching its schedule.
    pub fn trigger(&self, name: &str) -> bool {
        let routine = self
            .state
            .lock()
            .routines
            .get(name)
            .map(|e| e.routine.clone());
        match routine {
            Some(r) => {
                r();
                true
            }
            None => false,
        }
    }

    /// Advances one tick and runs every routine that became due.
    ///
    /// Handlers run after the lock is released, so a handler may register or
    /// remove routines.
    pub fn tick(&self) {
        let due: Vec<Routine> = {
            let mut state = self.state.lock();
            state.ticks += 1;
            let now = state.ticks;
            let mut fired = Vec::new();
            let mut finished = Vec::new();
            for (name, entry) in state.routines.iter_mut() {
                if entry.due > now {
                    continue;
                }
                fired.push(entry.routine.clone());
                match entry.schedule {
                    Schedule::Every(interval) => entry.due = now + interval,
                    Schedule::Once => finished.push(name.clone()),
                }
            }
            for name in finished {
                state.routines.remove(&name);
            }
            fired
        };
        for routine in due {
            routine();
        }
    }

    pub fn advance(&self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Drives the ticker from a tokio interval until the runtime shuts down.
    pub fn spawn_driver(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let ticker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let t = Arc::clone(&ticker);
                // routines take chain locks, keep them off the async workers
                if tokio::task::spawn_blocking(move || t.tick()).await.is_err() {
                    log::error!("[ticker] routine panicked");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn periodic_fires_on_interval() {
        let ticker = Ticker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ticker.register_periodic("announce", 3, false, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        ticker.advance(2);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        ticker.advance(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        ticker.advance(6);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn trigger_now_runs_immediately() {
        let ticker = Ticker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ticker.register_periodic("try_sync", 10, true, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(ticker.trigger("try_sync"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!ticker.trigger("missing"));
    }

    #[test]
    fn one_time_fires_once_and_is_removed() {
        let ticker = Ticker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ticker.register_one_time("timeout-a", 5, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        ticker.advance(4);
        assert!(ticker.contains("timeout-a"));
        ticker.advance(1);
        assert!(!ticker.contains("timeout-a"));
        ticker.advance(20);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_timeout_never_fires() {
        let ticker = Ticker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ticker.register_one_time("timeout-b", 2, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(ticker.remove("timeout-b"));
        ticker.advance(5);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_may_rearm_itself() {
        let ticker = Ticker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let weak = Arc::downgrade(&ticker);
        ticker.register_one_time("retry", 1, move || {
            let n = h.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                if let Some(t) = weak.upgrade() {
                    let h2 = h.clone();
                    t.register_one_time("retry-inner", 1, move || {
                        h2.fetch_add(10, Ordering::SeqCst);
                    });
                }
            }
        });
        ticker.advance(3);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }
}
