//! Callback marshalling back to the invoking context.
//!
//! [`UiDispatcher`] is a cloneable handle any thread can post through. The
//! callbacks themselves only run when the owner of the matching [`UiLoop`]
//! pumps it, so they always execute on the owner's thread.
//!
//! Every callback posted under a non-empty id holds one reference on that id's
//! token. The reference is dropped once the callback has finished running and
//! the token disappears with its last reference. `cancel_all` drops the token
//! and every callback still waiting under it; tokens carry a generation so a
//! callback already in flight cannot touch a token created after the cancel.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// (id, generation) of the token a callback holds a reference on
type TokenRef = (String, u64);

struct TokenEntry {
    generation: u64,
    refcount: usize,
}

struct Posted {
    token: Option<TokenRef>,
    callback: Callback,
}

#[derive(Default)]
struct DispatchState {
    /// Keyed by (due time, scheduling sequence)
    queue: BTreeMap<(Instant, u64), Posted>,
    tokens: HashMap<String, TokenEntry>,
    next_seq: u64,
    next_generation: u64,
    closed: bool,
}

impl DispatchState {
    fn release(&mut self, token: &TokenRef) {
        let (id, generation) = token;
        let remove = match self.tokens.get_mut(id) {
            Some(entry) if entry.generation == *generation => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            // Stale: the token was cancelled (and maybe recreated) meanwhile
            _ => false,
        };
        if remove {
            self.tokens.remove(id);
            trace!("Dispatch token '{}' released", id);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(due, _)| *due)
    }
}

struct DispatchShared {
    state: Mutex<DispatchState>,
    wakeup: Condvar,
}

impl DispatchShared {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases a callback's token reference once the callback is done, panics
/// included.
struct Completion<'a> {
    shared: &'a DispatchShared,
    token: Option<TokenRef>,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.shared.lock().release(&token);
        }
    }
}

/// Posts callbacks to the context owning the paired [`UiLoop`]
#[derive(Clone)]
pub struct UiDispatcher {
    shared: Arc<DispatchShared>,
}

impl UiDispatcher {
    /// Create a dispatcher and the loop that runs its callbacks
    pub fn new() -> (UiDispatcher, UiLoop) {
        let shared = Arc::new(DispatchShared {
            state: Mutex::new(DispatchState::default()),
            wakeup: Condvar::new(),
        });
        (
            UiDispatcher {
                shared: Arc::clone(&shared),
            },
            UiLoop {
                shared,
                _owner: PhantomData,
            },
        )
    }

    /// Post `callback` to run after `delay` under the token keyed by `id`.
    ///
    /// An empty id posts an untracked callback. Returns `false`, dropping the
    /// callback, when the loop no longer exists.
    pub fn schedule<F>(&self, id: &str, callback: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.closed {
            debug!("Dispatcher loop is gone; dropping callback for '{}'", id);
            return false;
        }

        let token = if id.is_empty() {
            None
        } else {
            let generation = state.next_generation;
            let entry = state.tokens.entry(id.to_string()).or_insert(TokenEntry {
                generation,
                refcount: 0,
            });
            entry.refcount += 1;
            let entry_generation = entry.generation;
            if entry_generation == generation {
                state.next_generation += 1;
            }
            Some((id.to_string(), entry_generation))
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        let due = Instant::now() + delay;
        state.queue.insert(
            (due, seq),
            Posted {
                token,
                callback: Box::new(callback),
            },
        );
        drop(state);
        self.shared.wakeup.notify_all();
        true
    }

    /// Remove the token for `id` and every callback still waiting under it.
    ///
    /// Returns how many pending callbacks were discarded.
    pub fn cancel_all(&self, id: &str) -> usize {
        let discarded: Vec<Posted> = {
            let mut state = self.shared.lock();
            let Some(entry) = state.tokens.remove(id) else {
                return 0;
            };
            let keys: Vec<(Instant, u64)> = state
                .queue
                .iter()
                .filter(|(_, posted)| {
                    posted
                        .token
                        .as_ref()
                        .map_or(false, |(tid, generation)| tid == id && *generation == entry.generation)
                })
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| state.queue.remove(key)).collect()
        };
        debug!("Cancelled dispatch token '{}' ({} pending callbacks)", id, discarded.len());
        // Callbacks are dropped here, outside the lock
        discarded.len()
    }

    /// Ids that currently have a live token
    pub fn pending_tokens(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock().tokens.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reference count of the token for `id`, if one exists
    pub fn token_count(&self, id: &str) -> Option<usize> {
        self.shared.lock().tokens.get(id).map(|entry| entry.refcount)
    }

    /// Callbacks posted but not yet run
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Whether the paired loop still exists
    pub fn is_alive(&self) -> bool {
        !self.shared.lock().closed
    }
}

/// Runs posted callbacks on the thread that owns it
pub struct UiLoop {
    shared: Arc<DispatchShared>,
    // Pinned to the owning thread
    _owner: PhantomData<*const ()>,
}

impl UiLoop {
    /// Run every callback already due; never blocks on an empty queue.
    ///
    /// Callbacks posted while pumping run on the next pump.
    pub fn run_pending(&self) -> usize {
        let now = Instant::now();
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.shared.lock();
                let key = state.queue.keys().next().copied().filter(|(due, _)| *due <= now);
                key.and_then(|key| state.queue.remove(&key))
            };
            let Some(posted) = next else {
                break;
            };
            let _completion = Completion {
                shared: &self.shared,
                token: posted.token,
            };
            (posted.callback)();
            ran += 1;
        }
        ran
    }

    /// Pump for `duration`; returns the number of callbacks run
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut ran = 0;
        loop {
            ran += self.run_pending();
            if Instant::now() >= deadline {
                return ran;
            }
            self.wait_until(deadline);
        }
    }

    /// Pump until `condition` holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met.
    pub fn run_until<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.wait_until(deadline);
        }
    }

    /// Sleep until the next callback is due, something is posted, or `deadline`
    fn wait_until(&self, deadline: Instant) {
        let state = self.shared.lock();
        let wake = state.next_due().map_or(deadline, |due| due.min(deadline));
        let now = Instant::now();
        if wake <= now {
            return;
        }
        let _ = self
            .shared
            .wakeup
            .wait_timeout(state, wake - now)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

impl Drop for UiLoop {
    fn drop(&mut self) {
        let discarded: Vec<Posted> = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.tokens.clear();
            std::mem::take(&mut state.queue).into_values().collect()
        };
        if !discarded.is_empty() {
            debug!("Dispatcher loop dropped with {} pending callbacks", discarded.len());
        }
    }
}
