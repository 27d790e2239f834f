//! # Page Latch
//!
//! A shared / shared-exclusive / exclusive latch with manual lock and
//! unlock, the synchronization primitive behind page fixes and the
//! mini-transaction memo. The three modes:
//!
//! - `S`: any number of holders, compatible with other `S` and with `SX`.
//! - `SX`: one holder, compatible with `S` but not with another `SX`
//!   (a writer that still allows readers while it prepares).
//! - `X`: one holder, compatible with nothing.
//!
//! Guard-style RAII does not fit here: a latch is taken when a page is
//! fixed and released much later while walking the memo in reverse, from
//! a different stack frame. The latch therefore exposes plain
//! `lock_*`/`unlock_*` pairs; the memo is what guarantees pairing.
//!
//! Built on a mutex-protected mode count and a condvar, because the
//! ecosystem rw-locks have no shared-exclusive mode.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LatchState {
    readers: u32,
    sx_held: bool,
    x_held: bool,
}

/// S / SX / X latch with manual pairing.
#[derive(Debug, Default)]
pub struct RwLatch {
    state: Mutex<LatchState>,
    released: Condvar,
}

impl RwLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_s(&self) {
        let mut state = self.state.lock();
        while state.x_held {
            self.released.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn unlock_s(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0);
        state.readers -= 1;
        drop(state);
        self.released.notify_all();
    }

    pub fn lock_sx(&self) {
        let mut state = self.state.lock();
        while state.x_held || state.sx_held {
            self.released.wait(&mut state);
        }
        state.sx_held = true;
    }

    pub fn unlock_sx(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.sx_held);
        state.sx_held = false;
        drop(state);
        self.released.notify_all();
    }

    pub fn lock_x(&self) {
        let mut state = self.state.lock();
        while state.x_held || state.sx_held || state.readers > 0 {
            self.released.wait(&mut state);
        }
        state.x_held = true;
    }

    pub fn unlock_x(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.x_held);
        state.x_held = false;
        drop(state);
        self.released.notify_all();
    }

    /// Whether an X holder currently exists. Debug aid only; the answer
    /// can be stale the moment it returns.
    pub fn is_x_locked(&self) -> bool {
        self.state.lock().x_held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_holders_coexist() {
        let latch = RwLatch::new();
        latch.lock_s();
        latch.lock_s();
        latch.unlock_s();
        latch.unlock_s();
    }

    #[test]
    fn sx_allows_readers() {
        let latch = RwLatch::new();
        latch.lock_sx();
        latch.lock_s();
        latch.unlock_s();
        latch.unlock_sx();
    }

    #[test]
    fn x_excludes_readers() {
        let latch = Arc::new(RwLatch::new());
        let entered = Arc::new(AtomicU32::new(0));

        latch.lock_x();

        let reader = {
            let latch = Arc::clone(&latch);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                latch.lock_s();
                entered.store(1, Ordering::SeqCst);
                latch.unlock_s();
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        latch.unlock_x();
        reader.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn x_waits_for_readers_to_drain() {
        let latch = Arc::new(RwLatch::new());
        latch.lock_s();

        let writer = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                latch.lock_x();
                latch.unlock_x();
            })
        };

        thread::sleep(Duration::from_millis(30));
        latch.unlock_s();
        writer.join().unwrap();
    }

    #[test]
    fn second_sx_waits_for_first() {
        let latch = Arc::new(RwLatch::new());
        latch.lock_sx();

        let second = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                latch.lock_sx();
                latch.unlock_sx();
            })
        };

        thread::sleep(Duration::from_millis(30));
        latch.unlock_sx();
        second.join().unwrap();
    }
}
