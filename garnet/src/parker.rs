use std::{
    sync::atomic::{
        AtomicU8,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

const PARKED: u8 = 0b01;
const TOKEN: u8 = 0b10;

/// One-token parker for paused runtime threads. An `unpark` before `park`
/// is remembered, so a resume racing a pause never gets lost.
#[derive(Debug, Default)]
pub struct Parker {
    state: AtomicU8,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Parker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self) {
        // unpark before park => just ignore
        if self.try_consume_token() {
            return;
        }

        self.state.fetch_or(PARKED, Release);

        let mut guard = self.lock.lock();
        while !self.try_consume_token() {
            self.cv.wait(&mut guard);
        }
        drop(guard);

        self.state.fetch_and(!PARKED, AcqRel);
    }

    /// Returns false if the timeout elapsed without a token.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        if self.try_consume_token() {
            return true;
        }

        self.state.fetch_or(PARKED, Release);

        let mut guard = self.lock.lock();
        let mut woken = self.try_consume_token();
        if !woken {
            self.cv.wait_for(&mut guard, timeout);
            woken = self.try_consume_token();
        }
        drop(guard);

        self.state.fetch_and(!PARKED, AcqRel);
        woken
    }

    #[inline]
    fn try_consume_token(&self) -> bool {
        let mut s = self.state.load(Acquire);
        while s & TOKEN != 0 {
            match self.state.compare_exchange_weak(s, s & !TOKEN, AcqRel, Relaxed) {
                Ok(_) => return true,
                Err(cur) => s = cur,
            }
        }
        false
    }

    pub fn unpark(&self) {
        let prev = self.state.fetch_or(TOKEN, Release);

        if prev & PARKED != 0 {
            let _g = self.lock.lock();
            self.cv.notify_one();
        }
    }
}
