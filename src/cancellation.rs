//! Interrupt framework for blocking playback: CancellationToken + generation counter.
//! Each blocking run arms a child of the current token; `interrupt()` cancels it
//! and installs a fresh root so later runs start uninterrupted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct InterruptState {
    current_token: RwLock<CancellationToken>,
    generation: AtomicU64,
}

/// Cloneable handle for interrupting `play_blocking` from another thread.
#[derive(Clone)]
pub struct InterruptHandle {
    inner: Arc<InterruptState>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InterruptState {
                current_token: RwLock::new(CancellationToken::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Cancel the running blocking playback (if any) and advance the generation.
    /// Returns the new generation.
    pub fn interrupt(&self) -> u64 {
        let mut token = self.inner.current_token.write();
        token.cancel();
        *token = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "playback_interrupt_requested");
        generation
    }

    /// Arm a guard for one blocking run.
    pub fn arm(&self) -> RunGuard {
        let token = self.inner.current_token.read().child_token();
        RunGuard {
            token,
            generation: self.inner.generation.load(Ordering::SeqCst),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation view held by a single blocking run.
pub struct RunGuard {
    token: CancellationToken,
    generation: u64,
}

impl RunGuard {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_cancels_armed_run_only() {
        let handle = InterruptHandle::new();
        let run = handle.arm();
        assert!(!run.is_cancelled());

        assert_eq!(handle.interrupt(), 1);
        assert!(run.is_cancelled());
        assert_eq!(run.generation(), 0);

        let next = handle.arm();
        assert!(!next.is_cancelled());
        assert_eq!(next.generation(), 1);
    }

    #[test]
    fn clones_share_generation() {
        let a = InterruptHandle::new();
        let b = a.clone();
        let run = a.arm();
        std::thread::spawn(move || {
            b.interrupt();
        })
        .join()
        .unwrap();
        assert!(run.is_cancelled());
        assert_eq!(a.current_generation(), 1);
    }
}
