use std::{
    cell::UnsafeCell,
    fmt,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::util::hint::cold;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. Anyone who sees this either
    /// re-entered from inside the initializer, or raced it. Either way they
    /// must not wait for it.
    Initializing,
}

impl LazyLockState {
    const fn from_u8(n: u8) -> Self {
        match n {
            0 => Self::Uninit,
            1 => Self::Init,
            _ => Self::Initializing,
        }
    }
}

/// A LazyLock that let's you poll its initialization state (including
/// mid-init), and never blocks.
///
/// Whoever moves the state from `Uninit` to `Initializing` runs the
/// initializer; everybody else gets `Err(Initializing)` until it's done and
/// has to make do without the value. That's exactly what an allocator needs
/// when its own construction calls `malloc()`.
///
/// The value is never dropped. Once a static `LazyLock` is initialised it
/// stays valid for the rest of the process, including after `exit()` has
/// started running destructors.
pub struct LazyLock<T, F = fn() -> T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    state: AtomicU8,
    init: F,
}

unsafe impl<T, F> Sync for LazyLock<T, F>
where
    T: Send + Sync,
    F: Sync,
{
}

unsafe impl<T: Send, F: Send> Send for LazyLock<T, F> {}

impl<T, F> LazyLock<T, F> {
    pub fn state(lock: &Self) -> LazyLockState {
        LazyLockState::from_u8(lock.state.load(Ordering::Acquire))
    }

    /// # Safety
    ///
    /// The state must be `Init`.
    pub unsafe fn assume_init(&self) -> &T {
        // This borrow is not needless
        #[allow(clippy::needless_borrow)]
        (&*self.cell.get()).assume_init_ref()
    }

    /// The value, if some thread has finished initialising it.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if LazyLock::state(self) == LazyLockState::Init {
            // SAFETY: `Init` is only published (with `Release`) after the
            // write to `cell` completed, and we loaded it with `Acquire`.
            Some(unsafe { self.assume_init() })
        } else {
            None
        }
    }

    /// Initialise with `f` unless somebody already did or is doing so.
    #[inline]
    fn force_with(&self, f: impl FnOnce() -> T) -> Result<&T, LazyLockState> {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        cold(|| self.initialize(f))
    }

    fn initialize(&self, f: impl FnOnce() -> T) -> Result<&T, LazyLockState> {
        match self.state.compare_exchange(
            LazyLockState::Uninit as u8,
            LazyLockState::Initializing as u8,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: winning the exchange makes us the only writer, and
                // nobody reads `cell` until they observe `Init`.
                unsafe { (*self.cell.get()).write(f()) };
                self.state
                    .store(LazyLockState::Init as u8, Ordering::Release);
                // SAFETY: we just wrote it.
                Ok(unsafe { self.assume_init() })
            }
            Err(observed) => match LazyLockState::from_u8(observed) {
                // SAFETY: `Init` was loaded with `Acquire`.
                LazyLockState::Init => Ok(unsafe { self.assume_init() }),
                other => Err(other),
            },
        }
    }
}

impl<T, F> LazyLock<T, F>
where
    F: FnOnce() -> T + Copy,
{
    pub const fn new(init: F) -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
            init,
        }
    }

    /// Initialise with the stored initializer.
    #[inline]
    pub fn force(&self) -> Result<&T, LazyLockState> {
        self.force_with(self.init)
    }
}

impl<T: fmt::Debug, F> fmt::Debug for LazyLock<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("LazyLock").field(value).finish(),
            None => f
                .debug_tuple("LazyLock")
                .field(&LazyLock::state(self))
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{LazyLock, LazyLockState};

    #[test]
    fn initializes_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static LOCK: LazyLock<usize> = LazyLock::new(|| {
            CALLS.fetch_add(1, Ordering::Relaxed);
            42
        });

        assert_eq!(LazyLock::state(&LOCK), LazyLockState::Uninit);
        assert_eq!(LOCK.get(), None);
        assert_eq!(LOCK.force(), Ok(&42));
        assert_eq!(LOCK.force(), Ok(&42));
        assert_eq!(LazyLock::state(&LOCK), LazyLockState::Init);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reentrant_force_observes_initializing() {
        static LOCK: LazyLock<LazyLockState> = LazyLock::new(|| match LOCK.force() {
            Ok(_) => LazyLockState::Init,
            Err(state) => state,
        });

        assert_eq!(LOCK.force(), Ok(&LazyLockState::Initializing));
    }

    #[test]
    fn racing_threads_agree_on_one_value() {
        static LOCK: LazyLock<usize> = LazyLock::new(|| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            1234
        });
        let results: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| LOCK.force().ok().copied()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert!(results.iter().any(|r| *r == Some(1234)));
        assert!(results.iter().all(|r| r.is_none() || *r == Some(1234)));
        assert_eq!(LOCK.force(), Ok(&1234));
    }
}
