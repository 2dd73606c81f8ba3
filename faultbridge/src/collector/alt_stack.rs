// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::error::BridgeError;
use super::reentrancy::{ReentrancyGuard, ReentrancyState};
use crate::shared::unix_utils::current_tid;
use libc::{
    c_void, mmap, mprotect, munmap, sigaltstack, stack_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE,
    PROT_NONE, PROT_READ, PROT_WRITE, SIGSTKSZ, SS_DISABLE,
};
use std::ptr;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::SeqCst;

/// An alternate signal stack with a guard page at its low end.
///
/// `sigaltstack` is per thread, and so is an `AltStack`: once installed on a thread, the region
/// belongs to that thread until it uninstalls it. Installing it on a second thread is refused, as
/// two handlers running at once would write over each other's frames. The region is only unmapped
/// once no thread has it installed and no handler is running; otherwise it is leaked.
#[derive(Debug)]
pub struct AltStack {
    // Address of the guard page, i.e. of the whole mapping.
    mapping: usize,
    mapping_len: usize,
    // Usable region, above the guard page.
    stack_base: usize,
    stack_size: usize,
    // Thread the region is installed on, or `NO_OWNER`.
    owner: AtomicI64,
}

const NO_OWNER: i64 = 0;

impl AltStack {
    /// Reserves `max(SIGSTKSZ, size)` bytes, rounded up to whole pages, plus one guard page.
    /// Inspired by https://github.com/rust-lang/rust/pull/69969/files
    pub fn new(size: usize) -> Result<Self, BridgeError> {
        let page_size = page_size::get();
        let stack_size = std::cmp::max(SIGSTKSZ, size).div_ceil(page_size) * page_size;
        let mapping_len = stack_size + page_size;
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let mapping = unsafe {
            mmap(
                ptr::null_mut(),
                mapping_len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if mapping == MAP_FAILED {
            return Err(BridgeError::setup(
                "failed to allocate an alternate stack",
                std::io::Error::last_os_error(),
            ));
        }
        // SAFETY: `mapping` is the start of a mapping at least one page long.
        if unsafe { mprotect(mapping, page_size, PROT_NONE) } != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: the mapping was created above and is not in use.
            unsafe { munmap(mapping, mapping_len) };
            return Err(BridgeError::setup(
                "failed to set up alternate stack guard page",
                err,
            ));
        }
        Ok(Self {
            mapping: mapping as usize,
            mapping_len,
            stack_base: mapping as usize + page_size,
            stack_size,
            owner: AtomicI64::new(NO_OWNER),
        })
    }

    /// Registers this region as the alternate signal stack of the calling thread.
    ///
    /// A no-op if it already is. Fails if another thread has it installed.
    pub fn install(&self) -> Result<(), BridgeError> {
        if self.is_current() {
            return Ok(());
        }
        let tid = current_tid();
        match self.owner.compare_exchange(NO_OWNER, tid, SeqCst, SeqCst) {
            Ok(_) => {}
            // Replaced on this thread behind our back: take it back.
            Err(owner) if owner == tid => {}
            Err(owner) => {
                return Err(BridgeError::SetupFailed(format!(
                    "alternate stack is already installed on thread {owner}"
                )))
            }
        }
        let stack = stack_t {
            ss_sp: self.stack_base as *mut c_void,
            ss_flags: 0,
            ss_size: self.stack_size,
        };
        // SAFETY: the region stays mapped for as long as any thread may have it installed.
        let rval = unsafe { sigaltstack(&stack, ptr::null_mut()) };
        if rval != 0 {
            let err = std::io::Error::last_os_error();
            self.owner.store(NO_OWNER, SeqCst);
            return Err(BridgeError::setup("sigaltstack failed", err));
        }
        Ok(())
    }

    /// Disables the alternate stack on the calling thread (if it is this one) and releases the
    /// region.
    ///
    /// Refuses with [`BridgeError::HandlerActive`] while a fault is being handled: the region is
    /// then leaked, as a handler may be running on it. The region is also leaked, without error,
    /// if another thread still has it installed.
    pub fn uninstall(self) -> Result<(), BridgeError> {
        if ReentrancyGuard::state() != ReentrancyState::Idle {
            std::mem::forget(self);
            return Err(BridgeError::HandlerActive);
        }
        if self.is_current() {
            let disable = stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: SS_DISABLE,
                ss_size: 0,
            };
            // SAFETY: disabling takes no buffer.
            let rval = unsafe { sigaltstack(&disable, ptr::null_mut()) };
            if rval != 0 {
                // EPERM: we are running on it right now.
                let err = std::io::Error::last_os_error();
                std::mem::forget(self);
                return Err(BridgeError::setup("failed to disable alternate stack", err));
            }
        }
        // No longer registered on this thread, whether we disabled it or something replaced it.
        let _ = self
            .owner
            .compare_exchange(current_tid(), NO_OWNER, SeqCst, SeqCst);
        if let Some(owner) = self.owner() {
            tracing::debug!(owner, "Alternate stack still installed on another thread, leaking it");
            std::mem::forget(self);
        }
        Ok(())
    }

    /// Whether this region is the calling thread's active alternate stack.
    pub fn is_current(&self) -> bool {
        current_alt_stack()
            .is_some_and(|(base, size)| base == self.stack_base && size == self.stack_size)
    }

    /// The thread this region is installed on, if any. A thread that exits without uninstalling
    /// keeps it.
    pub fn owner(&self) -> Option<i64> {
        Some(self.owner.load(SeqCst)).filter(|owner| *owner != NO_OWNER)
    }

    pub fn size(&self) -> usize {
        self.stack_size
    }

    pub fn base(&self) -> usize {
        self.stack_base
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        if self.owner().is_some() || ReentrancyGuard::state() != ReentrancyState::Idle {
            return;
        }
        // SAFETY: no thread has the region installed and no handler is running.
        unsafe { munmap(self.mapping as *mut c_void, self.mapping_len) };
    }
}

/// The calling thread's alternate stack as `(base, size)`, or `None` if it has none.
pub fn current_alt_stack() -> Option<(usize, usize)> {
    let mut current = stack_t {
        ss_sp: ptr::null_mut(),
        ss_flags: 0,
        ss_size: 0,
    };
    // SAFETY: a null new stack only queries.
    let rval = unsafe { sigaltstack(ptr::null(), &mut current) };
    if rval != 0 || current.ss_flags & SS_DISABLE != 0 || current.ss_sp.is_null() {
        return None;
    }
    Some((current.ss_sp as usize, current.ss_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_utils::test_lock;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn size_is_at_least_sigstksz() {
        let _lock = test_lock();
        let stack = AltStack::new(1).unwrap();
        assert!(stack.size() >= SIGSTKSZ);
        assert_eq!(stack.size() % page_size::get(), 0);
        assert!(!stack.is_current());
        stack.uninstall().unwrap();
    }

    // Each test thread has its own alternate stack setting, so these run on a fresh thread.
    #[test]
    #[cfg_attr(miri, ignore)]
    fn install_then_uninstall() {
        let _lock = test_lock();
        std::thread::spawn(|| {
            let stack = AltStack::new(64 * 1024).unwrap();
            stack.install().unwrap();
            assert!(stack.is_current());
            assert_eq!(current_alt_stack(), Some((stack.base(), stack.size())));
            stack.uninstall().unwrap();
            assert_eq!(current_alt_stack(), None);
        })
        .join()
        .unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn uninstall_refused_while_handler_active() {
        let _lock = test_lock();
        std::thread::spawn(|| {
            let stack = AltStack::new(64 * 1024).unwrap();
            stack.install().unwrap();
            let guard = ReentrancyGuard::enter(crate::FaultOrigin::Native);
            assert!(matches!(stack.uninstall(), Err(BridgeError::HandlerActive)));
            drop(guard);
            // Leaked rather than unmapped: still registered for this thread.
            assert!(current_alt_stack().is_some());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn installing_twice_then_uninstalling_releases_the_region() {
        let _lock = test_lock();
        std::thread::spawn(|| {
            let stack = AltStack::new(64 * 1024).unwrap();
            stack.install().unwrap();
            stack.install().unwrap();
            assert_eq!(stack.owner(), Some(current_tid()));
            let base = stack.base();
            stack.uninstall().unwrap();
            assert_eq!(current_alt_stack(), None);
            // Unmapped: msync reports ENOMEM for an address with no mapping.
            let page = page_size::get();
            let rval = unsafe { libc::msync(base as *mut c_void, page, libc::MS_ASYNC) };
            assert_eq!(rval, -1);
            assert_eq!(
                std::io::Error::last_os_error().raw_os_error(),
                Some(libc::ENOMEM)
            );
        })
        .join()
        .unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn region_is_never_installed_on_two_threads() {
        let _lock = test_lock();
        let stack = std::sync::Arc::new(AltStack::new(64 * 1024).unwrap());
        let (installed_tx, installed_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let first = stack.clone();
        let owner = std::thread::spawn(move || {
            first.install().unwrap();
            installed_tx.send(current_tid()).unwrap();
            done_rx.recv().unwrap();
            let (base, _) = current_alt_stack().unwrap();
            assert_eq!(base, first.base());
        });
        let owner_tid = installed_rx.recv().unwrap();

        let second = stack.clone();
        std::thread::spawn(move || {
            assert!(matches!(second.install(), Err(BridgeError::SetupFailed(_))));
            assert_eq!(current_alt_stack(), None);
        })
        .join()
        .unwrap();

        assert_eq!(stack.owner(), Some(owner_tid));
        done_tx.send(()).unwrap();
        owner.join().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn stack_left_installed_by_an_exited_thread_is_leaked() {
        let _lock = test_lock();
        let stack = std::sync::Arc::new(AltStack::new(64 * 1024).unwrap());
        let other = stack.clone();
        std::thread::spawn(move || other.install().unwrap())
            .join()
            .unwrap();
        let stack = std::sync::Arc::try_unwrap(stack).unwrap();
        assert!(!stack.is_current());
        assert!(stack.owner().is_some());
        // Not unmapped: the kernel may still hold it for that thread id.
        stack.uninstall().unwrap();
    }
}
