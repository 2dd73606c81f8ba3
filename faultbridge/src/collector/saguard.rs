// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};

// Lexically-scoped suppression of signals we might cause ourselves while reporting.
// Writing to a watcher that already went away raises SIGPIPE, and a watcher child exiting raises
// SIGCHLD; either would otherwise reach whatever handler the application installed, from inside
// our fault handler. The signals are ignored and blocked for the lifetime of the guard, and the
// previous dispositions and mask are restored on drop.
pub(crate) struct SaGuard<const N: usize> {
    old_sigactions: [(signal::Signal, signal::SigAction); N],
    old_sigmask: signal::SigSet,
}

impl<const N: usize> SaGuard<N> {
    pub(crate) fn new(signals: &[signal::Signal; N]) -> nix::Result<Self> {
        let mut suppressed_signals = signal::SigSet::empty();
        for signal in signals {
            suppressed_signals.add(*signal);
        }

        let mut old_sigmask = signal::SigSet::empty();
        signal::sigprocmask(
            signal::SigmaskHow::SIG_BLOCK,
            Some(&suppressed_signals),
            Some(&mut old_sigmask),
        )?;

        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), signal::SigSet::empty());
        let mut old_sigactions = [(
            signal::Signal::SIGINT,
            SigAction::new(SigHandler::SigDfl, SaFlags::empty(), signal::SigSet::empty()),
        ); N];
        for (i, &signal) in signals.iter().enumerate() {
            // SAFETY: installing SIG_IGN.
            match unsafe { signal::sigaction(signal, &ignore) } {
                Ok(old_sigaction) => old_sigactions[i] = (signal, old_sigaction),
                Err(e) => {
                    // Undo what was already swapped before giving up.
                    for &(signal, old_sigaction) in &old_sigactions[..i] {
                        // SAFETY: restoring an action the OS handed us.
                        let _ = unsafe { signal::sigaction(signal, &old_sigaction) };
                    }
                    let _ = signal::sigprocmask(
                        signal::SigmaskHow::SIG_SETMASK,
                        Some(&old_sigmask),
                        None,
                    );
                    return Err(e);
                }
            }
        }

        Ok(Self {
            old_sigactions,
            old_sigmask,
        })
    }
}

impl<const N: usize> Drop for SaGuard<N> {
    fn drop(&mut self) {
        for &(signal, old_sigaction) in &self.old_sigactions {
            // SAFETY: restoring an action the OS handed us.
            unsafe {
                let _ = signal::sigaction(signal, &old_sigaction);
            }
        }
        let _ = signal::sigprocmask(
            signal::SigmaskHow::SIG_SETMASK,
            Some(&self.old_sigmask),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_utils::test_lock;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn sigpipe_is_suppressed_then_restored() {
        let _lock = test_lock();
        {
            let _guard = SaGuard::<1>::new(&[signal::SIGPIPE]).unwrap();
            let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
            drop(b);
            let fd = std::os::fd::AsRawFd::as_raw_fd(&a);
            let rval = unsafe { libc::write(fd, [0u8].as_ptr().cast(), 1) };
            assert_eq!(rval, -1);
            assert_eq!(nix::Error::last_raw(), libc::EPIPE);
        }
        let mut mask = signal::SigSet::empty();
        signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, None, Some(&mut mask)).unwrap();
        assert!(!mask.contains(signal::SIGPIPE));
    }
}
