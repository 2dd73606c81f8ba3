// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::crash_handler::handle_posix_sigaction;
use super::error::BridgeError;
use crate::shared::configuration::HandlerStrategy;
use crate::shared::log::sigsafe_debug;
use crate::shared::unix_utils::terminate;
use crate::signal_from_signum;
use libc::{c_void, siginfo_t};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use std::cell::UnsafeCell;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::SeqCst;

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;

const UNINSTALLED: u8 = 0;
const INSTALLING: u8 = 1;
const INSTALLED: u8 = 2;
const UNINSTALLING: u8 = 3;

/// The handler that was in place before ours, for one monitored signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledHandlerRecord {
    pub signal: signal::Signal,
    pub previous: SigAction,
    pub installed: bool,
}

struct HandlerTable {
    records: [Option<InstalledHandlerRecord>; MAX_SIGNALS],
    // Installation order, so uninstall can walk it backwards.
    order: [i32; MAX_SIGNALS],
    len: usize,
}

struct SharedTable(UnsafeCell<HandlerTable>);

// SAFETY: the table is only written while `REGISTRY_STATE` is INSTALLING or UNINSTALLING, which a
// single caller at a time can reach through a compare-and-swap. Fault handlers only read it.
unsafe impl Sync for SharedTable {}

static HANDLERS: SharedTable = SharedTable(UnsafeCell::new(HandlerTable {
    records: [None; MAX_SIGNALS],
    order: [0; MAX_SIGNALS],
    len: 0,
}));
static REGISTRY_STATE: AtomicU8 = AtomicU8::new(UNINSTALLED);
static STRATEGY: AtomicU8 = AtomicU8::new(HandlerStrategy::InProcess as u8);

/// Process-wide installation of the bridge's signal handlers.
///
/// There is one set of signal dispositions per process, so this is a namespace over static state
/// rather than a value. [`crate::FaultBridge`] is the owner that drives it.
pub struct HandlerRegistry;

impl HandlerRegistry {
    /// Installs `handle_posix_sigaction` for each signal, keeping the previous action for
    /// chaining.
    ///
    /// Installing again with the same strategy while installed changes nothing and returns the
    /// existing records; the bridge handler is never chained to itself. A different strategy is
    /// refused with [`BridgeError::StrategyMismatch`]: uninstall first.
    ///
    /// A signal listed twice is rejected with [`BridgeError::InvalidSignal`], as its second record
    /// would chain to the first. If any signal fails, the ones already swapped are restored
    /// before returning.
    pub fn install(
        strategy: HandlerStrategy,
        signals: &[i32],
        use_alt_stack: bool,
    ) -> Result<Vec<InstalledHandlerRecord>, BridgeError> {
        if let Err(current) =
            REGISTRY_STATE.compare_exchange(UNINSTALLED, INSTALLING, SeqCst, SeqCst)
        {
            return match current {
                INSTALLED if Self::strategy() == Some(strategy) => Ok(Self::records()),
                INSTALLED => Err(BridgeError::StrategyMismatch {
                    installed: Self::strategy().unwrap_or(strategy),
                    requested: strategy,
                }),
                _ => Err(BridgeError::SetupFailed(
                    "Another install or uninstall is in progress".to_string(),
                )),
            };
        }

        for (i, signum) in signals.iter().enumerate() {
            if *signum <= 0
                || *signum as usize >= MAX_SIGNALS
                || signal_from_signum(*signum).is_err()
                || signals[..i].contains(signum)
            {
                REGISTRY_STATE.store(UNINSTALLED, SeqCst);
                return Err(BridgeError::InvalidSignal(*signum));
            }
        }

        // SAFETY: INSTALLING is held, see `SharedTable`.
        let table = unsafe { &mut *HANDLERS.0.get() };
        table.records = [None; MAX_SIGNALS];
        table.len = 0;
        STRATEGY.store(strategy as u8, SeqCst);

        for signum in signals {
            // SAFETY: the handler only relies on async-signal-safe operations.
            match unsafe { register_signal_handler(*signum, use_alt_stack) } {
                Ok(record) => {
                    table.records[*signum as usize] = Some(record);
                    table.order[table.len] = *signum;
                    table.len += 1;
                }
                Err(e) => {
                    restore_previous(table);
                    REGISTRY_STATE.store(UNINSTALLED, SeqCst);
                    return Err(BridgeError::setup(
                        &format!("unable to register handler for signal {signum}"),
                        e,
                    ));
                }
            }
        }
        REGISTRY_STATE.store(INSTALLED, SeqCst);
        tracing::debug!(?strategy, ?signals, use_alt_stack, "Installed signal handlers");
        Ok(Self::records())
    }

    /// Restores each previous handler, in reverse installation order. No-op when not installed.
    ///
    /// Records are kept, marked as no longer installed, so that a fault already in flight can
    /// still chain.
    pub fn uninstall() -> Result<(), BridgeError> {
        match REGISTRY_STATE.compare_exchange(INSTALLED, UNINSTALLING, SeqCst, SeqCst) {
            Ok(_) => {}
            Err(UNINSTALLED) => return Ok(()),
            Err(_) => {
                return Err(BridgeError::SetupFailed(
                    "Another install or uninstall is in progress".to_string(),
                ))
            }
        }
        // SAFETY: UNINSTALLING is held, see `SharedTable`.
        let table = unsafe { &mut *HANDLERS.0.get() };
        restore_previous(table);
        REGISTRY_STATE.store(UNINSTALLED, SeqCst);
        tracing::debug!("Restored previous signal handlers");
        Ok(())
    }

    pub fn is_installed() -> bool {
        REGISTRY_STATE.load(SeqCst) == INSTALLED
    }

    /// The strategy handlers were installed with, while installed.
    pub fn strategy() -> Option<HandlerStrategy> {
        if !Self::is_installed() {
            return None;
        }
        Some(if STRATEGY.load(SeqCst) == HandlerStrategy::OutOfProcess as u8 {
            HandlerStrategy::OutOfProcess
        } else {
            HandlerStrategy::InProcess
        })
    }

    /// Active records, in installation order.
    pub fn records() -> Vec<InstalledHandlerRecord> {
        if !Self::is_installed() {
            return vec![];
        }
        // SAFETY: INSTALLED, so nobody is writing.
        let table = unsafe { &*HANDLERS.0.get() };
        table.order[..table.len]
            .iter()
            .filter_map(|signum| table.records[*signum as usize])
            .collect()
    }
}

fn restore_previous(table: &mut HandlerTable) {
    for signum in table.order[..table.len].iter().rev() {
        if let Some(record) = table.records[*signum as usize].as_mut() {
            if record.installed {
                // SAFETY: restoring an action the OS handed us.
                if let Err(e) = unsafe { signal::sigaction(record.signal, &record.previous) } {
                    tracing::warn!(signum, %e, "Failed to restore previous signal handler");
                }
                record.installed = false;
            }
        }
    }
}

unsafe fn register_signal_handler(
    signum: i32,
    use_alt_stack: bool,
) -> anyhow::Result<InstalledHandlerRecord> {
    let signal_type = signal_from_signum(signum)?;

    // Some runtimes set up an alternate stack of their own and check the stack pointer in their
    // chained handler, so it is possible to use an alternate stack without creating one.
    let extra_saflags = if use_alt_stack {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    // SA_SIGINFO is implied by `SigHandler::SigAction`.
    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    let mut previous = signal::sigaction(signal_type, &sig_action)?;
    if previous.handler() == SigHandler::SigAction(handle_posix_sigaction) {
        // Left behind by an install whose records are gone. Chaining to it would loop forever.
        tracing::warn!(signum, "Bridge handler already installed, chaining to the default");
        previous = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), signal::SigSet::empty());
    }
    Ok(InstalledHandlerRecord {
        signal: signal_type,
        previous,
        installed: true,
    })
}

fn record_for(signum: i32) -> Option<InstalledHandlerRecord> {
    if signum <= 0 || signum as usize >= MAX_SIGNALS {
        return None;
    }
    // SAFETY: see `SharedTable`. A fault racing a concurrent install may see a missing record,
    // which `chain_signal_handler` treats as fatal.
    unsafe { (*HANDLERS.0.get()).records[signum as usize] }
}

/// Once we've handled the signal, chain to any previous handlers.
/// If we run into an unexpected condition we just `_exit` to quit the program without re-raising
/// `SIGABRT`.
pub(crate) unsafe fn chain_signal_handler(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let Some(record) = record_for(signum) else {
        sigsafe_debug!("missing chain handler for signal {signum}, terminating");
        terminate()
    };
    // How we chain depends on what kind of handler we're chaining to.
    // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
    // https://man7.org/linux/man-pages/man2/sigaction.2.html
    match record.previous.handler() {
        SigHandler::SigDfl => reset_default_and_raise(signum),
        SigHandler::SigIgn => (),
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
    }
}

/// Restores the default action for `signum` and raises it, so that the default behaviour (core
/// dump, termination with the right signal) happens. Exits if it somehow returns.
pub(crate) fn reset_default_and_raise(signum: i32) {
    let Ok(signal_type) = signal_from_signum(signum) else {
        terminate()
    };
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), signal::SigSet::empty());
    // SAFETY: installing the default disposition.
    if unsafe { signal::sigaction(signal_type, &default) }.is_err() {
        terminate()
    }
    // Signals are only delivered once. Returning from a synchronous fault re-executes the
    // faulting instruction, which now hits the default action; a raised signal has to be raised
    // again.
    // SAFETY: No preconditions.
    unsafe { libc::raise(signum) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_utils::test_lock;
    use std::sync::atomic::AtomicUsize;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(super::MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }

    static USR_HITS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_usr(_signum: i32) {
        USR_HITS.fetch_add(1, SeqCst);
    }

    fn current_handler(signal: signal::Signal) -> SigHandler {
        let query = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), signal::SigSet::empty());
        unsafe {
            let current = signal::sigaction(signal, &query).unwrap();
            signal::sigaction(signal, &current).unwrap();
            current.handler()
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn install_is_idempotent_and_chains() {
        let _lock = test_lock();
        let counting = SigAction::new(
            SigHandler::Handler(count_usr),
            SaFlags::empty(),
            signal::SigSet::empty(),
        );
        let original = unsafe { signal::sigaction(signal::SIGUSR1, &counting).unwrap() };

        let first =
            HandlerRegistry::install(HandlerStrategy::InProcess, &[libc::SIGUSR1], false).unwrap();
        let second =
            HandlerRegistry::install(HandlerStrategy::InProcess, &[libc::SIGUSR1], false).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].previous.handler(), SigHandler::Handler(count_usr));
        assert_eq!(
            current_handler(signal::SIGUSR1),
            SigHandler::SigAction(handle_posix_sigaction)
        );
        assert_eq!(
            HandlerRegistry::strategy(),
            Some(HandlerStrategy::InProcess)
        );

        // Nothing is configured, so the bridge only chains.
        let before = USR_HITS.load(SeqCst);
        signal::raise(signal::SIGUSR1).unwrap();
        assert_eq!(USR_HITS.load(SeqCst), before + 1);

        assert!(matches!(
            HandlerRegistry::install(HandlerStrategy::OutOfProcess, &[libc::SIGUSR1], false),
            Err(BridgeError::StrategyMismatch { .. })
        ));

        HandlerRegistry::uninstall().unwrap();
        assert!(!HandlerRegistry::is_installed());
        assert!(HandlerRegistry::records().is_empty());
        assert_eq!(current_handler(signal::SIGUSR1), SigHandler::Handler(count_usr));
        HandlerRegistry::uninstall().unwrap();

        unsafe { signal::sigaction(signal::SIGUSR1, &original).unwrap() };
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn invalid_signal_is_rejected() {
        let _lock = test_lock();
        assert!(matches!(
            HandlerRegistry::install(HandlerStrategy::InProcess, &[libc::SIGUSR2, 200], false),
            Err(BridgeError::InvalidSignal(200))
        ));
        assert!(!HandlerRegistry::is_installed());
        assert_eq!(current_handler(signal::SIGUSR2), SigHandler::SigDfl);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn uninstall_restores_in_reverse_order() {
        let _lock = test_lock();
        let records = HandlerRegistry::install(
            HandlerStrategy::OutOfProcess,
            &[libc::SIGUSR2, libc::SIGUSR1],
            true,
        )
        .unwrap();
        assert_eq!(records[0].signal, signal::SIGUSR2);
        assert_eq!(records[1].signal, signal::SIGUSR1);
        assert!(records.iter().all(|r| r.installed));
        HandlerRegistry::uninstall().unwrap();
        assert_eq!(current_handler(signal::SIGUSR1), SigHandler::SigDfl);
        assert_eq!(current_handler(signal::SIGUSR2), SigHandler::SigDfl);
        // Kept for in-flight faults.
        let kept = record_for(libc::SIGUSR1).unwrap();
        assert!(!kept.installed);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn duplicate_signal_is_rejected() {
        let _lock = test_lock();
        assert!(matches!(
            HandlerRegistry::install(
                HandlerStrategy::InProcess,
                &[libc::SIGUSR1, libc::SIGUSR2, libc::SIGUSR1],
                false
            ),
            Err(BridgeError::InvalidSignal(libc::SIGUSR1))
        ));
        assert!(!HandlerRegistry::is_installed());
        assert_eq!(current_handler(signal::SIGUSR1), SigHandler::SigDfl);
        assert_eq!(current_handler(signal::SIGUSR2), SigHandler::SigDfl);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn bridge_handler_is_never_recorded_as_previous() {
        let _lock = test_lock();
        let stale = SigAction::new(
            SigHandler::SigAction(handle_posix_sigaction),
            SaFlags::SA_NODEFER,
            signal::SigSet::empty(),
        );
        let original = unsafe { signal::sigaction(signal::SIGUSR2, &stale).unwrap() };

        let records =
            HandlerRegistry::install(HandlerStrategy::InProcess, &[libc::SIGUSR2], false).unwrap();
        assert_eq!(records[0].previous.handler(), SigHandler::SigDfl);

        HandlerRegistry::uninstall().unwrap();
        assert_eq!(current_handler(signal::SIGUSR2), SigHandler::SigDfl);
        unsafe { signal::sigaction(signal::SIGUSR2, &original).unwrap() };
    }
}
