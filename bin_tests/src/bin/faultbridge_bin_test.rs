// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::Context;
    use faultbridge::{
        BridgeConfiguration, CrashReportDescriptor, FaultBridge, FaultDecision, FdSink,
        HandlerStrategy, ManagedFault, ManagedFaultPolicy, Metadata, ReentrancyGuard, ReportSink,
        StacktraceCollection, WatcherConfig,
    };
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
    use std::env;
    use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
    use std::time::{Duration, Instant};

    /// Exit code of the handler installed before the bridge in `chained` mode.
    pub const CHAINED_EXIT_CODE: i32 = 42;
    /// Exit code used when a managed runtime is told to terminate.
    pub const TERMINATE_EXIT_CODE: i32 = 3;

    #[inline(never)]
    unsafe fn deref_ptr(p: *mut u8) {
        *std::hint::black_box(p) = std::hint::black_box(1);
    }

    #[inline(never)]
    #[allow(unconditional_recursion)]
    fn recurse(depth: u64) -> u64 {
        let buf = std::hint::black_box([depth as u8; 256]);
        recurse(depth + 1) + u64::from(buf[0])
    }

    fn metadata() -> Metadata {
        Metadata::new(
            "faultbridge-bin-test".to_owned(),
            "1.0.0".to_owned(),
            "native".to_owned(),
            vec!["service:foo".to_owned()],
        )
    }

    fn in_process(
        output_dir: &str,
    ) -> anyhow::Result<(BridgeConfiguration, Box<dyn ReportSink>)> {
        let mut config = BridgeConfiguration::in_process();
        config.set_crash_marker_path(Some(format!("{output_dir}/marker")));
        let sink = FdSink::create(&format!("{output_dir}/report.txt"))?;
        Ok((config, Box::new(sink)))
    }

    fn out_of_process(
        output_dir: &str,
        watcher: &str,
        policy: ManagedFaultPolicy,
    ) -> anyhow::Result<BridgeConfiguration> {
        let watcher = WatcherConfig::spawn(
            watcher.to_owned(),
            vec![],
            vec![(
                faultbridge::constants::FAULTBRIDGE_WATCHER_OUTPUT_ENV.to_owned(),
                format!("{output_dir}/reports.jsonl"),
            )],
            Some(format!("{output_dir}/watcher_stderr.txt")),
            Some(format!("{output_dir}/watcher_stdout.txt")),
        )?;
        BridgeConfiguration::new(
            HandlerStrategy::OutOfProcess,
            vec![],
            true,
            true,
            StacktraceCollection::FramePointers,
            policy,
            Some(Duration::from_secs(5)),
            Some(watcher),
        )
    }

    /// Faults the first time it is asked to write, from inside the signal handler.
    struct FaultingSink {
        inner: FdSink,
        faulted: AtomicBool,
    }

    impl ReportSink for FaultingSink {
        fn write_report(&self, report: &CrashReportDescriptor, metadata_str: Option<&str>) {
            if !self.faulted.swap(true, SeqCst) {
                unsafe { deref_ptr(std::ptr::null_mut::<u8>()) };
            }
            self.inner.write_report(report, metadata_str);
        }
    }

    extern "C" fn exit_handler(_signum: i32) {
        unsafe { libc::_exit(CHAINED_EXIT_CODE) };
    }

    static SECOND_FAULT_GO: AtomicBool = AtomicBool::new(false);
    static NESTED_WRITTEN: AtomicBool = AtomicBool::new(false);

    fn wait_until(done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            unsafe { libc::sched_yield() };
        }
    }

    /// Keeps the top-level report open until a second thread has faulted.
    struct RendezvousSink {
        inner: FdSink,
    }

    impl ReportSink for RendezvousSink {
        fn write_report(&self, report: &CrashReportDescriptor, metadata_str: Option<&str>) {
            if !report.is_nested {
                SECOND_FAULT_GO.store(true, SeqCst);
                wait_until(|| ReentrancyGuard::nested_fault_count() > 0);
            }
            self.inner.write_report(report, metadata_str);
            if report.is_nested {
                NESTED_WRITTEN.store(true, SeqCst);
            }
        }
    }

    // Whichever thread chains here first, both reports are complete before the process goes.
    extern "C" fn exit_once_nested_written(_signum: i32) {
        wait_until(|| NESTED_WRITTEN.load(SeqCst));
        unsafe { libc::_exit(CHAINED_EXIT_CODE) };
    }

    pub fn main() -> anyhow::Result<()> {
        let mut args = env::args().skip(1);
        let mode = args.next().context("Unexpected number of arguments")?;
        let output_dir = args.next().context("Unexpected number of arguments")?;
        let watcher = args.next().context("Unexpected number of arguments")?;

        match mode.as_str() {
            "segv" => {
                let (config, sink) = in_process(&output_dir)?;
                let _bridge = FaultBridge::init_with_sink(config, sink)?;
                faultbridge::update_metadata(metadata())?;
                unsafe { deref_ptr(std::ptr::null_mut::<u8>()) };
            }
            "abort" => {
                let (config, sink) = in_process(&output_dir)?;
                let _bridge = FaultBridge::init_with_sink(config, sink)?;
                std::process::abort();
            }
            "stack_overflow" => {
                let (config, sink) = in_process(&output_dir)?;
                let _bridge = FaultBridge::init_with_sink(config, sink)?;
                std::hint::black_box(recurse(0));
            }
            "chained" => {
                let action = SigAction::new(
                    SigHandler::Handler(exit_handler),
                    SaFlags::empty(),
                    SigSet::empty(),
                );
                unsafe { signal::sigaction(signal::SIGSEGV, &action) }?;
                let (config, sink) = in_process(&output_dir)?;
                let _bridge = FaultBridge::init_with_sink(config, sink)?;
                unsafe { deref_ptr(std::ptr::null_mut::<u8>()) };
            }
            "nested" => {
                let (config, _) = in_process(&output_dir)?;
                let sink = FaultingSink {
                    inner: FdSink::create(&format!("{output_dir}/report.txt"))?,
                    faulted: AtomicBool::new(false),
                };
                let _bridge = FaultBridge::init_with_sink(config, Box::new(sink))?;
                unsafe { deref_ptr(std::ptr::null_mut::<u8>()) };
            }
            "concurrent" => {
                let action = SigAction::new(
                    SigHandler::Handler(exit_once_nested_written),
                    SaFlags::empty(),
                    SigSet::empty(),
                );
                unsafe { signal::sigaction(signal::SIGSEGV, &action) }?;
                let (config, _) = in_process(&output_dir)?;
                let sink = RendezvousSink {
                    inner: FdSink::create(&format!("{output_dir}/report.txt"))?,
                };
                let bridge = FaultBridge::init_with_sink(config, Box::new(sink))?;
                std::thread::scope(|scope| {
                    scope.spawn(|| {
                        let _ = bridge.install_alt_stack_for_current_thread();
                        wait_until(|| SECOND_FAULT_GO.load(SeqCst));
                        unsafe { deref_ptr(std::ptr::null_mut::<u8>()) };
                    });
                    unsafe { deref_ptr(std::ptr::null_mut::<u8>()) };
                });
            }
            "uninstalled" => {
                let (config, sink) = in_process(&output_dir)?;
                let bridge = FaultBridge::init_with_sink(config, sink)?;
                bridge.teardown()?;
                unsafe { deref_ptr(std::ptr::null_mut::<u8>()) };
            }
            "out_of_process" => {
                let config = out_of_process(&output_dir, &watcher, ManagedFaultPolicy::Continue)?;
                let _bridge = FaultBridge::init(config)?;
                faultbridge::update_metadata(metadata())?;
                unsafe { deref_ptr(std::ptr::null_mut::<u8>()) };
            }
            "managed_twice" => {
                let config = out_of_process(&output_dir, &watcher, ManagedFaultPolicy::Continue)?;
                let bridge = FaultBridge::init(config)?;
                for message in ["first", "second"] {
                    let fault = ManagedFault::new("System.InvalidOperationException", message);
                    let decision = bridge.report_managed_fault(&fault);
                    anyhow::ensure!(decision == FaultDecision::Continue, "{decision:?}");
                }
                bridge.teardown()?;
                return Ok(());
            }
            "managed_terminate" => {
                let config = out_of_process(&output_dir, &watcher, ManagedFaultPolicy::Terminate)?;
                let bridge = FaultBridge::init(config)?;
                let fault = ManagedFault::new("System.OutOfMemoryException", "fatal")
                    .with_native_stack();
                if bridge.report_managed_fault(&fault) == FaultDecision::Terminate {
                    std::process::exit(TERMINATE_EXIT_CODE);
                }
            }
            _ => anyhow::bail!("Unknown mode: {mode}"),
        }
        anyhow::bail!("{mode}: the process should not have survived")
    }
}
