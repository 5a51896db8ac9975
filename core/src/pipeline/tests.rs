use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dovetail_hal::sim::{SimArch, SimChip};
use spin::Mutex;

use super::*;
use crate::config::{DEFAULT_NR_IRQS, DEFAULT_UNHANDLED_LIMIT, DEFAULT_UNHANDLED_WINDOW};
use crate::irq::{IrqHandler, IrqLineFlags, IrqReturn, IrqState};
use crate::sync::HybridSpinlock;

const TIMER: IrqNumber = 27;
const DEVICE: IrqNumber = 42;

type Sim = Pipeline<SimArch>;

// =============================================================================
// Fixtures
// =============================================================================

fn boot_with(nr_cpus: usize, config: PipelineConfig) -> Arc<Sim> {
    let pipeline = Arc::new(Pipeline::new(SimArch::new(nr_cpus), config).unwrap());
    pipeline.init();
    pipeline.local_irq_enable_full();
    pipeline
}

fn boot() -> Arc<Sim> {
    boot_with(1, PipelineConfig::default())
}

/// Handler recording every IRQ it sees
fn recorder(ret: IrqReturn) -> (Arc<dyn IrqHandler>, Arc<Mutex<Vec<IrqNumber>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: Arc<dyn IrqHandler> = Arc::new(move |irq: IrqNumber| {
        sink.lock().push(irq);
        ret
    });
    (handler, seen)
}

/// What a handler observed when it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observed {
    stage: Stage,
    hard_off: bool,
    oob_stalled: bool,
    inband_stalled: bool,
}

fn observer(pipeline: &Arc<Sim>) -> (Arc<dyn IrqHandler>, Arc<Mutex<Vec<Observed>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let weak: Weak<Sim> = Arc::downgrade(pipeline);
    let handler: Arc<dyn IrqHandler> = Arc::new(move |_irq: IrqNumber| {
        let pipeline = weak.upgrade().unwrap();
        sink.lock().push(Observed {
            stage: pipeline.current_stage(),
            hard_off: pipeline.hard_irqs_disabled(),
            oob_stalled: pipeline.test_oob_stall(),
            inband_stalled: pipeline.test_inband_stall(),
        });
        IrqReturn::HANDLED
    });
    (handler, seen)
}

fn fire(pipeline: &Sim, irq: IrqNumber) -> bool {
    pipeline
        .arch()
        .hard_irq_frame(|| pipeline.handle_irq_pipelined(irq))
}

#[derive(Default)]
struct Companion {
    enters: AtomicUsize,
    exits: AtomicUsize,
    deny_idle: bool,
}

impl CompanionCore for Companion {
    fn irq_enter_pipeline(&self, _cpu: usize) {
        self.enters.fetch_add(1, Ordering::Relaxed);
    }

    fn irq_exit_pipeline(&self, _cpu: usize) {
        self.exits.fetch_add(1, Ordering::Relaxed);
    }

    fn cpuidle_control(&self, _cpu: usize) -> bool {
        !self.deny_idle
    }
}

// =============================================================================
// Construction
// =============================================================================

#[test]
fn test_new_starts_stalled_inband() {
    let pipeline = Pipeline::new(SimArch::new(2), PipelineConfig::default()).unwrap();
    assert!(!pipeline.is_enabled());
    for cpu in 0..2 {
        pipeline.arch().set_cpu(cpu);
        assert_eq!(pipeline.current_stage(), Stage::InBand);
        assert!(pipeline.test_inband_stall());
        assert!(!pipeline.test_oob_stall());
        assert!(!pipeline.stage_irqs_pending(Stage::InBand));
    }
    assert_eq!(pipeline.stage_name(Stage::InBand), Some("in-band"));
    assert_eq!(pipeline.stage_name(Stage::OutOfBand), None);
}

#[test]
fn test_new_rejects_bad_config() {
    let config = PipelineConfig::default().with_nr_irqs(IRQ_BITMAP_BITS + 1);
    assert_eq!(
        Pipeline::new(SimArch::new(1), config).unwrap_err(),
        PipelineError::InvalidConfig
    );
}

#[test]
fn test_boot_state() {
    let pipeline = boot();
    assert!(pipeline.is_enabled());
    assert!(!pipeline.hard_irqs_disabled());
    assert!(!pipeline.test_inband_stall());
    assert!(!pipeline.stage_disabled());
    assert_eq!(pipeline.preempt_count(), 0);
}

// =============================================================================
// Stage switching
// =============================================================================

#[test]
fn test_switch_to_current_stage_is_noop() {
    let pipeline = boot();
    let count = pipeline.preempt_count();

    pipeline.switch_to(pipeline.this_staged(Stage::InBand));
    assert_eq!(pipeline.preempt_count(), count);

    pipeline.switch_to(pipeline.this_staged(Stage::OutOfBand));
    assert!(pipeline.running_oob());
    pipeline.switch_to(pipeline.this_staged(Stage::OutOfBand));
    assert_eq!(pipeline.preempt_count(), count + crate::preempt::STAGE_OFFSET);
    assert_eq!(pipeline.current_irq_staged().stage(), Stage::OutOfBand);

    pipeline.switch_to(pipeline.this_staged(Stage::InBand));
    assert!(pipeline.running_inband());
    assert_eq!(pipeline.preempt_count(), count);
}

// =============================================================================
// Deferred delivery
// =============================================================================

#[test]
fn test_inband_irq_runs_on_exit_when_unstalled() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    assert!(fire(&pipeline, DEVICE));
    assert_eq!(*seen.lock(), [DEVICE]);
    assert!(!pipeline.hard_irqs_disabled());
    assert!(!pipeline.test_inband_stall());
    assert_eq!(pipeline.desc(DEVICE).unwrap().count(), 1);
    assert_eq!(pipeline.cpu_context(0).unwrap().rcu_nmi_nesting(), 0);
}

#[test]
fn test_stalled_inband_defers_and_coalesces() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    pipeline.inband_irq_disable();
    assert!(!fire(&pipeline, DEVICE));
    assert!(!fire(&pipeline, DEVICE));
    assert!(seen.lock().is_empty());
    assert!(pipeline.stage_irqs_pending(Stage::InBand));

    pipeline.inband_irq_enable();
    assert_eq!(*seen.lock(), [DEVICE]);
    assert!(!pipeline.stage_irqs_pending(Stage::InBand));
}

#[test]
fn test_sync_drains_in_ascending_order() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    for irq in [3, 7, 64, 900] {
        pipeline
            .request_irq(irq, handler.clone(), IrqLineFlags::empty(), "dev")
            .unwrap();
    }

    pipeline.inband_irq_disable();
    pipeline.hard_irq_disable();
    for irq in [7, 3, 900, 3, 64] {
        pipeline.irq_post_inband(irq);
    }
    pipeline.hard_irq_enable();

    pipeline.inband_irq_enable();
    assert_eq!(*seen.lock(), [3, 7, 64, 900]);
    assert!(!pipeline.stage_irqs_pending(Stage::InBand));
}

#[test]
fn test_inband_handler_context() {
    let pipeline = boot();
    let (handler, seen) = observer(&pipeline);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    fire(&pipeline, DEVICE);
    let seen_by = seen.lock()[0];
    assert_eq!(seen_by.stage, Stage::InBand);
    assert!(!seen_by.hard_off);
    assert!(seen_by.inband_stalled);
}

#[test]
fn test_irq_save_restore() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    let outer = pipeline.inband_irq_save();
    assert!(!outer);
    let inner = pipeline.inband_irq_save();
    assert!(inner);
    fire(&pipeline, DEVICE);

    pipeline.inband_irq_restore(inner);
    assert!(seen.lock().is_empty());
    assert!(pipeline.inband_irqs_disabled());

    pipeline.inband_irq_restore(outer);
    assert_eq!(seen.lock().len(), 1);
    assert!(!pipeline.inband_irqs_disabled());
}

#[test]
fn test_logs_are_per_cpu() {
    let pipeline = boot_with(2, PipelineConfig::default());
    pipeline.arch().set_cpu(1);
    pipeline.local_irq_enable_full();

    pipeline.arch().set_cpu(0);
    pipeline.inband_irq_disable();
    fire(&pipeline, DEVICE);
    assert!(pipeline.stage_irqs_pending(Stage::InBand));

    pipeline.arch().set_cpu(1);
    assert!(!pipeline.stage_irqs_pending(Stage::InBand));
    assert!(!pipeline.test_inband_stall());
}

// =============================================================================
// Out-of-band stage
// =============================================================================

#[test]
fn test_oob_irq_runs_immediately() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    let (handler, seen) = observer(&pipeline);
    pipeline
        .request_irq(TIMER, handler, IrqLineFlags::OOB, "timer")
        .unwrap();

    pipeline.inband_irq_disable();
    fire(&pipeline, TIMER);

    let seen_by = seen.lock()[0];
    assert_eq!(seen_by.stage, Stage::OutOfBand);
    assert!(seen_by.hard_off);
    assert!(seen_by.oob_stalled);
    assert!(pipeline.running_inband());
    assert!(!pipeline.test_oob_stall());
    assert!(!pipeline.hard_irqs_disabled());
    assert!(!pipeline.stage_irqs_pending(Stage::InBand));
}

#[test]
fn test_oob_line_without_stage_goes_inband() {
    let pipeline = boot();
    let (handler, seen) = observer(&pipeline);
    pipeline
        .request_irq(TIMER, handler, IrqLineFlags::OOB, "timer")
        .unwrap();

    fire(&pipeline, TIMER);
    assert_eq!(seen.lock()[0].stage, Stage::InBand);
}

#[test]
fn test_stalled_oob_defers_injected_irq() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    let (handler, seen) = observer(&pipeline);
    pipeline
        .request_irq(TIMER, handler, IrqLineFlags::OOB, "timer")
        .unwrap();

    pipeline.oob_irq_disable();
    pipeline.irq_inject_pipeline(TIMER).unwrap();
    assert!(seen.lock().is_empty());
    assert!(pipeline.stage_irqs_pending(Stage::OutOfBand));

    pipeline.oob_irq_enable();
    let seen_by = seen.lock()[0];
    assert_eq!(seen_by.stage, Stage::OutOfBand);
    assert!(seen_by.hard_off);
    assert!(pipeline.running_inband());
    assert!(!pipeline.hard_irqs_disabled());
}

#[test]
fn test_stalled_oob_holds_inband_log() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    let stalled = pipeline.oob_irq_save();
    pipeline.irq_post_inband(DEVICE);
    pipeline.synchronize_pipeline();
    assert!(seen.lock().is_empty());

    // Unstalling replays the out-of-band log only.
    pipeline.oob_irq_restore(stalled);
    assert!(!pipeline.oob_irqs_disabled());
    assert!(seen.lock().is_empty());

    pipeline.hard_irq_disable();
    pipeline.synchronize_pipeline();
    pipeline.hard_irq_enable();
    assert_eq!(*seen.lock(), [DEVICE]);
}

#[test]
fn test_enable_oob_stage_busy_and_unsupported() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    assert_eq!(pipeline.stage_name(Stage::OutOfBand), Some("EVL"));
    assert_eq!(pipeline.enable_oob_stage("other"), Err(PipelineError::Busy));

    pipeline.disable_oob_stage();
    assert!(!pipeline.oob_stage_present());
    pipeline.enable_oob_stage("EVL").unwrap();
    assert_eq!(pipeline.arch().oob_requests(), 2);

    let refused = boot();
    refused.arch().set_oob_supported(false);
    assert_eq!(
        refused.enable_oob_stage("EVL"),
        Err(PipelineError::NotSupported)
    );
    assert!(!refused.oob_stage_present());
}

#[test]
fn test_run_oob_call() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    let (handler, seen) = observer(&pipeline);
    pipeline
        .request_irq(TIMER, handler, IrqLineFlags::OOB, "timer")
        .unwrap();

    let ret = pipeline.run_oob_call(|| {
        assert!(pipeline.running_oob());
        assert!(pipeline.test_oob_stall());
        pipeline.irq_inject_pipeline(TIMER).unwrap();
        42
    });

    assert_eq!(ret, 42);
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].stage, Stage::OutOfBand);
    assert!(pipeline.running_inband());
    assert!(!pipeline.test_oob_stall());
    assert!(!pipeline.hard_irqs_disabled());
}

#[test]
fn test_run_oob_call_from_oob() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(TIMER, handler, IrqLineFlags::OOB, "timer")
        .unwrap();

    pipeline.hard_irq_disable();
    pipeline.switch_oob(pipeline.this_staged(Stage::OutOfBand));
    pipeline.irq_post_oob(TIMER);
    pipeline.hard_irq_enable();
    let before = pipeline.arch().status();

    let ret = pipeline.run_oob_call(|| {
        assert!(pipeline.test_oob_stall());
        7
    });

    assert_eq!(ret, 7);
    assert_eq!(*seen.lock(), vec![TIMER]);
    assert!(pipeline.running_oob());
    assert!(!pipeline.test_oob_stall());
    assert_eq!(pipeline.arch().status(), before);

    // A stalled caller gets nothing replayed.
    pipeline.hard_irq_disable();
    pipeline.stall_oob();
    pipeline.irq_post_oob(TIMER);
    let before = pipeline.arch().status();
    pipeline.run_oob_call(|| ());
    assert_eq!(seen.lock().len(), 1);
    assert!(pipeline.test_oob_stall());
    assert!(pipeline.stage_irqs_pending(Stage::OutOfBand));
    assert_eq!(pipeline.arch().status(), before);

    pipeline.unstall_oob();
    pipeline.sync_current_irq_stage();
    assert_eq!(seen.lock().len(), 2);
    pipeline.switch_inband(pipeline.this_staged(Stage::InBand));
    pipeline.hard_irq_enable();
}

#[test]
fn test_companion_hooks() {
    let pipeline = boot();
    let companion = Arc::new(Companion::default());
    pipeline.set_companion(Some(companion.clone()));

    fire(&pipeline, DEVICE);
    assert_eq!(companion.enters.load(Ordering::Relaxed), 1);
    assert_eq!(companion.exits.load(Ordering::Relaxed), 1);

    pipeline.set_companion(None);
    fire(&pipeline, DEVICE);
    assert_eq!(companion.enters.load(Ordering::Relaxed), 1);
}

// =============================================================================
// Quarantine
// =============================================================================

fn oob_line(pipeline: &Arc<Sim>, ret: IrqReturn) -> Arc<SimChip> {
    pipeline.enable_oob_stage("EVL").unwrap();
    let chip = Arc::new(SimChip::new("sim-pic"));
    pipeline.set_irq_chip(TIMER, chip.clone()).unwrap();
    let (handler, _) = recorder(ret);
    pipeline
        .request_irq(TIMER, handler, IrqLineFlags::OOB, "timer")
        .unwrap();
    chip
}

#[test]
fn test_unhandled_burst_quarantines() {
    let pipeline = boot();
    let chip = oob_line(&pipeline, IrqReturn::NONE);

    for _ in 0..DEFAULT_UNHANDLED_LIMIT {
        fire(&pipeline, TIMER);
    }
    let status = pipeline.irq_status(TIMER).unwrap();
    assert_eq!(status.unhandled, DEFAULT_UNHANDLED_LIMIT);
    assert!(status.flags.contains(IrqLineFlags::OOB));
    assert!(!chip.is_masked(TIMER));

    fire(&pipeline, TIMER);
    let status = pipeline.irq_status(TIMER).unwrap();
    assert!(!status.flags.contains(IrqLineFlags::OOB));
    assert!(status
        .state
        .contains(IrqState::DISABLED | IrqState::SPURIOUS_DISABLED));
    assert!(chip.is_masked(TIMER));

    pipeline.enable_irq(TIMER).unwrap();
    let status = pipeline.irq_status(TIMER).unwrap();
    assert!(status.state.is_empty());
    assert_eq!(status.unhandled, 0);
    assert!(!chip.is_masked(TIMER));
}

#[test]
fn test_quiet_window_resets_unhandled_count() {
    let pipeline = boot();
    oob_line(&pipeline, IrqReturn::NONE);

    for _ in 0..10 {
        fire(&pipeline, TIMER);
    }
    assert_eq!(pipeline.irq_status(TIMER).unwrap().unhandled, 10);

    pipeline.arch().advance_ticks(DEFAULT_UNHANDLED_WINDOW + 1);
    fire(&pipeline, TIMER);
    assert_eq!(pipeline.irq_status(TIMER).unwrap().unhandled, 0);
}

#[test]
fn test_handled_resets_unhandled_count() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    let claim = Arc::new(core::sync::atomic::AtomicBool::new(false));
    let flag = claim.clone();
    let handler: Arc<dyn IrqHandler> = Arc::new(move |_irq: IrqNumber| {
        if flag.load(Ordering::Relaxed) {
            IrqReturn::HANDLED
        } else {
            IrqReturn::NONE
        }
    });
    pipeline
        .request_irq(TIMER, handler, IrqLineFlags::OOB, "timer")
        .unwrap();

    for _ in 0..5 {
        fire(&pipeline, TIMER);
    }
    claim.store(true, Ordering::Relaxed);
    fire(&pipeline, TIMER);
    assert_eq!(pipeline.irq_status(TIMER).unwrap().unhandled, 0);
}

#[test]
fn test_bogus_status_quarantines() {
    let pipeline = boot();
    let chip = oob_line(&pipeline, IrqReturn::from_bits_retain(0x80));

    fire(&pipeline, TIMER);
    let status = pipeline.irq_status(TIMER).unwrap();
    assert!(status.state.contains(IrqState::SPURIOUS_DISABLED));
    assert!(!status.flags.contains(IrqLineFlags::OOB));
    assert!(chip.is_masked(TIMER));
}

#[test]
fn test_handled_with_wake_thread_is_claimed() {
    let pipeline = boot();
    let chip = oob_line(&pipeline, IrqReturn::HANDLED | IrqReturn::WAKE_THREAD);

    for _ in 0..3 {
        fire(&pipeline, TIMER);
    }
    let status = pipeline.irq_status(TIMER).unwrap();
    assert!(status.state.is_empty());
    assert!(status.flags.contains(IrqLineFlags::OOB));
    assert_eq!(status.unhandled, 0);
    assert!(!chip.is_masked(TIMER));
}

#[test]
fn test_wake_thread_alone_quarantines() {
    let pipeline = boot();
    let chip = oob_line(&pipeline, IrqReturn::WAKE_THREAD);

    fire(&pipeline, TIMER);
    let status = pipeline.irq_status(TIMER).unwrap();
    assert!(status.state.contains(IrqState::SPURIOUS_DISABLED));
    assert!(chip.is_masked(TIMER));
}

#[test]
fn test_configured_limit() {
    let config = PipelineConfig::default().with_unhandled_limit(2);
    let pipeline = boot_with(1, config);
    oob_line(&pipeline, IrqReturn::NONE);

    for _ in 0..3 {
        fire(&pipeline, TIMER);
    }
    assert!(pipeline
        .irq_status(TIMER)
        .unwrap()
        .state
        .contains(IrqState::SPURIOUS_DISABLED));
}

// =============================================================================
// Serialization
// =============================================================================

#[test]
fn test_line_serialized_across_cpus() {
    let pipeline = boot_with(2, PipelineConfig::default());
    pipeline.enable_oob_stage("EVL").unwrap();

    let depth = Arc::new(AtomicUsize::new(0));
    let max_depth = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let weak: Weak<Sim> = Arc::downgrade(&pipeline);
    let handler: Arc<dyn IrqHandler> = {
        let (depth, max_depth, calls) = (depth.clone(), max_depth.clone(), calls.clone());
        Arc::new(move |irq: IrqNumber| {
            let now = depth.fetch_add(1, Ordering::SeqCst) + 1;
            max_depth.fetch_max(now, Ordering::SeqCst);
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                // Same line raised on CPU 1 while CPU 0 is still busy with it.
                let pipeline = weak.upgrade().unwrap();
                pipeline.arch().set_cpu(1);
                fire(&pipeline, irq);
                pipeline.arch().set_cpu(0);
            }
            depth.fetch_sub(1, Ordering::SeqCst);
            IrqReturn::HANDLED
        })
    };
    pipeline
        .request_irq(TIMER, handler, IrqLineFlags::OOB, "timer")
        .unwrap();

    fire(&pipeline, TIMER);

    assert_eq!(max_depth.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let desc = pipeline.desc(TIMER).unwrap();
    assert_eq!(desc.count_on(0), 2);
    assert_eq!(desc.count_on(1), 0);
    assert!(pipeline.irq_status(TIMER).unwrap().state.is_empty());
}

#[test]
fn test_per_cpu_line_not_serialized() {
    let pipeline = boot_with(2, PipelineConfig::default());
    pipeline.enable_oob_stage("EVL").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let weak: Weak<Sim> = Arc::downgrade(&pipeline);
    let handler: Arc<dyn IrqHandler> = {
        let calls = calls.clone();
        Arc::new(move |irq: IrqNumber| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let pipeline = weak.upgrade().unwrap();
                pipeline.arch().set_cpu(1);
                fire(&pipeline, irq);
                pipeline.arch().set_cpu(0);
            }
            IrqReturn::HANDLED
        })
    };
    pipeline
        .request_irq(TIMER, handler, IrqLineFlags::OOB | IrqLineFlags::PER_CPU, "tick")
        .unwrap();

    fire(&pipeline, TIMER);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let desc = pipeline.desc(TIMER).unwrap();
    assert_eq!(desc.count_on(0), 1);
    assert_eq!(desc.count_on(1), 1);
}

// =============================================================================
// Locking the stage
// =============================================================================

#[test]
fn test_lock_stage_replays_on_unlock() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    let state = pipeline.test_and_lock_stage();
    assert_eq!(state.inband_stalled(), Some(false));
    assert!(!state.irqsoff());
    assert!(pipeline.hard_irqs_disabled());
    assert!(pipeline.test_inband_stall());

    pipeline.irq_post_inband(DEVICE);
    pipeline.unlock_stage(state);

    assert_eq!(*seen.lock(), [DEVICE]);
    assert!(!pipeline.test_inband_stall());
    assert!(!pipeline.hard_irqs_disabled());
}

#[test]
fn test_lock_stage_nested() {
    let pipeline = boot();
    let outer = pipeline.test_and_lock_stage();
    let inner = pipeline.test_and_lock_stage();
    assert!(inner.irqsoff());
    assert_eq!(inner.inband_stalled(), Some(true));

    pipeline.unlock_stage(inner);
    assert!(pipeline.test_inband_stall());
    assert!(pipeline.hard_irqs_disabled());

    pipeline.unlock_stage(outer);
    assert!(!pipeline.stage_disabled());
}

#[test]
fn test_lock_stage_from_oob() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    pipeline.hard_irq_disable();
    pipeline.switch_oob(pipeline.this_staged(Stage::OutOfBand));

    let state = pipeline.test_and_lock_stage();
    assert_eq!(state.inband_stalled(), None);
    assert!(state.irqsoff());
    pipeline.unlock_stage(state);
    assert!(!pipeline.test_inband_stall());

    pipeline.switch_inband(pipeline.this_staged(Stage::InBand));
    pipeline.hard_irq_enable();
}

#[test]
fn test_hybrid_lock_replays_on_release() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    let before = pipeline.arch().status();
    let lock = HybridSpinlock::new(0u32);
    {
        let mut guard = lock.lock_irqsave(&*pipeline);
        *guard += 1;
        assert!(pipeline.test_inband_stall());
        pipeline.irq_post_inband(DEVICE);
        assert!(seen.lock().is_empty());
    }

    assert_eq!(*seen.lock(), [DEVICE]);
    assert_eq!(pipeline.arch().status(), before);
    assert!(!pipeline.test_inband_stall());
    assert_eq!(pipeline.preempt_count(), 0);
}

#[test]
fn test_hard_preempt_disable() {
    let pipeline = boot();
    let flags = pipeline.hard_preempt_disable();
    assert!(pipeline.hard_irqs_disabled());
    assert_eq!(pipeline.preempt_count(), crate::preempt::PREEMPT_OFFSET);
    pipeline.hard_preempt_enable(flags);
    assert!(!pipeline.hard_irqs_disabled());
    assert_eq!(pipeline.preempt_count(), 0);
}

// =============================================================================
// Tasks, NMI, idle
// =============================================================================

#[test]
fn test_switch_task_stall() {
    let pipeline = boot();
    let prev = TaskStall::with_bits(StallBits::all());
    let next = TaskStall::new();

    pipeline.hard_irq_disable();
    pipeline.switch_task_stall(&prev, &next);
    assert_eq!(prev.load(), StallBits::empty());
    assert!(pipeline.test_inband_stall());

    pipeline.switch_task_stall(&next, &prev);
    assert!(!pipeline.test_inband_stall());
    pipeline.hard_irq_enable();
}

#[test]
fn test_nmi_restores_stall_bits() {
    let pipeline = boot();
    pipeline.hard_irq_disable();
    let before = pipeline.stall_bits();

    pipeline.nmi_enter();
    assert!(pipeline.in_nmi());
    pipeline.stall_oob();
    pipeline.stall_inband();
    pipeline.nmi_exit();

    assert!(!pipeline.in_nmi());
    assert_eq!(pipeline.stall_bits(), before);
    pipeline.hard_irq_enable();
}

#[test]
fn test_cpuidle_flushes_pending() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    pipeline.inband_irq_disable();
    pipeline.hard_irq_disable();
    pipeline.irq_post_inband(DEVICE);

    assert!(!pipeline.irq_cpuidle_enter());
    assert_eq!(*seen.lock(), [DEVICE]);
    assert!(pipeline.test_inband_stall());
    assert!(pipeline.hard_irqs_disabled());
}

#[test]
fn test_cpuidle_asks_companion() {
    let pipeline = boot();
    pipeline.inband_irq_disable();
    assert!(pipeline.irq_cpuidle_enter());

    pipeline.set_companion(Some(Arc::new(Companion {
        deny_idle: true,
        ..Companion::default()
    })));
    assert!(!pipeline.irq_cpuidle_enter());
    assert!(pipeline.hard_irqs_disabled());
}

#[test]
fn test_sync_inband_irqs_leaves_hard_off() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    pipeline.inband_irq_disable();
    fire(&pipeline, DEVICE);
    pipeline.hard_irq_disable();
    pipeline.unstall_inband();
    pipeline.hard_irq_enable();

    pipeline.sync_inband_irqs();
    assert_eq!(*seen.lock(), [DEVICE]);
    assert!(pipeline.hard_irqs_disabled());
}

// =============================================================================
// Lines
// =============================================================================

#[test]
fn test_request_irq_errors() {
    let pipeline = boot();
    let (handler, _) = recorder(IrqReturn::HANDLED);

    assert_eq!(
        pipeline.request_irq(
            DEFAULT_NR_IRQS as IrqNumber,
            handler.clone(),
            IrqLineFlags::empty(),
            "x"
        ),
        Err(PipelineError::InvalidIrq)
    );

    pipeline
        .request_irq(DEVICE, handler.clone(), IrqLineFlags::empty(), "dev")
        .unwrap();
    assert_eq!(
        pipeline.request_irq(DEVICE, handler.clone(), IrqLineFlags::empty(), "dev"),
        Err(PipelineError::AlreadyRegistered)
    );

    pipeline
        .set_irq_chip(TIMER, Arc::new(SimChip::unsafe_for_pipeline("legacy")))
        .unwrap();
    assert_eq!(
        pipeline.request_irq(TIMER, handler, IrqLineFlags::OOB, "timer"),
        Err(PipelineError::NotSupported)
    );
}

#[test]
fn test_free_irq() {
    let pipeline = boot();
    let (handler, _) = recorder(IrqReturn::HANDLED);
    assert!(matches!(
        pipeline.free_irq(DEVICE),
        Err(PipelineError::NotRegistered)
    ));

    pipeline
        .request_irq(DEVICE, handler.clone(), IrqLineFlags::empty(), "dev")
        .unwrap();
    assert_eq!(pipeline.irq_status(DEVICE).unwrap().name, "dev");
    pipeline.free_irq(DEVICE).unwrap();

    let status = pipeline.irq_status(DEVICE).unwrap();
    assert!(!status.registered);
    assert_eq!(status.name, "");
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();
}

#[test]
fn test_disabled_line_is_dropped() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(DEVICE, handler, IrqLineFlags::empty(), "dev")
        .unwrap();

    pipeline.disable_irq(DEVICE).unwrap();
    fire(&pipeline, DEVICE);
    assert!(seen.lock().is_empty());

    pipeline.enable_irq(DEVICE).unwrap();
    fire(&pipeline, DEVICE);
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_synthetic_irqs() {
    let pipeline = boot();
    let (handler, seen) = recorder(IrqReturn::HANDLED);

    let first = pipeline
        .create_synthetic_irq(handler.clone(), IrqLineFlags::empty(), "virq")
        .unwrap();
    let second = pipeline
        .create_synthetic_irq(handler, IrqLineFlags::empty(), "virq")
        .unwrap();
    assert_eq!(first, DEFAULT_NR_IRQS as IrqNumber - 1);
    assert_eq!(second, first - 1);
    assert!(pipeline
        .irq_status(first)
        .unwrap()
        .flags
        .contains(IrqLineFlags::SYNTHETIC));

    pipeline.irq_inject_pipeline(first).unwrap();
    assert_eq!(*seen.lock(), [first]);
    assert!(!pipeline.hard_irqs_disabled());
}

#[test]
fn test_synthetic_irqs_exhausted() {
    let config = PipelineConfig::default().with_nr_irqs(2);
    let pipeline = boot_with(1, config);
    let (handler, _) = recorder(IrqReturn::HANDLED);
    pipeline
        .request_irq(0, handler.clone(), IrqLineFlags::empty(), "dev")
        .unwrap();
    pipeline
        .create_synthetic_irq(handler.clone(), IrqLineFlags::empty(), "virq")
        .unwrap();
    assert_eq!(
        pipeline
            .create_synthetic_irq(handler, IrqLineFlags::empty(), "virq")
            .unwrap_err(),
        PipelineError::Busy
    );
}

#[test]
fn test_inject_invalid_irq() {
    let pipeline = boot();
    assert_eq!(
        pipeline.irq_inject_pipeline(DEFAULT_NR_IRQS as IrqNumber),
        Err(PipelineError::InvalidIrq)
    );
}

// =============================================================================
// Contract checks
// =============================================================================

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "bad post")]
fn test_post_with_hard_irqs_on_panics() {
    let pipeline = boot();
    pipeline.irq_post_inband(DEVICE);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "bad post")]
fn test_post_out_of_range_panics() {
    let pipeline = boot();
    pipeline.hard_irq_disable();
    pipeline.irq_post_inband(IRQ_BITMAP_BITS as IrqNumber);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "in-band only routine")]
fn test_inband_disable_from_oob_panics() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    pipeline.hard_irq_disable();
    pipeline.switch_oob(pipeline.this_staged(Stage::OutOfBand));
    pipeline.inband_irq_disable();
}

#[test]
#[cfg(debug_assertions)]
fn test_oops_mode_set_once() {
    let pipeline = boot();
    pipeline.hard_irq_disable();
    pipeline.switch_oob(pipeline.this_staged(Stage::OutOfBand));
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pipeline.check_inband_stage();
    }));
    assert!(caught.is_err());
    assert!(pipeline.is_oopsing());

    // Silent from now on.
    pipeline.check_inband_stage();
}

#[test]
fn test_irq_pipeline_oops_from_oob() {
    let pipeline = boot();
    pipeline.enable_oob_stage("EVL").unwrap();
    pipeline.hard_irq_disable();
    pipeline.switch_oob(pipeline.this_staged(Stage::OutOfBand));
    pipeline.hard_irq_enable();

    pipeline.irq_pipeline_oops();

    assert!(pipeline.is_oopsing());
    assert!(pipeline.hard_irqs_disabled());
    assert!(pipeline.test_inband_stall());
    pipeline.check_inband_stage();
}
