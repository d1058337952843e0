//! The interrupt dispatcher.
//!
//! Each line keeps an ordered list of registrations. [`IrqDispatcher::raise`]
//! runs the immediate handlers of an unmasked line until one claims the
//! interrupt, then hands `WakeDeferred` work to the registration's deferred
//! context: the shared worker pool, a dedicated thread, or the coalescing
//! timer.
//!
//! Lock order: line table, then line state, then registration activity.
//! Handlers never run with any of them held.

use core::any::Any;
use core::time::Duration;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use platdev_core::config::IrqConfig;
use platdev_core::{DeviceId, Event, EventKind, EventSink};

use crate::IrqError;
use crate::executor::{Executor, Job, TimerQueue, WorkerPool};
use crate::policy::{IrqPolicy, IrqReturn, Sharing, Threading};

/// Immediate (top-half) handler. Must not block.
pub type ImmediateHandler = Arc<dyn Fn() -> IrqReturn + Send + Sync>;

/// Deferred (bottom-half) handler. Receives the number of `WakeDeferred`
/// events folded into this run; may block.
pub type DeferredHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// Result of [`IrqDispatcher::raise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseOutcome {
    /// A handler claimed the interrupt.
    Claimed,
    /// No handler claimed the interrupt.
    Unclaimed,
    /// The line is masked, or the only candidates are disabled; the
    /// interrupt was held for later delivery.
    Latched,
}

// ---- Registrations ----------------------------------------------------------

#[derive(Debug, Default)]
struct Activity {
    immediate: usize,
    deferred: usize,
    retired: bool,
    disabled: bool,
    pending: bool,
}

impl Activity {
    fn is_idle(&self) -> bool {
        self.immediate == 0 && self.deferred == 0
    }
}

struct Action {
    id: u64,
    line: u32,
    device: Option<DeviceId>,
    immediate: ImmediateHandler,
    deferred: Option<DeferredHandler>,
    one_shot: bool,
    coalesce: Option<Duration>,
    executor: Executor,
    activity: Mutex<Activity>,
    idle: Condvar,
    coalesced: AtomicU32,
    timer_armed: AtomicBool,
}

impl Action {
    fn is_retired(&self) -> bool {
        self.activity.lock().retired
    }

    /// Accounts for one immediate call. Fails while disabled.
    fn enter_immediate(&self) -> bool {
        let mut activity = self.activity.lock();
        if activity.disabled {
            return false;
        }
        activity.immediate += 1;
        true
    }

    fn exit_immediate(&self) {
        let mut activity = self.activity.lock();
        activity.immediate -= 1;
        if activity.is_idle() {
            self.idle.notify_all();
        }
    }

    /// Holds an unclaimed interrupt for delivery on enable. Returns `false`
    /// if the registration has been enabled in the meantime.
    fn hold_pending(&self) -> bool {
        let mut activity = self.activity.lock();
        if activity.disabled {
            activity.pending = true;
        }
        activity.disabled
    }

    /// Accounts for one queued or armed deferred run. Fails once retired.
    fn begin_deferred(&self) -> bool {
        let mut activity = self.activity.lock();
        if activity.retired {
            return false;
        }
        activity.deferred += 1;
        true
    }

    fn end_deferred(&self) {
        let mut activity = self.activity.lock();
        activity.deferred -= 1;
        if activity.is_idle() {
            self.idle.notify_all();
        }
    }

    fn retire(&self) {
        self.activity.lock().retired = true;
    }

    fn wait_idle(&self) {
        let mut activity = self.activity.lock();
        while !activity.is_idle() {
            self.idle.wait(&mut activity);
        }
    }
}

/// A live handler registration.
///
/// Dropping it unregisters the handlers; see [`IrqDispatcher::unregister`].
pub struct IrqRegistration {
    shared: Arc<Shared>,
    action: Arc<Action>,
    active: bool,
}

impl core::fmt::Debug for IrqRegistration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqRegistration")
            .field("line", &self.action.line)
            .field("id", &self.action.id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl IrqRegistration {
    /// The registered line.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.action.line
    }

    /// Device the registration reports events for.
    #[must_use]
    pub fn device(&self) -> Option<DeviceId> {
        self.action.device
    }

    /// Effective coalescing interval, if any.
    #[must_use]
    pub fn coalesce_interval(&self) -> Option<Duration> {
        self.action.coalesce
    }

    /// Stops calling this registration's immediate handler.
    ///
    /// Other holders of a shared line keep receiving interrupts. An
    /// interrupt that no enabled holder claims while this one is disabled is
    /// held and delivered once by [`enable`](Self::enable). Does not wait for
    /// a handler that is already running; see
    /// [`synchronize`](Self::synchronize).
    pub fn disable(&self) {
        self.action.activity.lock().disabled = true;
        log::trace!(target: "platdev::irq", "line {}: handler {} disabled", self.action.line, self.action.id);
    }

    /// Undoes [`disable`](Self::disable), delivering a held interrupt once.
    pub fn enable(&self) {
        let pending = {
            let mut activity = self.action.activity.lock();
            activity.disabled = false;
            core::mem::take(&mut activity.pending)
        };
        log::trace!(target: "platdev::irq", "line {}: handler {} enabled", self.action.line, self.action.id);
        if pending && self.active {
            log::trace!(target: "platdev::irq", "line {}: redelivering held interrupt", self.action.line);
            self.shared.raise(self.action.line);
        }
    }

    /// `true` between [`disable`](Self::disable) and
    /// [`enable`](Self::enable).
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.action.activity.lock().disabled
    }

    /// Waits until neither handler of this registration is running and no
    /// deferred work for it is queued or armed.
    ///
    /// Must not be called from the registration's own handlers.
    pub fn synchronize(&self) {
        self.action.wait_idle();
    }

    fn unregister_now(&mut self) {
        if self.active {
            self.active = false;
            self.shared.unregister(&self.action);
        }
    }
}

impl Drop for IrqRegistration {
    fn drop(&mut self) {
        self.unregister_now();
    }
}

// ---- Lines ------------------------------------------------------------------

#[derive(Default)]
struct LineState {
    actions: Vec<Arc<Action>>,
    sharing: Sharing,
    one_shot: bool,
    oneshot_masks: u32,
    latched: bool,
}

struct Line {
    number: u32,
    state: Mutex<LineState>,
}

// ---- Dispatcher -------------------------------------------------------------

struct Shared {
    lines: Mutex<BTreeMap<u32, Arc<Line>>>,
    events: Arc<dyn EventSink>,
    pool: WorkerPool,
    timers: Arc<TimerQueue>,
    default_coalesce: Option<Duration>,
    next_id: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.timers.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl Shared {
    /// Looks up a line with at least one registration.
    fn find_line(&self, number: u32) -> Option<Arc<Line>> {
        self.lines.lock().get(&number).cloned()
    }

    fn emit(&self, kind: EventKind, device: Option<DeviceId>, message: String) {
        self.events
            .emit(Event::new(kind, message).with_device(device));
    }

    fn unclaimed(&self, number: u32, device: Option<DeviceId>) -> RaiseOutcome {
        self.emit(
            EventKind::UnclaimedInterrupt,
            device,
            format!("line {number}: no handler claimed the interrupt"),
        );
        RaiseOutcome::Unclaimed
    }

    fn raise(self: &Arc<Self>, number: u32) -> RaiseOutcome {
        let Some(line) = self.find_line(number) else {
            return self.unclaimed(number, None);
        };
        // The one-shot mask is taken in the same critical section as the
        // check, so two raises cannot both pass it.
        let (live, skipped, masked) = {
            let mut state = line.state.lock();
            if state.oneshot_masks > 0 {
                state.latched = true;
                log::trace!(target: "platdev::irq", "line {number}: latched while masked");
                return RaiseOutcome::Latched;
            }
            let mut live = Vec::with_capacity(state.actions.len());
            let mut skipped = Vec::new();
            for action in &state.actions {
                if action.enter_immediate() {
                    live.push(Arc::clone(action));
                } else {
                    skipped.push(Arc::clone(action));
                }
            }
            let masked = state.one_shot && !live.is_empty();
            if masked {
                state.oneshot_masks += 1;
            }
            (live, skipped, masked)
        };

        let mut claimed = false;
        let mut handed_off = false;
        for action in &live {
            if !claimed {
                let ret = self.run_immediate(action);
                claimed = ret.is_claimed();
                if ret == IrqReturn::WakeDeferred {
                    handed_off = self.wake_deferred(&line, action);
                }
            }
            action.exit_immediate();
        }
        if masked && !handed_off {
            self.release_oneshot(&line);
        }

        if claimed {
            return RaiseOutcome::Claimed;
        }
        let mut held = false;
        for action in &skipped {
            held |= action.hold_pending();
        }
        if held {
            log::trace!(target: "platdev::irq", "line {number}: held for a disabled handler");
            return RaiseOutcome::Latched;
        }
        if !skipped.is_empty() {
            // Enabled while this raise was running.
            return self.raise(number);
        }
        let device = match live.as_slice() {
            [only] => only.device,
            _ => None,
        };
        self.unclaimed(number, device)
    }

    fn run_immediate(&self, action: &Action) -> IrqReturn {
        match catch_unwind(AssertUnwindSafe(|| (action.immediate)())) {
            Ok(ret) => ret,
            Err(payload) => {
                self.emit(
                    EventKind::ImmediateHandlerPanicked,
                    action.device,
                    format!(
                        "line {}: immediate handler panicked: {}",
                        action.line,
                        panic_message(payload.as_ref())
                    ),
                );
                IrqReturn::NotMine
            }
        }
    }

    /// Hands `WakeDeferred` work to the deferred context. Returns `true` if
    /// the deferred run took over the line's one-shot mask.
    fn wake_deferred(self: &Arc<Self>, line: &Arc<Line>, action: &Arc<Action>) -> bool {
        if action.deferred.is_none() {
            return false;
        }
        if let Some(interval) = action.coalesce {
            action.coalesced.fetch_add(1, Ordering::AcqRel);
            if !action.timer_armed.swap(true, Ordering::AcqRel) {
                if !action.begin_deferred() {
                    return false;
                }
                let (shared, line, act) = (Arc::clone(self), Arc::clone(line), Arc::clone(action));
                self.timers.arm(
                    Instant::now() + interval,
                    action.id,
                    Box::new(move || shared.flush_coalesced(&line, &act)),
                );
            }
            return false;
        }

        if !action.begin_deferred() {
            return false;
        }
        self.submit_deferred(line, action, 1);
        action.one_shot
    }

    fn flush_coalesced(self: &Arc<Self>, line: &Arc<Line>, action: &Arc<Action>) {
        action.timer_armed.store(false, Ordering::Release);
        let count = action.coalesced.swap(0, Ordering::AcqRel);
        self.submit_deferred(line, action, count);
    }

    /// Queues a deferred run that has already been accounted for with
    /// [`Action::begin_deferred`].
    fn submit_deferred(self: &Arc<Self>, line: &Arc<Line>, action: &Arc<Action>, count: u32) {
        let job: Job = {
            let (shared, line, action) = (Arc::clone(self), Arc::clone(line), Arc::clone(action));
            Box::new(move || shared.run_deferred(&line, &action, count))
        };
        if !action.executor.submit(job) {
            self.finish_deferred(line, action);
        }
    }

    fn run_deferred(self: &Arc<Self>, line: &Arc<Line>, action: &Arc<Action>, count: u32) {
        if count > 0 && !action.is_retired() {
            if let Some(deferred) = &action.deferred {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| deferred(count))) {
                    self.emit(
                        EventKind::DeferredHandlerPanicked,
                        action.device,
                        format!(
                            "line {}: deferred handler panicked: {}",
                            action.line,
                            panic_message(payload.as_ref())
                        ),
                    );
                }
            }
        }
        self.finish_deferred(line, action);
    }

    fn finish_deferred(self: &Arc<Self>, line: &Arc<Line>, action: &Arc<Action>) {
        if action.one_shot {
            self.release_oneshot(line);
        }
        action.end_deferred();
    }

    /// Drops one one-shot mask and delivers a latched interrupt once when
    /// the line becomes unmasked.
    fn release_oneshot(self: &Arc<Self>, line: &Arc<Line>) {
        let redeliver = {
            let mut state = line.state.lock();
            state.oneshot_masks = state.oneshot_masks.saturating_sub(1);
            state.oneshot_masks == 0 && core::mem::take(&mut state.latched)
        };
        if redeliver {
            log::trace!(target: "platdev::irq", "line {}: redelivering latched interrupt", line.number);
            self.raise(line.number);
        }
    }

    fn unregister(&self, action: &Arc<Action>) {
        {
            let mut lines = self.lines.lock();
            if let Some(line) = lines.get(&action.line).cloned() {
                let mut state = line.state.lock();
                state.actions.retain(|a| a.id != action.id);
                if state.actions.is_empty() {
                    state.latched = false;
                    drop(state);
                    lines.remove(&action.line);
                }
            }
        }

        action.retire();
        for _ in 0..self.timers.cancel(action.id) {
            action.end_deferred();
        }
        if action.executor.thread_id() == Some(thread::current().id()) {
            log::warn!(
                target: "platdev::irq",
                "line {}: handler {} unregistered from its own thread; not waiting",
                action.line,
                action.id
            );
        } else {
            action.wait_idle();
        }
        action.executor.shutdown();
        log::debug!(target: "platdev::irq", "line {}: unregistered handler {}", action.line, action.id);
    }
}

/// Routes raised interrupts to registered handlers.
///
/// Cheap to clone; clones share the line table and worker pool.
#[derive(Clone)]
pub struct IrqDispatcher {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for IrqDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqDispatcher")
            .field("lines", &self.shared.lines.lock().len())
            .finish_non_exhaustive()
    }
}

impl IrqDispatcher {
    /// Starts a dispatcher: the deferred worker pool and the coalescing
    /// timer thread.
    ///
    /// # Errors
    ///
    /// Returns [`IrqError::ThreadSpawn`] if a thread cannot be started.
    pub fn new(config: &IrqConfig, events: Arc<dyn EventSink>) -> Result<Self, IrqError> {
        let pool = WorkerPool::new(config.deferred_workers).map_err(IrqError::ThreadSpawn)?;
        let timers = TimerQueue::start().map_err(IrqError::ThreadSpawn)?;
        log::debug!(
            target: "platdev::irq",
            "dispatcher started with {} deferred workers",
            config.deferred_workers.max(1)
        );
        Ok(Self {
            shared: Arc::new(Shared {
                lines: Mutex::new(BTreeMap::new()),
                events,
                pool,
                timers,
                default_coalesce: config.default_coalesce_interval(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Registers handlers on `line`.
    ///
    /// # Errors
    ///
    /// - [`IrqError::InvalidPolicy`] for a threaded, one-shot, or coalescing
    ///   policy without a deferred handler, a one-shot policy with
    ///   coalescing, or a zero coalescing interval.
    /// - [`IrqError::LineAlreadyExclusive`] if an exclusive holder owns the
    ///   line.
    /// - [`IrqError::LineBusy`] for an exclusive request on an occupied line.
    /// - [`IrqError::PolicyMismatch`] if shared holders disagree on one-shot.
    /// - [`IrqError::ThreadSpawn`] if a dedicated thread cannot be started.
    pub fn register(
        &self,
        line: u32,
        immediate: ImmediateHandler,
        deferred: Option<DeferredHandler>,
        policy: IrqPolicy,
    ) -> Result<IrqRegistration, IrqError> {
        let one_shot = policy.threading == Threading::OneShot;
        if deferred.is_none() {
            if policy.threading.is_dedicated() {
                return Err(IrqError::InvalidPolicy("threaded registration needs a deferred handler"));
            }
            if policy.coalesce.is_some() {
                return Err(IrqError::InvalidPolicy("coalescing needs a deferred handler"));
            }
        }
        if one_shot && policy.coalesce.is_some() {
            return Err(IrqError::InvalidPolicy("one-shot registrations cannot coalesce"));
        }
        if policy.coalesce == Some(Duration::ZERO) {
            return Err(IrqError::InvalidPolicy("coalescing interval must be non-zero"));
        }
        let coalesce = match policy.coalesce {
            Some(interval) => Some(interval),
            None if deferred.is_some() && !one_shot => self.shared.default_coalesce,
            None => None,
        };

        let mut lines = self.shared.lines.lock();
        let line_ref = match lines.get(&line) {
            Some(existing) => Arc::clone(existing),
            None => Arc::new(Line {
                number: line,
                state: Mutex::new(LineState::default()),
            }),
        };
        let mut state = line_ref.state.lock();
        if !state.actions.is_empty() {
            if state.sharing == Sharing::Exclusive {
                return Err(IrqError::LineAlreadyExclusive { line });
            }
            if policy.sharing == Sharing::Exclusive {
                return Err(IrqError::LineBusy { line });
            }
            if state.one_shot != one_shot {
                return Err(IrqError::PolicyMismatch { line });
            }
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let executor = if policy.threading.is_dedicated() {
            Executor::dedicated(format!("irq/{line}-{id}")).map_err(IrqError::ThreadSpawn)?
        } else {
            Executor::Pool(self.shared.pool.sender())
        };
        let action = Arc::new(Action {
            id,
            line,
            device: policy.device,
            immediate,
            deferred,
            one_shot,
            coalesce,
            executor,
            activity: Mutex::new(Activity::default()),
            idle: Condvar::new(),
            coalesced: AtomicU32::new(0),
            timer_armed: AtomicBool::new(false),
        });
        state.sharing = policy.sharing;
        state.one_shot = one_shot;
        state.actions.push(Arc::clone(&action));
        drop(state);
        lines.entry(line).or_insert_with(|| Arc::clone(&line_ref));
        drop(lines);

        log::debug!(
            target: "platdev::irq",
            "line {line}: registered handler {id} ({:?}, {:?}, coalesce {:?})",
            policy.sharing,
            policy.threading,
            coalesce
        );
        Ok(IrqRegistration {
            shared: Arc::clone(&self.shared),
            action,
            active: true,
        })
    }

    /// Removes a registration. Returns once none of its handlers is running
    /// and no deferred work for it is queued or armed.
    ///
    /// Must not be called from the registration's own immediate handler, or
    /// from its deferred handler on the shared pool.
    pub fn unregister(&self, mut registration: IrqRegistration) {
        registration.unregister_now();
    }

    /// Signals an interrupt on `line`.
    pub fn raise(&self, line: u32) -> RaiseOutcome {
        self.shared.raise(line)
    }

    /// `true` while a one-shot handler holds `line` masked.
    #[must_use]
    pub fn is_masked(&self, line: u32) -> bool {
        self.shared
            .find_line(line)
            .is_some_and(|l| l.state.lock().oneshot_masks > 0)
    }

    /// Waits until no handler registered on `line` is running or has
    /// deferred work pending.
    pub fn synchronize(&self, line: u32) {
        let Some(line_ref) = self.shared.find_line(line) else {
            return;
        };
        let actions = line_ref.state.lock().actions.clone();
        for action in actions {
            action.wait_idle();
        }
    }

    /// Number of registrations on `line`.
    #[must_use]
    pub fn holders(&self, line: u32) -> usize {
        self.shared
            .lines
            .lock()
            .get(&line)
            .map_or(0, |l| l.state.lock().actions.len())
    }

    /// Number of lines with at least one registration.
    #[must_use]
    pub fn active_lines(&self) -> usize {
        self.shared.lines.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, unbounded};
    use platdev_core::event::RecordingSink;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    fn dispatcher() -> (IrqDispatcher, Arc<RecordingSink>) {
        let events = Arc::new(RecordingSink::new());
        let irq = IrqDispatcher::new(&IrqConfig::default(), events.clone()).unwrap();
        (irq, events)
    }

    fn returning(ret: IrqReturn) -> ImmediateHandler {
        Arc::new(move || ret)
    }

    fn counting(ret: IrqReturn, calls: &Arc<AtomicUsize>) -> ImmediateHandler {
        let calls = Arc::clone(calls);
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            ret
        })
    }

    fn noop_deferred() -> DeferredHandler {
        Arc::new(|_count: u32| {})
    }

    #[test]
    fn exclusive_line_rejects_second_holder() {
        let (irq, _) = dispatcher();
        let _a = irq
            .register(3, returning(IrqReturn::Handled), None, IrqPolicy::exclusive())
            .unwrap();
        assert_eq!(
            irq.register(3, returning(IrqReturn::Handled), None, IrqPolicy::shared())
                .unwrap_err(),
            IrqError::LineAlreadyExclusive { line: 3 }
        );
    }

    #[test]
    fn sharing_conflicts() {
        let (irq, _) = dispatcher();
        let _a = irq
            .register(4, returning(IrqReturn::NotMine), None, IrqPolicy::shared())
            .unwrap();
        assert_eq!(
            irq.register(4, returning(IrqReturn::Handled), None, IrqPolicy::exclusive())
                .unwrap_err(),
            IrqError::LineBusy { line: 4 }
        );
        assert_eq!(
            irq.register(
                4,
                returning(IrqReturn::Handled),
                Some(noop_deferred()),
                IrqPolicy::shared().threading(Threading::OneShot)
            )
            .unwrap_err(),
            IrqError::PolicyMismatch { line: 4 }
        );
        assert!(
            irq.register(4, returning(IrqReturn::Handled), None, IrqPolicy::shared())
                .is_ok()
        );
    }

    #[test]
    fn invalid_policies() {
        let (irq, _) = dispatcher();
        for policy in [
            IrqPolicy::exclusive().threading(Threading::OneShot),
            IrqPolicy::exclusive().threading(Threading::Always),
            IrqPolicy::exclusive().coalesce(Duration::from_millis(1)),
        ] {
            assert!(matches!(
                irq.register(1, returning(IrqReturn::Handled), None, policy),
                Err(IrqError::InvalidPolicy(_))
            ));
        }
        assert!(matches!(
            irq.register(
                1,
                returning(IrqReturn::Handled),
                Some(noop_deferred()),
                IrqPolicy::exclusive()
                    .threading(Threading::OneShot)
                    .coalesce(Duration::from_millis(1))
            ),
            Err(IrqError::InvalidPolicy(_))
        ));
        assert_eq!(irq.holders(1), 0);
    }

    #[test]
    fn line_is_free_after_unregister() {
        let (irq, _) = dispatcher();
        let a = irq
            .register(5, returning(IrqReturn::Handled), None, IrqPolicy::exclusive())
            .unwrap();
        irq.unregister(a);
        assert_eq!(irq.holders(5), 0);
        let b = irq.register(5, returning(IrqReturn::Handled), None, IrqPolicy::exclusive());
        assert!(b.is_ok());
    }

    #[test]
    fn shared_line_stops_at_first_claimer() {
        let (irq, _) = dispatcher();
        let (a, b, c) = (
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let _ra = irq
            .register(9, counting(IrqReturn::NotMine, &a), None, IrqPolicy::shared())
            .unwrap();
        let _rb = irq
            .register(9, counting(IrqReturn::Handled, &b), None, IrqPolicy::shared())
            .unwrap();
        let _rc = irq
            .register(9, counting(IrqReturn::Handled, &c), None, IrqPolicy::shared())
            .unwrap();

        assert_eq!(irq.raise(9), RaiseOutcome::Claimed);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(c.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unclaimed_interrupt_is_reported() {
        let (irq, events) = dispatcher();
        let _r = irq
            .register(
                2,
                returning(IrqReturn::NotMine),
                None,
                IrqPolicy::shared().for_device(DeviceId::new(7)),
            )
            .unwrap();
        assert_eq!(irq.raise(2), RaiseOutcome::Unclaimed);
        assert_eq!(irq.raise(30), RaiseOutcome::Unclaimed);
        assert_eq!(events.count(EventKind::UnclaimedInterrupt), 2);
        assert_eq!(events.events()[0].device, Some(DeviceId::new(7)));
        assert_eq!(events.events()[1].device, None);
    }

    #[test]
    fn lookups_do_not_create_lines() {
        let (irq, _) = dispatcher();
        let reg = irq
            .register(3, returning(IrqReturn::Handled), None, IrqPolicy::exclusive())
            .unwrap();
        assert_eq!(irq.active_lines(), 1);
        for line in 100..200 {
            assert_eq!(irq.raise(line), RaiseOutcome::Unclaimed);
            assert!(!irq.is_masked(line));
            irq.synchronize(line);
        }
        assert_eq!(irq.active_lines(), 1);
        irq.unregister(reg);
        assert_eq!(irq.active_lines(), 0);
    }

    #[test]
    fn deferred_runs_on_pool() {
        let (irq, _) = dispatcher();
        let (tx, rx) = unbounded();
        let deferred: DeferredHandler = Arc::new(move |count: u32| tx.send(count).unwrap());
        let _reg = irq
            .register(6, returning(IrqReturn::WakeDeferred), Some(deferred), IrqPolicy::exclusive())
            .unwrap();
        for _ in 0..3 {
            assert_eq!(irq.raise(6), RaiseOutcome::Claimed);
        }
        for _ in 0..3 {
            assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
        }
        irq.synchronize(6);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn one_shot_masks_until_deferred_returns() {
        let (irq, _) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = bounded::<()>(0);
        let deferred: DeferredHandler = {
            let runs = Arc::clone(&runs);
            Arc::new(move |_count: u32| {
                runs.fetch_add(1, Ordering::SeqCst);
                started_tx.send(()).unwrap();
                release_rx.recv_timeout(WAIT).unwrap();
            })
        };
        let _reg = irq
            .register(
                11,
                counting(IrqReturn::WakeDeferred, &calls),
                Some(deferred),
                IrqPolicy::exclusive().threading(Threading::OneShot),
            )
            .unwrap();

        assert_eq!(irq.raise(11), RaiseOutcome::Claimed);
        started_rx.recv_timeout(WAIT).unwrap();
        assert!(irq.is_masked(11));
        for _ in 0..3 {
            assert_eq!(irq.raise(11), RaiseOutcome::Latched);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Unmasking delivers the latched events once, which masks again.
        release_tx.send(()).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        release_tx.send(()).unwrap();
        irq.synchronize(11);

        assert!(!irq.is_masked(11));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn one_shot_immediate_never_overlaps_its_deferred_run() {
        let (irq, _) = dispatcher();
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let immediate: ImmediateHandler = {
            let (busy, overlaps) = (Arc::clone(&busy), Arc::clone(&overlaps));
            Arc::new(move || {
                if busy.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                IrqReturn::WakeDeferred
            })
        };
        let deferred: DeferredHandler = {
            let (busy, runs) = (Arc::clone(&busy), Arc::clone(&runs));
            Arc::new(move |_count: u32| {
                runs.fetch_add(1, Ordering::SeqCst);
                thread::yield_now();
                busy.store(false, Ordering::SeqCst);
            })
        };
        let _reg = irq
            .register(
                21,
                immediate,
                Some(deferred),
                IrqPolicy::exclusive().threading(Threading::OneShot),
            )
            .unwrap();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        irq.raise(21);
                    }
                });
            }
        });
        irq.synchronize(21);

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert!(!busy.load(Ordering::SeqCst));
        assert!(!irq.is_masked(21));
    }

    #[test]
    fn disabled_registration_holds_and_redelivers_once() {
        let (irq, events) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = irq
            .register(12, counting(IrqReturn::Handled, &calls), None, IrqPolicy::exclusive())
            .unwrap();
        reg.disable();
        assert!(reg.is_disabled());
        assert_eq!(irq.raise(12), RaiseOutcome::Latched);
        assert_eq!(irq.raise(12), RaiseOutcome::Latched);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        reg.enable();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        reg.enable();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.count(EventKind::UnclaimedInterrupt), 0);
    }

    #[test]
    fn disabling_one_holder_leaves_shared_line_live() {
        let (irq, _) = dispatcher();
        let (a, b) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let ra = irq
            .register(13, counting(IrqReturn::Handled, &a), None, IrqPolicy::shared())
            .unwrap();
        let _rb = irq
            .register(13, counting(IrqReturn::Handled, &b), None, IrqPolicy::shared())
            .unwrap();
        ra.disable();
        ra.synchronize();
        for _ in 0..3 {
            assert_eq!(irq.raise(13), RaiseOutcome::Claimed);
        }
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 3);
        // Claimed by the other holder, so nothing is held for `ra`.
        ra.enable();
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(irq.raise(13), RaiseOutcome::Claimed);
        assert_eq!(a.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn coalesced_events_fold_into_few_runs() {
        let (irq, _) = dispatcher();
        let runs = Arc::new(AtomicU64::new(0));
        let total = Arc::new(AtomicU64::new(0));
        let deferred: DeferredHandler = {
            let (runs, total) = (Arc::clone(&runs), Arc::clone(&total));
            Arc::new(move |count: u32| {
                runs.fetch_add(1, Ordering::SeqCst);
                total.fetch_add(u64::from(count), Ordering::SeqCst);
            })
        };
        let _reg = irq
            .register(
                20,
                returning(IrqReturn::WakeDeferred),
                Some(deferred),
                IrqPolicy::exclusive().coalesce(Duration::from_millis(10)),
            )
            .unwrap();

        // 1000 events at 10 kHz.
        let start = Instant::now();
        for i in 0..1000u64 {
            let due = start + Duration::from_micros(100 * i);
            while Instant::now() < due {
                thread::yield_now();
            }
            irq.raise(20);
        }
        let elapsed = start.elapsed();
        irq.synchronize(20);

        let runs = runs.load(Ordering::SeqCst);
        assert_eq!(total.load(Ordering::SeqCst), 1000);
        assert!(runs >= 1);
        let bound = u64::try_from(elapsed.as_millis() / 10).unwrap() + 2;
        assert!(runs <= bound, "{runs} deferred runs in {elapsed:?}");
    }

    #[test]
    fn one_millisecond_coalescing_conserves_events() {
        let (irq, _) = dispatcher();
        let runs = Arc::new(AtomicU64::new(0));
        let total = Arc::new(AtomicU64::new(0));
        let deferred: DeferredHandler = {
            let (runs, total) = (Arc::clone(&runs), Arc::clone(&total));
            Arc::new(move |count: u32| {
                runs.fetch_add(1, Ordering::SeqCst);
                total.fetch_add(u64::from(count), Ordering::SeqCst);
            })
        };
        let _reg = irq
            .register(
                22,
                returning(IrqReturn::WakeDeferred),
                Some(deferred),
                IrqPolicy::exclusive().coalesce(Duration::from_millis(1)),
            )
            .unwrap();

        // 1000 events at 10 kHz: 100 ms of raising.
        let start = Instant::now();
        for i in 0..1000u64 {
            let due = start + Duration::from_micros(100 * i);
            while Instant::now() < due {
                thread::yield_now();
            }
            irq.raise(22);
        }
        irq.synchronize(22);
        let elapsed = start.elapsed();

        // Each run follows a 1 ms window that opened with an event, so there
        // is at most one run per elapsed millisecond, plus the final flush.
        let runs = runs.load(Ordering::SeqCst);
        assert_eq!(total.load(Ordering::SeqCst), 1000);
        let bound = u64::try_from(elapsed.as_millis()).unwrap() + 2;
        assert!(runs <= bound, "{runs} deferred runs in {elapsed:?}");
    }

    #[test]
    fn default_coalescing_from_config() {
        let config = IrqConfig {
            coalesce_interval_us: Some(500),
            ..IrqConfig::default()
        };
        let irq = IrqDispatcher::new(&config, Arc::new(RecordingSink::new())).unwrap();
        let with = irq
            .register(1, returning(IrqReturn::WakeDeferred), Some(noop_deferred()), IrqPolicy::exclusive())
            .unwrap();
        let without = irq
            .register(2, returning(IrqReturn::Handled), None, IrqPolicy::exclusive())
            .unwrap();
        assert_eq!(with.coalesce_interval(), Some(Duration::from_micros(500)));
        assert_eq!(without.coalesce_interval(), None);
    }

    #[test]
    fn deferred_panic_is_reported_per_event() {
        let (irq, events) = dispatcher();
        fn explode(_count: u32) {
            panic!("bad bottom half");
        }
        let deferred: DeferredHandler = Arc::new(explode);
        let _reg = irq
            .register(
                14,
                returning(IrqReturn::WakeDeferred),
                Some(deferred),
                IrqPolicy::exclusive().for_device(DeviceId::new(3)),
            )
            .unwrap();
        irq.raise(14);
        irq.raise(14);
        irq.synchronize(14);
        assert_eq!(events.count(EventKind::DeferredHandlerPanicked), 2);
        // The pool survives.
        assert_eq!(irq.raise(14), RaiseOutcome::Claimed);
    }

    #[test]
    fn immediate_panic_counts_as_not_mine() {
        fn explode() -> IrqReturn {
            panic!("bad top half");
        }
        let (irq, events) = dispatcher();
        let _r = irq
            .register(15, Arc::new(explode), None, IrqPolicy::exclusive())
            .unwrap();
        assert_eq!(irq.raise(15), RaiseOutcome::Unclaimed);
        assert_eq!(events.count(EventKind::ImmediateHandlerPanicked), 1);
        assert_eq!(events.count(EventKind::UnclaimedInterrupt), 1);
    }

    #[test]
    fn unregister_waits_for_running_deferred() {
        let (irq, _) = dispatcher();
        let done = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = unbounded();
        let deferred: DeferredHandler = {
            let done = Arc::clone(&done);
            Arc::new(move |_count: u32| {
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
            })
        };
        let reg = irq
            .register(
                16,
                returning(IrqReturn::WakeDeferred),
                Some(deferred),
                IrqPolicy::exclusive().threading(Threading::Always),
            )
            .unwrap();
        irq.raise(16);
        started_rx.recv_timeout(WAIT).unwrap();
        irq.unregister(reg);
        assert!(done.load(Ordering::SeqCst));
    }
}
