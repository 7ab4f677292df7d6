//! Bridge between calloop readiness and the display library's own queue.
//!
//! x11rb reads from the socket in large chunks and buffers whatever events it
//! did not hand out yet, so the display fd becoming quiet says nothing about
//! whether events are still pending. Everything here therefore drains the
//! library queue unconditionally: from the fd readiness callback, and again
//! right before the loop goes to sleep.

use std::{os::fd::OwnedFd, time::Duration};

use calloop::{
    EventLoop, Interest, LoopHandle, Mode, PostAction, RegistrationToken, generic::Generic,
};

use crate::{ManagerError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    Error { code: u8, sequence: u16 },
    MapRequest(u32),
    Other,
}

pub trait ProtocolEvent {
    fn class(&self) -> EventClass;
}

pub trait ProtocolSource {
    type Event: ProtocolEvent;

    /// Next already-received event, reading from the socket if needed.
    /// Errors mean the connection itself failed.
    fn poll_event(&self) -> Result<Option<Self::Event>>;

    fn flush(&self) -> Result<()>;
}

pub trait ProtocolDispatch {
    type Source: ProtocolSource;

    fn protocol(&self) -> &Self::Source;

    fn protocol_gate(&mut self) -> &mut ProtocolGate;

    fn dispatch_event(&mut self, event: <Self::Source as ProtocolSource>::Event);

    /// The connection is gone. Implementations are expected to terminate.
    fn protocol_failed(&mut self, err: ManagerError);
}

#[derive(Debug)]
pub struct ProtocolGate {
    enabled: bool,
    token: Option<RegistrationToken>,
}

impl Default for ProtocolGate {
    fn default() -> Self {
        Self {
            enabled: true,
            token: None,
        }
    }
}

impl ProtocolGate {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn token(&self) -> Option<RegistrationToken> {
        self.token
    }
}

/// Dispatch every queued event in arrival order, then flush outgoing requests.
/// Error events are logged and dropped.
pub fn drain<D: ProtocolDispatch>(target: &mut D) -> Result<usize> {
    let mut dispatched = 0;
    while let Some(event) = target.protocol().poll_event()? {
        if let EventClass::Error { code, sequence } = event.class() {
            tracing::debug!(
                sequence = format_args!("{sequence:#x}"),
                error_code = code,
                "X11 error received (probably harmless)"
            );
            continue;
        }
        target.dispatch_event(event);
        dispatched += 1;
    }
    target.protocol().flush()?;
    Ok(dispatched)
}

pub fn drain_if_enabled<D: ProtocolDispatch>(target: &mut D) -> usize {
    if !target.protocol_gate().enabled {
        return 0;
    }
    match drain(target) {
        Ok(dispatched) => dispatched,
        Err(err) => {
            target.protocol_failed(err);
            0
        }
    }
}

pub fn before_sleep<D: ProtocolDispatch>(target: &mut D) {
    drain_if_enabled(target);
}

/// Run the loop until it is stopped. `idle` runs after every dispatch round,
/// right after the pre-sleep drain.
///
/// `EventLoop::run` only calls its callback after a dispatch, so the queue is
/// drained once here before the first wait.
pub fn run<D, F>(
    event_loop: &mut EventLoop<'_, D>,
    timeout: Option<Duration>,
    target: &mut D,
    mut idle: F,
) -> Result<()>
where
    D: ProtocolDispatch,
    F: FnMut(&mut D),
{
    before_sleep(target);
    event_loop
        .run(timeout, target, |state| {
            before_sleep(state);
            idle(state);
        })
        .map_err(|err| ManagerError::EventLoop(err.to_string()))
}

/// Watch the display fd. Readiness is a wakeup hint, not a count.
pub fn insert_protocol_source<D: ProtocolDispatch + 'static>(
    handle: &LoopHandle<'static, D>,
    target: &mut D,
    fd: OwnedFd,
) -> Result<RegistrationToken> {
    let token = handle
        .insert_source(
            Generic::new(fd, Interest::READ, Mode::Level),
            |_, _, state: &mut D| {
                drain_if_enabled(state);
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| {
            ManagerError::EventLoop(format!("failed to watch display connection: {err}"))
        })?;
    target.protocol_gate().token = Some(token);
    Ok(token)
}

/// Hand protocol events to (or take them back from) a modal routine.
/// Re-enabling drains right away.
pub fn set_protocol_drain<D: ProtocolDispatch>(
    handle: &LoopHandle<'static, D>,
    target: &mut D,
    enabled: bool,
) {
    tracing::debug!(enabled, "setting protocol drain");
    let gate = target.protocol_gate();
    if gate.enabled == enabled {
        return;
    }
    gate.enabled = enabled;

    if let Some(token) = gate.token {
        let toggled = if enabled {
            handle.enable(&token)
        } else {
            handle.disable(&token)
        };
        if let Err(err) = toggled {
            tracing::warn!(enabled, "failed to toggle display source: {err}");
        }
    }

    if enabled {
        drain_if_enabled(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        io::Write,
        os::{fd::AsFd, unix::net::UnixStream},
        time::Instant,
    };

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum FakeEvent {
        Map(u32),
        Error(u8),
        Motion(u32),
    }

    impl ProtocolEvent for FakeEvent {
        fn class(&self) -> EventClass {
            match self {
                FakeEvent::Map(window) => EventClass::MapRequest(*window),
                FakeEvent::Error(code) => EventClass::Error {
                    code: *code,
                    sequence: 1,
                },
                FakeEvent::Motion(_) => EventClass::Other,
            }
        }
    }

    #[derive(Default)]
    struct FakeSource {
        queue: RefCell<VecDeque<FakeEvent>>,
        flushes: Cell<usize>,
        broken: Cell<bool>,
    }

    impl FakeSource {
        fn push(&self, event: FakeEvent) {
            self.queue.borrow_mut().push_back(event);
        }
    }

    impl ProtocolSource for FakeSource {
        type Event = FakeEvent;

        fn poll_event(&self) -> Result<Option<FakeEvent>> {
            if self.broken.get() {
                return Err(ManagerError::Connection(
                    x11rb::errors::ConnectionError::UnknownError,
                ));
            }
            Ok(self.queue.borrow_mut().pop_front())
        }

        fn flush(&self) -> Result<()> {
            self.flushes.set(self.flushes.get() + 1);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeState {
        source: FakeSource,
        gate: ProtocolGate,
        dispatched: Vec<FakeEvent>,
        first_dispatch: Option<Instant>,
        failures: usize,
    }

    impl ProtocolDispatch for FakeState {
        type Source = FakeSource;

        fn protocol(&self) -> &FakeSource {
            &self.source
        }

        fn protocol_gate(&mut self) -> &mut ProtocolGate {
            &mut self.gate
        }

        fn dispatch_event(&mut self, event: FakeEvent) {
            self.first_dispatch.get_or_insert_with(Instant::now);
            self.dispatched.push(event);
        }

        fn protocol_failed(&mut self, _err: ManagerError) {
            self.failures += 1;
        }
    }

    #[test]
    fn drain_dispatches_in_order_skips_errors_and_flushes() {
        let mut state = FakeState::default();
        state.source.push(FakeEvent::Map(1));
        state.source.push(FakeEvent::Error(3));
        state.source.push(FakeEvent::Motion(2));

        assert_eq!(drain(&mut state).unwrap(), 2);
        assert_eq!(
            state.dispatched,
            vec![FakeEvent::Map(1), FakeEvent::Motion(2)]
        );
        assert_eq!(state.source.flushes.get(), 1);
        assert!(state.source.queue.borrow().is_empty());
    }

    #[test]
    fn connection_failure_is_reported() {
        let mut state = FakeState::default();
        state.source.broken.set(true);
        assert_eq!(drain_if_enabled(&mut state), 0);
        assert_eq!(state.failures, 1);
    }

    #[test]
    fn pre_sleep_drain_does_not_need_readiness() {
        let mut event_loop: EventLoop<FakeState> = EventLoop::try_new().unwrap();
        let handle = event_loop.handle();
        let mut state = FakeState::default();

        let (ours, _peer) = UnixStream::pair().unwrap();
        let fd = ours.as_fd().try_clone_to_owned().unwrap();
        insert_protocol_source(&handle, &mut state, fd).unwrap();

        // Events already buffered by the library while the fd is quiet.
        state.source.push(FakeEvent::Map(7));
        state.source.push(FakeEvent::Map(8));

        event_loop
            .dispatch(Some(Duration::ZERO), &mut state)
            .unwrap();
        assert!(state.dispatched.is_empty());

        before_sleep(&mut state);
        assert_eq!(state.dispatched, vec![FakeEvent::Map(7), FakeEvent::Map(8)]);
    }

    #[test]
    fn readiness_callback_drains_everything_queued() {
        let mut event_loop: EventLoop<FakeState> = EventLoop::try_new().unwrap();
        let handle = event_loop.handle();
        let mut state = FakeState::default();

        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_fd().try_clone_to_owned().unwrap();
        insert_protocol_source(&handle, &mut state, fd).unwrap();

        for window in 0..5 {
            state.source.push(FakeEvent::Motion(window));
        }
        peer.write_all(b"x").unwrap();

        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut state)
            .unwrap();
        assert_eq!(state.dispatched.len(), 5);
        assert!(state.source.queue.borrow().is_empty());
    }

    #[test]
    fn reenabling_the_drain_dispatches_backlog_immediately() {
        let event_loop: EventLoop<FakeState> = EventLoop::try_new().unwrap();
        let handle = event_loop.handle();
        let mut state = FakeState::default();

        let (ours, _peer) = UnixStream::pair().unwrap();
        let fd = ours.as_fd().try_clone_to_owned().unwrap();
        insert_protocol_source(&handle, &mut state, fd).unwrap();

        set_protocol_drain(&handle, &mut state, false);
        assert!(!state.gate.is_enabled());

        state.source.push(FakeEvent::Map(1));
        state.source.push(FakeEvent::Motion(2));
        before_sleep(&mut state);
        assert!(state.dispatched.is_empty());

        set_protocol_drain(&handle, &mut state, true);
        assert_eq!(
            state.dispatched,
            vec![FakeEvent::Map(1), FakeEvent::Motion(2)]
        );
    }

    #[test]
    fn queue_is_drained_before_the_first_wait() {
        let mut event_loop: EventLoop<FakeState> = EventLoop::try_new().unwrap();
        let handle = event_loop.handle();
        let signal = event_loop.get_signal();
        let mut state = FakeState::default();

        let (ours, _peer) = UnixStream::pair().unwrap();
        let fd = ours.as_fd().try_clone_to_owned().unwrap();
        insert_protocol_source(&handle, &mut state, fd).unwrap();

        // Buffered during bootstrap; the fd never becomes readable.
        state.source.push(FakeEvent::Map(7));

        let started = Instant::now();
        let mut rounds = 0;
        run(
            &mut event_loop,
            Some(Duration::from_millis(300)),
            &mut state,
            |_| {
                rounds += 1;
                signal.stop();
            },
        )
        .unwrap();

        assert_eq!(rounds, 1);
        assert_eq!(state.dispatched, vec![FakeEvent::Map(7)]);
        let first = state.first_dispatch.unwrap();
        assert!(first.duration_since(started) < Duration::from_millis(150));
    }
}
