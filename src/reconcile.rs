//! Claiming the windows that already exist when the manager attaches.
//!
//! After an in-place restart the server still holds events generated while
//! no manager was listening (clients unmapping themselves, for example).
//! Acting on them after taking over a window would make the manager believe
//! the window just went away, so they are flushed out under a server grab and
//! dropped. MapRequests are the exception: they can legitimately arrive
//! between claiming the root and this step and must be honored.

use crate::{
    Result,
    reactor::{EventClass, ProtocolEvent, ProtocolSource},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExistingWindow {
    pub window: u32,
    pub override_redirect: bool,
    pub viewable: bool,
}

impl ExistingWindow {
    /// Popups and unmapped windows are left alone.
    pub fn is_manageable(&self) -> bool {
        self.viewable && !self.override_redirect
    }
}

pub trait DisplayServer: ProtocolSource {
    fn grab_server(&self) -> Result<()>;

    /// Release the grab and flush, so other clients resume immediately.
    fn ungrab_server(&self) -> Result<()>;

    /// Full round trip: every event the server queued before now is in the
    /// library queue afterwards.
    fn sync(&self) -> Result<()>;

    /// Direct children of the root, in stacking order.
    fn existing_windows(&self) -> Result<Vec<ExistingWindow>>;
}

pub trait Reconcile {
    type Server: DisplayServer;

    fn server(&self) -> &Self::Server;

    fn is_managed(&self, window: u32) -> bool;

    fn claim_window(&mut self, window: u32) -> Result<()>;

    fn honor_map_request(&mut self, event: <Self::Server as ProtocolSource>::Event);
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub claimed: Vec<u32>,
    pub map_requests: usize,
    pub discarded_events: usize,
    pub skipped: usize,
}

/// Grab, sync, drop stale events (honoring MapRequests), claim every
/// manageable root child that is not managed yet, ungrab. The grab is
/// released even when claiming fails.
pub fn reconcile<R: Reconcile>(target: &mut R) -> Result<ReconcileReport> {
    target.server().grab_server()?;
    let outcome = claim_under_grab(target);
    let released = target.server().ungrab_server();
    let report = outcome?;
    released?;

    tracing::info!(
        claimed = report.claimed.len(),
        map_requests = report.map_requests,
        discarded = report.discarded_events,
        skipped = report.skipped,
        "existing windows reconciled"
    );
    Ok(report)
}

fn claim_under_grab<R: Reconcile>(target: &mut R) -> Result<ReconcileReport> {
    target.server().sync()?;

    let mut report = ReconcileReport::default();
    while let Some(event) = target.server().poll_event()? {
        match event.class() {
            EventClass::MapRequest(window) => {
                tracing::debug!(window = format_args!("{window:#x}"), "honoring early map request");
                report.map_requests += 1;
                target.honor_map_request(event);
            }
            _ => report.discarded_events += 1,
        }
    }

    for existing in target.server().existing_windows()? {
        if !existing.is_manageable() || target.is_managed(existing.window) {
            report.skipped += 1;
            continue;
        }
        target.claim_window(existing.window)?;
        report.claimed.push(existing.window);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManagerError;
    use std::{
        cell::RefCell,
        collections::{BTreeSet, VecDeque},
    };

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum FakeEvent {
        MapRequest(u32),
        UnmapNotify(u32),
        Error,
    }

    impl ProtocolEvent for FakeEvent {
        fn class(&self) -> EventClass {
            match self {
                FakeEvent::MapRequest(window) => EventClass::MapRequest(*window),
                FakeEvent::UnmapNotify(_) => EventClass::Other,
                FakeEvent::Error => EventClass::Error {
                    code: 3,
                    sequence: 9,
                },
            }
        }
    }

    #[derive(Default)]
    struct FakeServer {
        log: RefCell<Vec<&'static str>>,
        // Events only become visible once `sync` ran.
        in_flight: RefCell<Vec<FakeEvent>>,
        queue: RefCell<VecDeque<FakeEvent>>,
        windows: Vec<ExistingWindow>,
        fail_enumeration: bool,
    }

    impl ProtocolSource for FakeServer {
        type Event = FakeEvent;

        fn poll_event(&self) -> Result<Option<FakeEvent>> {
            Ok(self.queue.borrow_mut().pop_front())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    impl DisplayServer for FakeServer {
        fn grab_server(&self) -> Result<()> {
            self.log.borrow_mut().push("grab");
            Ok(())
        }

        fn ungrab_server(&self) -> Result<()> {
            self.log.borrow_mut().push("ungrab");
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            self.log.borrow_mut().push("sync");
            let pending = std::mem::take(&mut *self.in_flight.borrow_mut());
            self.queue.borrow_mut().extend(pending);
            Ok(())
        }

        fn existing_windows(&self) -> Result<Vec<ExistingWindow>> {
            self.log.borrow_mut().push("query");
            if self.fail_enumeration {
                return Err(ManagerError::Ipc("boom".to_owned()));
            }
            Ok(self.windows.clone())
        }
    }

    #[derive(Default)]
    struct FakeManager {
        server: FakeServer,
        managed: BTreeSet<u32>,
        manage_calls: Vec<u32>,
    }

    impl FakeManager {
        fn manage(&mut self, window: u32) {
            self.manage_calls.push(window);
            self.managed.insert(window);
        }
    }

    impl Reconcile for FakeManager {
        type Server = FakeServer;

        fn server(&self) -> &FakeServer {
            &self.server
        }

        fn is_managed(&self, window: u32) -> bool {
            self.managed.contains(&window)
        }

        fn claim_window(&mut self, window: u32) -> Result<()> {
            self.manage(window);
            Ok(())
        }

        fn honor_map_request(&mut self, event: FakeEvent) {
            if let FakeEvent::MapRequest(window) = event
                && !self.is_managed(window)
            {
                self.manage(window);
            }
        }
    }

    fn viewable(window: u32) -> ExistingWindow {
        ExistingWindow {
            window,
            override_redirect: false,
            viewable: true,
        }
    }

    #[test]
    fn claims_every_window_once_and_drops_stale_events() {
        let mut manager = FakeManager::default();
        manager.server.windows = vec![
            viewable(0x10),
            viewable(0x20),
            ExistingWindow {
                window: 0x30,
                override_redirect: true,
                viewable: true,
            },
            ExistingWindow {
                window: 0x40,
                override_redirect: false,
                viewable: false,
            },
        ];
        *manager.server.in_flight.borrow_mut() = vec![
            FakeEvent::UnmapNotify(0x10),
            FakeEvent::MapRequest(0x20),
            FakeEvent::Error,
            FakeEvent::MapRequest(0x50),
        ];

        let report = reconcile(&mut manager).unwrap();

        assert_eq!(manager.manage_calls, vec![0x20, 0x50, 0x10]);
        assert_eq!(report.claimed, vec![0x10]);
        assert_eq!(report.map_requests, 2);
        assert_eq!(report.discarded_events, 2);
        assert_eq!(report.skipped, 3);
        assert!(manager.server.queue.borrow().is_empty());
        assert_eq!(
            *manager.server.log.borrow(),
            vec!["grab", "sync", "query", "ungrab"]
        );
    }

    #[test]
    fn restored_windows_are_not_claimed_again() {
        let mut manager = FakeManager::default();
        manager.managed.insert(0x10);
        manager.server.windows = vec![viewable(0x10), viewable(0x11)];

        let report = reconcile(&mut manager).unwrap();
        assert_eq!(report.claimed, vec![0x11]);
        assert_eq!(manager.manage_calls, vec![0x11]);
    }

    #[test]
    fn grab_is_released_when_enumeration_fails() {
        let mut manager = FakeManager::default();
        manager.server.fail_enumeration = true;

        assert!(reconcile(&mut manager).is_err());
        assert_eq!(
            manager.server.log.borrow().last().copied(),
            Some("ungrab")
        );
    }
}
