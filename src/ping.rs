//! The ping wheel: one host timer for thousands of ping windows.
//!
//! Every selector waiting on a ping round registers an absolute deadline
//! here. The wheel keeps the registrations ordered and asks the host to keep
//! exactly one timer armed, always at the earliest deadline. Host timer
//! facilities are built for a few unrelated timeouts, not for thousands of
//! short-lived ping windows; this indirection is what makes busy proxies
//! survive.
//!
//! Two invariants hold after every mutation: at most one host timer is
//! armed, and when armed it equals the earliest registered deadline.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::selector::SelectorId;

/// What the host should do with its single ping timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCmd {
    /// (Re)arm the timer for this deadline.
    Arm(Instant),
    /// No registrations remain; disarm the timer.
    Cancel,
}

/// Ordered registrations of selectors waiting for ping replies.
#[derive(Debug, Default)]
pub struct PingWheel {
    entries: BTreeMap<(Instant, SelectorId), ()>,
    armed: Option<Instant>,
}

impl PingWheel {
    pub fn new() -> Self {
        PingWheel::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The deadline the host timer is currently armed for.
    pub fn armed(&self) -> Option<Instant> {
        self.armed
    }

    fn earliest(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Brings the host timer in line with the earliest registration.
    /// Returns `None` when the timer is already correct.
    fn rearm(&mut self) -> Option<TimerCmd> {
        let earliest = self.earliest();
        if earliest == self.armed {
            return None;
        }
        self.armed = earliest;
        match earliest {
            Some(deadline) => Some(TimerCmd::Arm(deadline)),
            None => Some(TimerCmd::Cancel),
        }
    }

    /// Registers a selector to be woken at `deadline`.
    pub fn monitor(&mut self, selector: SelectorId, deadline: Instant) -> Option<TimerCmd> {
        self.entries.insert((deadline, selector), ());
        self.rearm()
    }

    /// Removes a registration. Removing one that is not the earliest never
    /// touches the host timer.
    pub fn forget(&mut self, selector: SelectorId, deadline: Instant) -> Option<TimerCmd> {
        if self.entries.remove(&(deadline, selector)).is_none() {
            return None; // already forgotten
        }
        self.rearm()
    }

    /// The host timer fired: pops every registration that is due and returns
    /// the selectors to notify. The caller must post the notifications
    /// through its scheduler, never call into selectors from here; a
    /// notified selector may well re-register.
    pub fn service(&mut self, now: Instant) -> (Vec<SelectorId>, Option<TimerCmd>) {
        // the timer that fired is spent
        self.armed = None;

        let mut due = Vec::new();
        while let Some(&(deadline, selector)) = self.entries.keys().next() {
            if deadline > now {
                break;
            }
            self.entries.remove(&(deadline, selector));
            due.push(selector);
        }

        tracing::trace!(fired = due.len(), waiting = self.entries.len(), "ping wheel serviced");
        (due, self.rearm())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    fn sel(n: u32) -> SelectorId {
        SelectorId {
            slot: n,
            generation: 0,
        }
    }

    #[test]
    fn first_registration_arms_the_timer() {
        let mut wheel = PingWheel::new();
        let base = Instant::now();
        let cmd = wheel.monitor(sel(1), base + Duration::from_millis(100));
        assert_eq!(cmd, Some(TimerCmd::Arm(base + Duration::from_millis(100))));
        assert_eq!(wheel.armed(), Some(base + Duration::from_millis(100)));
    }

    #[test]
    fn earlier_registration_rearms_later_does_not() {
        let mut wheel = PingWheel::new();
        let base = Instant::now();
        wheel.monitor(sel(1), base + Duration::from_millis(100));

        assert_eq!(wheel.monitor(sel(2), base + Duration::from_millis(200)), None);
        assert_eq!(
            wheel.monitor(sel(3), base + Duration::from_millis(50)),
            Some(TimerCmd::Arm(base + Duration::from_millis(50)))
        );
    }

    #[test]
    fn forgetting_non_head_is_a_noop_for_the_timer() {
        let mut wheel = PingWheel::new();
        let base = Instant::now();
        wheel.monitor(sel(1), base + Duration::from_millis(100));
        wheel.monitor(sel(2), base + Duration::from_millis(200));

        assert_eq!(wheel.forget(sel(2), base + Duration::from_millis(200)), None);
        assert_eq!(wheel.armed(), Some(base + Duration::from_millis(100)));
    }

    #[test]
    fn forgetting_the_head_rearms_or_cancels() {
        let mut wheel = PingWheel::new();
        let base = Instant::now();
        let early = base + Duration::from_millis(100);
        let late = base + Duration::from_millis(200);
        wheel.monitor(sel(1), early);
        wheel.monitor(sel(2), late);

        assert_eq!(wheel.forget(sel(1), early), Some(TimerCmd::Arm(late)));
        assert_eq!(wheel.forget(sel(2), late), Some(TimerCmd::Cancel));
        assert!(wheel.is_empty());
    }

    #[test]
    fn forgetting_the_head_with_a_twin_deadline_keeps_the_timer() {
        let mut wheel = PingWheel::new();
        let base = Instant::now();
        let deadline = base + Duration::from_millis(100);
        wheel.monitor(sel(1), deadline);
        wheel.monitor(sel(2), deadline);

        // the other registration still needs the same wake-up
        assert_eq!(wheel.forget(sel(1), deadline), None);
        assert_eq!(wheel.armed(), Some(deadline));
    }

    #[test]
    fn double_forget_is_harmless() {
        let mut wheel = PingWheel::new();
        let base = Instant::now();
        let deadline = base + Duration::from_millis(100);
        wheel.monitor(sel(1), deadline);
        wheel.forget(sel(1), deadline);
        assert_eq!(wheel.forget(sel(1), deadline), None);
    }

    #[test]
    fn service_pops_everything_due_and_rearms() {
        let mut wheel = PingWheel::new();
        let base = Instant::now();
        wheel.monitor(sel(1), base + Duration::from_millis(50));
        wheel.monitor(sel(2), base + Duration::from_millis(60));
        wheel.monitor(sel(3), base + Duration::from_millis(500));

        let (due, cmd) = wheel.service(base + Duration::from_millis(100));
        assert_eq!(due, vec![sel(1), sel(2)]);
        assert_eq!(cmd, Some(TimerCmd::Arm(base + Duration::from_millis(500))));

        let (due, cmd) = wheel.service(base + Duration::from_millis(600));
        assert_eq!(due, vec![sel(3)]);
        // nothing left: the fired timer stays disarmed
        assert_eq!(cmd, None);
        assert_eq!(wheel.armed(), None);
    }

    proptest! {
        /// The armed deadline equals the minimum registered deadline after
        /// every mutation, and is absent exactly when the wheel is empty.
        #[test]
        fn armed_timer_tracks_the_minimum(ops in proptest::collection::vec((0u32..8, 0u64..1000, prop::bool::ANY), 1..64)) {
            let base = Instant::now();
            let mut wheel = PingWheel::new();
            let mut deadlines: Vec<(SelectorId, Instant)> = Vec::new();

            for (selector, offset_ms, insert) in ops {
                let id = sel(selector);
                if insert {
                    let deadline = base + Duration::from_millis(offset_ms);
                    // a selector waits on at most one deadline
                    if let Some(pos) = deadlines.iter().position(|(s, _)| *s == id) {
                        let (_, old) = deadlines.remove(pos);
                        wheel.forget(id, old);
                    }
                    wheel.monitor(id, deadline);
                    deadlines.push((id, deadline));
                } else if let Some(pos) = deadlines.iter().position(|(s, _)| *s == id) {
                    let (_, deadline) = deadlines.remove(pos);
                    wheel.forget(id, deadline);
                }

                let expected = deadlines.iter().map(|(_, d)| *d).min();
                prop_assert_eq!(wheel.armed(), expected);
            }
        }
    }
}
