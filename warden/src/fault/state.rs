// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The escalation state machine: `Normal -> GracefulAttempt(n) -> Terminating`.
//!
//! All state lives in atomics so that a fault arriving while another fault is being handled
//! (on the same or another thread) is observed and counted, never lost, and never blocks.

use super::classifier::{classify, FaultId, Severity, MAX_FAULT_SLOTS};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32};

/// One fault notification, as seen by the machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    pub id: FaultId,
    pub severity: Severity,
    /// How many times this kind of fault has been observed since the machine was created,
    /// this one included.
    pub occurrence: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Normal,
    GracefulAttempt(u32),
    Terminating,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    /// The operator repeated the termination request until the bound was reached.
    Escalated,
    Fatal,
}

/// What the caller must do about a fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    Ignored,
    /// Ask the host to shut down cleanly.
    RequestShutdown { attempt: u32 },
    /// This fault moved the machine to `Terminating`; the caller owns the termination.
    Terminate(TerminationCause),
    /// Another fault already owns the termination.
    AlreadyTerminating(Severity),
}

pub struct EscalationMachine {
    max_attempts: u32,
    // Highest graceful attempt handed out so far, for reporting the phase.
    attempt: AtomicU32,
    counters: [AtomicU32; MAX_FAULT_SLOTS],
    terminating: AtomicBool,
}

impl EscalationMachine {
    pub const fn new(max_attempts: u8) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts as u32 },
            attempt: AtomicU32::new(0),
            counters: [const { AtomicU32::new(0) }; MAX_FAULT_SLOTS],
            terminating: AtomicBool::new(false),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classifies `id` and counts it against its kind.
    pub fn observe(&self, id: FaultId) -> FaultEvent {
        let previous = self.counters[id.slot()].fetch_add(1, SeqCst);
        FaultEvent {
            id,
            severity: classify(id),
            occurrence: previous.saturating_add(1),
        }
    }

    pub fn transition(&self, event: &FaultEvent) -> Transition {
        match event.severity {
            Severity::Recoverable => Transition::Ignored,
            Severity::Escalating => {
                if self.terminating.load(SeqCst) {
                    return Transition::AlreadyTerminating(event.severity);
                }
                if event.occurrence >= self.max_attempts {
                    self.begin_termination(event.severity, TerminationCause::Escalated)
                } else {
                    self.attempt.fetch_max(event.occurrence, SeqCst);
                    Transition::RequestShutdown {
                        attempt: event.occurrence,
                    }
                }
            }
            Severity::Fatal => self.begin_termination(event.severity, TerminationCause::Fatal),
        }
    }

    /// [`Self::observe`] followed by [`Self::transition`].
    pub fn on_fault(&self, id: FaultId) -> (FaultEvent, Transition) {
        let event = self.observe(id);
        let transition = self.transition(&event);
        (event, transition)
    }

    pub fn phase(&self) -> Phase {
        if self.terminating.load(SeqCst) {
            return Phase::Terminating;
        }
        match self.attempt.load(SeqCst) {
            0 => Phase::Normal,
            n => Phase::GracefulAttempt(n),
        }
    }

    fn begin_termination(&self, severity: Severity, cause: TerminationCause) -> Transition {
        match self
            .terminating
            .compare_exchange(false, true, SeqCst, SeqCst)
        {
            Ok(_) => Transition::Terminate(cause),
            Err(_) => Transition::AlreadyTerminating(severity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::classifier::{CTRL_C_EVENT, EXCEPTION_ACCESS_VIOLATION};
    use crate::shared::constants::MAX_ATTEMPTS;

    #[cfg(unix)]
    const INTERRUPT: FaultId = FaultId::Signal(libc::SIGINT);
    #[cfg(windows)]
    const INTERRUPT: FaultId = FaultId::Signal(2);

    #[test]
    fn test_terminates_on_max_attempt_and_not_before() {
        let machine = EscalationMachine::new(MAX_ATTEMPTS);
        for n in 1..u32::from(MAX_ATTEMPTS) {
            let (event, transition) = machine.on_fault(INTERRUPT);
            assert_eq!(event.occurrence, n);
            assert_eq!(transition, Transition::RequestShutdown { attempt: n });
            assert_eq!(machine.phase(), Phase::GracefulAttempt(n));
        }
        let (_, transition) = machine.on_fault(INTERRUPT);
        assert_eq!(
            transition,
            Transition::Terminate(TerminationCause::Escalated)
        );
        assert_eq!(machine.phase(), Phase::Terminating);
    }

    #[test]
    fn test_single_fatal_terminates() {
        let machine = EscalationMachine::new(MAX_ATTEMPTS);
        assert_eq!(machine.phase(), Phase::Normal);
        let (event, transition) = machine.on_fault(FaultId::Exception(EXCEPTION_ACCESS_VIOLATION));
        assert_eq!(event.severity, Severity::Fatal);
        assert_eq!(transition, Transition::Terminate(TerminationCause::Fatal));
        assert_eq!(machine.phase(), Phase::Terminating);
    }

    #[test]
    fn test_fatal_during_graceful_attempt() {
        let machine = EscalationMachine::new(MAX_ATTEMPTS);
        machine.on_fault(INTERRUPT);
        machine.on_fault(INTERRUPT);
        assert_eq!(machine.phase(), Phase::GracefulAttempt(2));
        let (_, transition) = machine.on_fault(FaultId::Exception(EXCEPTION_ACCESS_VIOLATION));
        assert_eq!(transition, Transition::Terminate(TerminationCause::Fatal));
    }

    #[test]
    fn test_faults_while_terminating_are_handled() {
        let machine = EscalationMachine::new(MAX_ATTEMPTS);
        machine.on_fault(FaultId::Exception(EXCEPTION_ACCESS_VIOLATION));

        let (event, transition) = machine.on_fault(FaultId::Exception(EXCEPTION_ACCESS_VIOLATION));
        assert_eq!(event.occurrence, 2);
        assert_eq!(transition, Transition::AlreadyTerminating(Severity::Fatal));

        let (_, transition) = machine.on_fault(INTERRUPT);
        assert_eq!(
            transition,
            Transition::AlreadyTerminating(Severity::Escalating)
        );
        assert_eq!(machine.phase(), Phase::Terminating);
    }

    #[test]
    fn test_kinds_are_counted_separately() {
        let machine = EscalationMachine::new(3);
        assert_eq!(
            machine.on_fault(INTERRUPT).1,
            Transition::RequestShutdown { attempt: 1 }
        );
        assert_eq!(
            machine.on_fault(FaultId::ConsoleControl(CTRL_C_EVENT)).1,
            Transition::RequestShutdown { attempt: 1 }
        );
        assert_eq!(
            machine.on_fault(INTERRUPT).1,
            Transition::RequestShutdown { attempt: 2 }
        );
        assert_eq!(
            machine.on_fault(INTERRUPT).1,
            Transition::Terminate(TerminationCause::Escalated)
        );
    }

    #[test]
    fn test_recoverable_is_ignored() {
        let machine = EscalationMachine::new(1);
        for _ in 0..10 {
            assert_eq!(
                machine.on_fault(FaultId::Exception(0x4000_0000)).1,
                Transition::Ignored
            );
        }
        assert_eq!(machine.phase(), Phase::Normal);
    }

    #[test]
    fn test_max_attempts_of_one() {
        let machine = EscalationMachine::new(1);
        assert_eq!(
            machine.on_fault(INTERRUPT).1,
            Transition::Terminate(TerminationCause::Escalated)
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_exactly_one_thread_wins_termination() {
        let machine = EscalationMachine::new(MAX_ATTEMPTS);
        let winners = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let (_, transition) =
                        machine.on_fault(FaultId::Exception(EXCEPTION_ACCESS_VIOLATION));
                    if transition == Transition::Terminate(TerminationCause::Fatal) {
                        winners.fetch_add(1, SeqCst);
                    }
                });
            }
        });
        assert_eq!(winners.load(SeqCst), 1);
    }
}
