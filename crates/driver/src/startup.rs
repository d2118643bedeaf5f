//! Startup sequencing as an explicit state machine.
//!
//! ```text
//! Unknown -> Polling -> Startup { needs_reboot: true } -> Polling -> Ready
//!                    \-> Ready
//!                    \-> Startup { needs_reboot: false } -> Maintenance
//! ```
//!
//! A chip in startup mode is sent a reboot request and its mode polled again.
//! When the reboot budget is spent and the chip is still in startup mode (no
//! bootable application firmware) the sequence settles in `Maintenance`.

use std::time::Duration;

use crate::config::{PollBudget, PollTracker};
use crate::error::{Error, Result};
use crate::l1::{ChipMode, ModeFlags};

/// Step of the startup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    /// Not started.
    Unknown,
    /// Waiting for the chip to report a mode.
    Polling,
    /// Chip is running its bootloader.
    Startup {
        /// A reboot request is still to be issued.
        needs_reboot: bool,
    },
    /// Chip reached application mode.
    Ready,
    /// Chip stays in its bootloader; only maintenance requests are possible.
    Maintenance,
}

/// What the device must do to advance the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupAction {
    /// Begin polling.
    Begin,
    /// Read the chip status byte.
    PollMode,
    /// Issue a reboot request.
    Reboot,
    /// Accept startup mode as final.
    Settle,
    /// Nothing left to do.
    Done,
}

/// Startup state machine, driven one step at a time by `Device`.
#[derive(Debug)]
pub struct StartupSequence {
    state: StartupState,
    reboots_done: u32,
    max_reboots: u32,
    busy: PollTracker,
}

impl StartupSequence {
    /// A fresh sequence allowing `max_reboots` reboot requests.
    pub fn new(max_reboots: u32, poll_budget: PollBudget) -> Self {
        Self {
            state: StartupState::Unknown,
            reboots_done: 0,
            max_reboots,
            busy: PollTracker::new(poll_budget),
        }
    }

    /// Current step.
    #[inline]
    pub fn state(&self) -> StartupState {
        self.state
    }

    /// True once the sequence reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, StartupState::Ready | StartupState::Maintenance)
    }

    /// Reboot requests issued so far.
    pub fn reboots_done(&self) -> u32 {
        self.reboots_done
    }

    /// Chip mode implied by a terminal state.
    pub fn final_mode(&self) -> Option<ChipMode> {
        match self.state {
            StartupState::Ready => Some(ChipMode::Ready),
            StartupState::Maintenance => Some(ChipMode::Startup),
            _ => None,
        }
    }

    /// Next action required from the device.
    pub fn next_action(&self) -> StartupAction {
        match self.state {
            StartupState::Unknown => StartupAction::Begin,
            StartupState::Polling => StartupAction::PollMode,
            StartupState::Startup { needs_reboot: true } => StartupAction::Reboot,
            StartupState::Startup { needs_reboot: false } => StartupAction::Settle,
            StartupState::Ready | StartupState::Maintenance => StartupAction::Done,
        }
    }

    pub(crate) fn begin(&mut self) {
        if self.state == StartupState::Unknown {
            self.state = StartupState::Polling;
        }
    }

    /// Feed a polled chip status. Returns true when the chip was busy and the
    /// device should wait `delay` before polling again.
    pub(crate) fn observe(&mut self, flags: ModeFlags, delay: Duration) -> Result<bool> {
        self.busy.record_attempt();
        match flags.mode() {
            ChipMode::Alarm => Err(Error::NotReady(ChipMode::Alarm)),
            ChipMode::Ready => {
                self.state = StartupState::Ready;
                Ok(false)
            }
            ChipMode::Startup => {
                self.state = StartupState::Startup {
                    needs_reboot: self.reboots_done < self.max_reboots,
                };
                Ok(false)
            }
            ChipMode::Unknown => {
                if self.busy.exhausted() {
                    return Err(Error::Timeout {
                        attempts: self.busy.attempts(),
                    });
                }
                self.busy.record_wait(delay);
                Ok(true)
            }
        }
    }

    pub(crate) fn rebooted(&mut self) {
        self.reboots_done += 1;
        self.state = StartupState::Polling;
    }

    pub(crate) fn settle(&mut self) {
        self.state = StartupState::Maintenance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(25);

    fn startup_flags() -> ModeFlags {
        ModeFlags::from_byte(ModeFlags::READY | ModeFlags::STARTUP)
    }

    #[test]
    fn test_ready_chip_needs_no_reboot() {
        let mut seq = StartupSequence::new(1, PollBudget::Attempts(5));
        assert_eq!(seq.next_action(), StartupAction::Begin);
        seq.begin();
        assert_eq!(seq.state(), StartupState::Polling);
        assert!(!seq.observe(ModeFlags::from_byte(ModeFlags::READY), DELAY).unwrap());
        assert_eq!(seq.state(), StartupState::Ready);
        assert!(seq.is_finished());
        assert_eq!(seq.final_mode(), Some(ChipMode::Ready));
        assert_eq!(seq.next_action(), StartupAction::Done);
    }

    #[test]
    fn test_startup_chip_is_rebooted_then_ready() {
        let mut seq = StartupSequence::new(1, PollBudget::Attempts(5));
        seq.begin();
        seq.observe(startup_flags(), DELAY).unwrap();
        assert_eq!(seq.state(), StartupState::Startup { needs_reboot: true });
        assert_eq!(seq.next_action(), StartupAction::Reboot);
        assert!(!seq.is_finished());

        seq.rebooted();
        assert_eq!(seq.state(), StartupState::Polling);
        seq.observe(ModeFlags::from_byte(ModeFlags::READY), DELAY).unwrap();
        assert_eq!(seq.final_mode(), Some(ChipMode::Ready));
        assert_eq!(seq.reboots_done(), 1);
    }

    #[test]
    fn test_reboot_budget_exhausted_settles_in_maintenance() {
        let mut seq = StartupSequence::new(1, PollBudget::Attempts(5));
        seq.begin();
        seq.observe(startup_flags(), DELAY).unwrap();
        seq.rebooted();
        seq.observe(startup_flags(), DELAY).unwrap();
        assert_eq!(seq.state(), StartupState::Startup { needs_reboot: false });
        assert_eq!(seq.next_action(), StartupAction::Settle);
        seq.settle();
        assert_eq!(seq.final_mode(), Some(ChipMode::Startup));
    }

    #[test]
    fn test_alarm_aborts_sequence() {
        let mut seq = StartupSequence::new(1, PollBudget::Attempts(5));
        seq.begin();
        let err = seq
            .observe(ModeFlags::from_byte(ModeFlags::ALARM), DELAY)
            .unwrap_err();
        assert!(matches!(err, Error::NotReady(ChipMode::Alarm)));
    }

    #[test]
    fn test_busy_chip_times_out() {
        let mut seq = StartupSequence::new(1, PollBudget::Attempts(2));
        seq.begin();
        assert!(seq.observe(ModeFlags::default(), DELAY).unwrap());
        let err = seq.observe(ModeFlags::default(), DELAY).unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 2 }));
    }
}
