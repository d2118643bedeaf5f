//! Link timing and polling configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long L1 keeps polling for a response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollBudget {
    /// Give up after this many status polls.
    Attempts(u32),
    /// Give up once the accumulated retry delay reaches this many milliseconds.
    ElapsedMs(u64),
}

impl Default for PollBudget {
    fn default() -> Self {
        PollBudget::Attempts(50)
    }
}

/// Timing parameters for one link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Timeout passed to every link transfer, in milliseconds.
    pub transfer_timeout_ms: u64,

    /// Response polling budget.
    pub poll_budget: PollBudget,

    /// Delay between response polls, in milliseconds.
    pub poll_delay_ms: u64,

    /// Read-backs of the chip select line before declaring it stuck.
    pub select_check_attempts: u32,

    /// Reset line assertion time, in milliseconds.
    pub reset_pulse_ms: u64,

    /// Settle time after releasing reset, in milliseconds.
    pub reset_settle_ms: u64,

    /// Wait after a startup reboot request before polling mode, in milliseconds.
    pub reboot_settle_ms: u64,

    /// Reboot requests issued by the startup sequence before giving up on
    /// reaching application mode.
    pub max_reboot_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: 70,
            poll_budget: PollBudget::default(),
            poll_delay_ms: 25,
            select_check_attempts: 10,
            reset_pulse_ms: 10,
            reset_settle_ms: 50,
            reboot_settle_ms: 100,
            max_reboot_attempts: 1,
        }
    }
}

impl TransportConfig {
    /// Transfer timeout as a duration.
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Poll retry delay as a duration.
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    /// Reset pulse width as a duration.
    pub fn reset_pulse(&self) -> Duration {
        Duration::from_millis(self.reset_pulse_ms)
    }

    /// Reset settle time as a duration.
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    /// Reboot settle time as a duration.
    pub fn reboot_settle(&self) -> Duration {
        Duration::from_millis(self.reboot_settle_ms)
    }
}

/// Tracks consumption of a [`PollBudget`] during one response poll.
#[derive(Debug)]
pub(crate) struct PollTracker {
    budget: PollBudget,
    attempts: u32,
    waited: Duration,
}

impl PollTracker {
    pub(crate) fn new(budget: PollBudget) -> Self {
        Self {
            budget,
            attempts: 0,
            waited: Duration::ZERO,
        }
    }

    /// True once no further poll may be issued. The first poll is always allowed.
    pub(crate) fn exhausted(&self) -> bool {
        if self.attempts == 0 {
            return false;
        }
        match self.budget {
            PollBudget::Attempts(max) => self.attempts >= max,
            PollBudget::ElapsedMs(ms) => self.waited >= Duration::from_millis(ms),
        }
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub(crate) fn record_wait(&mut self, delay: Duration) {
        self.waited += delay;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}
