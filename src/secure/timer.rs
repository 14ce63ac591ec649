//! Group timer for KNX IP Secure routing.
//!
//! Secure multicast has no session, so the sequence field of every wrapper
//! carries a shared millisecond timer instead. One device on the backbone
//! acts as timekeeper and periodically announces the timer with
//! `TIMER_NOTIFY`; the others follow it. A wrapper whose timer lags the
//! local value by more than the configured latency is treated as a replay.
//!
//! [`SecureTimer`] is the pure state machine. It never sleeps: the caller
//! asks for [`next_deadline`](SecureTimer::next_deadline), waits, and calls
//! [`on_deadline`](SecureTimer::on_deadline) to obtain the notify to send.
//!
//! | event                     | received vs local timer          | action                     |
//! |---------------------------|----------------------------------|----------------------------|
//! | notify / wrapper ahead    | `> local`                        | adopt value, periodic      |
//! | within sync tolerance     | `> local - sync_latency`         | periodic                   |
//! | within latency            | `> local - latency`              | accept, no change          |
//! | stale                     | `<= local - latency`             | reject, schedule update    |

use crate::error::{KnxError, Result};
use crate::protocol::secure_services::{SecureWrapper, TimerNotify};
use crate::secure::primitives::{cbc_mac, ctr, macs_equal, Key};
use crate::secure::wrapper::{sequence_bytes, sequence_value};
use core::fmt;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

const KEEPER_PERIODIC_MIN_MS: u64 = 10_000;
const KEEPER_UPDATE_MIN_MS: u64 = 100;
const SYNC_LATENCY_PERCENT: u64 = 10;
const TIMER_NOTIFY_HEADER: [u8; 6] = [0x06, 0x10, 0x09, 0x55, 0x00, 0x24];

/// Random delay range, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    min: u64,
    max: u64,
}

impl Window {
    fn pick(self) -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(self.min..=self.max))
    }
}

/// Notify delay windows derived from the backbone latency tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Windows {
    keeper_periodic: Window,
    follower_periodic: Window,
    keeper_update: Window,
    follower_update: Window,
}

impl Windows {
    fn new(sync_latency_ms: u64) -> Self {
        let keeper_periodic = Window {
            min: KEEPER_PERIODIC_MIN_MS,
            max: KEEPER_PERIODIC_MIN_MS + 3 * sync_latency_ms,
        };
        let follower_min = keeper_periodic.max + sync_latency_ms;
        let keeper_update = Window {
            min: KEEPER_UPDATE_MIN_MS,
            max: KEEPER_UPDATE_MIN_MS + sync_latency_ms,
        };
        let follower_update_min = keeper_update.max + sync_latency_ms;
        Self {
            keeper_periodic,
            follower_periodic: Window {
                min: follower_min,
                max: follower_min + 10 * sync_latency_ms,
            },
            keeper_update,
            follower_update: Window {
                min: follower_update_min,
                max: follower_update_min + 10 * sync_latency_ms,
            },
        }
    }
}

/// Message tag and serial number an update notify answers.
type UpdateTarget = (u16, [u8; 6]);

/// Timer synchronisation state for one secure routing interface.
#[derive(Clone)]
pub struct SecureTimer {
    backbone_key: Key,
    serial_number: [u8; 6],
    latency_ms: u64,
    sync_latency_ms: u64,
    windows: Windows,
    epoch: Instant,
    clock_difference: i64,
    timekeeper: bool,
    authenticated: bool,
    scheduled_update: Option<UpdateTarget>,
    notify_deadline: Option<Instant>,
    expected_tag: Option<u16>,
}

impl SecureTimer {
    /// New follower, not yet synchronised. The timer starts at 0.
    pub fn new(backbone_key: Key, latency: Duration, serial_number: [u8; 6]) -> Self {
        let latency_ms = latency.as_millis() as u64;
        let sync_latency_ms = (latency_ms * SYNC_LATENCY_PERCENT + 50) / 100;
        Self {
            backbone_key,
            serial_number,
            latency_ms,
            sync_latency_ms,
            windows: Windows::new(sync_latency_ms),
            epoch: Instant::now(),
            clock_difference: 0,
            timekeeper: false,
            authenticated: false,
            scheduled_update: None,
            notify_deadline: None,
            expected_tag: None,
        }
    }

    /// `true` once synchronisation finished; wrappers are discarded before.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// `true` while this device announces the timer.
    pub fn is_timekeeper(&self) -> bool {
        self.timekeeper
    }

    /// Current timer value in milliseconds.
    pub fn current_value(&self) -> u64 {
        let elapsed = Instant::now().duration_since(self.epoch).as_millis() as i64;
        (elapsed + self.clock_difference).max(0) as u64
    }

    fn advance_to(&mut self, received: u64, local: u64) {
        self.clock_difference += received as i64 - local as i64;
    }

    /// When the next notify is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.notify_deadline
    }

    fn reschedule(&mut self, update: Option<UpdateTarget>) {
        let window = match (update.is_some(), self.timekeeper) {
            (true, true) => self.windows.keeper_update,
            (true, false) => self.windows.follower_update,
            (false, true) => self.windows.keeper_periodic,
            (false, false) => self.windows.follower_periodic,
        };
        self.scheduled_update = update;
        self.notify_deadline = Some(Instant::now() + window.pick());
    }

    fn become_follower(&mut self) {
        if self.timekeeper {
            knx_log!(debug, "Becoming time follower");
            self.timekeeper = false;
        }
    }

    /// The notify timer expired: build the notify to send.
    ///
    /// Whoever's timer runs out first takes over as timekeeper.
    pub fn on_deadline(&mut self) -> TimerNotify {
        let notify = match self.scheduled_update {
            Some((tag, serial)) => self.timer_notify(tag, serial),
            None => self.timer_notify(rand::random(), self.serial_number),
        };
        if !self.timekeeper {
            knx_log!(debug, "Becoming timekeeper");
            self.timekeeper = true;
        }
        self.reschedule(None);
        notify
    }

    fn notify_blocks(timer: &[u8; 6], serial: &[u8; 6], tag: u16) -> ([u8; 16], [u8; 16]) {
        let mut block_0 = [0u8; 16];
        block_0[..6].copy_from_slice(timer);
        block_0[6..12].copy_from_slice(serial);
        block_0[12..14].copy_from_slice(&tag.to_be_bytes());
        let mut counter_0 = block_0;
        counter_0[14..].copy_from_slice(&[0xFF, 0x00]);
        (block_0, counter_0)
    }

    fn timer_notify(&self, message_tag: u16, serial_number: [u8; 6]) -> TimerNotify {
        let timer_value = sequence_bytes(self.current_value());
        let (block_0, counter_0) = Self::notify_blocks(&timer_value, &serial_number, message_tag);
        let mac = cbc_mac(&self.backbone_key, &TIMER_NOTIFY_HEADER, &[], &block_0);
        TimerNotify {
            timer_value,
            serial_number,
            message_tag,
            message_authentication_code: ctr(&self.backbone_key, &counter_0, &mac, &[]).1,
        }
    }

    fn verify(&self, notify: &TimerNotify) -> bool {
        let (block_0, counter_0) =
            Self::notify_blocks(&notify.timer_value, &notify.serial_number, notify.message_tag);
        let expected = cbc_mac(&self.backbone_key, &TIMER_NOTIFY_HEADER, &[], &block_0);
        let received = ctr(
            &self.backbone_key,
            &counter_0,
            &notify.message_authentication_code,
            &[],
        )
        .1;
        macs_equal(&expected, &received)
    }

    /// Start synchronisation: the returned notify asks the timekeeper for
    /// an update carrying our serial number and a fresh tag.
    pub fn start_synchronization(&mut self) -> TimerNotify {
        let tag = rand::random();
        self.expected_tag = Some(tag);
        self.timer_notify(tag, self.serial_number)
    }

    /// How long to wait for the timekeeper's answer.
    pub fn synchronization_timeout(&self) -> Duration {
        Duration::from_millis(self.windows.follower_update.max + 2 * self.latency_ms)
    }

    /// Finish synchronisation with the answered timer value, or become
    /// timekeeper if nobody answered.
    pub fn finish_synchronization(&mut self, answer: Option<u64>) {
        self.expected_tag = None;
        match answer {
            Some(value) => {
                let local = self.current_value();
                self.advance_to(value, local);
            }
            None => {
                knx_log!(warn, "Timer synchronization not answered. Becoming timekeeper.");
                self.timekeeper = true;
            }
        }
        self.authenticated = true;
        self.reschedule(None);
    }

    /// Process a received `TIMER_NOTIFY`.
    ///
    /// Returns the timer value if the notify answers our pending
    /// synchronisation request.
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` if the MAC does not verify; the timer state is
    /// left untouched.
    pub fn handle_timer_notify(&mut self, notify: &TimerNotify) -> Result<Option<u64>> {
        if !self.verify(notify) {
            knx_log!(warn, "TimerNotify with invalid MAC discarded");
            return Err(KnxError::authentication_failed());
        }
        let received = sequence_value(&notify.timer_value);
        if self.expected_tag == Some(notify.message_tag) && notify.serial_number == self.serial_number {
            return Ok(Some(received));
        }
        let local = self.current_value();
        if received > local {
            self.advance_to(received, local);
            self.become_follower();
            self.reschedule(None);
        } else if received + self.sync_latency_ms > local {
            self.become_follower();
            self.reschedule(None);
        } else if received + self.latency_ms <= local && self.scheduled_update.is_none() {
            self.reschedule(Some((notify.message_tag, notify.serial_number)));
        }
        Ok(None)
    }

    /// Check the timer value of a received wrapper.
    ///
    /// # Errors
    ///
    /// `ReplayOrOutOfOrder` if the wrapper's timer is older than the latency
    /// tolerance; an update notify is scheduled so the sender catches up.
    pub fn validate_wrapper(&mut self, wrapper: &SecureWrapper) -> Result<()> {
        let received = sequence_value(&wrapper.sequence_information);
        let local = self.current_value();
        if received > local {
            self.advance_to(received, local);
            if self.scheduled_update.is_none() {
                self.reschedule(None);
            }
            return Ok(());
        }
        if received + self.sync_latency_ms > local {
            if self.scheduled_update.is_none() {
                self.reschedule(None);
            }
            return Ok(());
        }
        if received + self.latency_ms > local {
            return Ok(());
        }
        if self.scheduled_update.is_none() {
            self.reschedule(Some((wrapper.message_tag, wrapper.serial_number)));
        }
        knx_log!(warn, "SecureWrapper timer {} behind local {}", received, local);
        Err(KnxError::replay_or_out_of_order())
    }

    /// Timer value for an outgoing wrapper.
    pub fn outgoing_value(&mut self) -> u64 {
        if self.scheduled_update.is_none() {
            self.reschedule(None);
        }
        self.current_value()
    }
}

impl fmt::Debug for SecureTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureTimer")
            .field("timekeeper", &self.timekeeper)
            .field("authenticated", &self.authenticated)
            .field("clock_difference", &self.clock_difference)
            .field("notify_deadline", &self.notify_deadline)
            .finish_non_exhaustive()
    }
}
