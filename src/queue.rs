//! Outbound rate limiting and inbound telegram dispatch.
//!
//! Outbound telegrams pass a fixed-interval gate inside the connection task,
//! so the bus sees at most `rate_limit` telegrams per second. Inbound
//! telegrams are never throttled: one dispatcher task hands each telegram,
//! in bus order, to every subscriber whose filter matches.

use crate::addressing::AddressFilter;
use crate::telegram::Telegram;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Fixed-interval gate for outgoing telegrams.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl RateLimiter {
    /// Gate allowing `per_second` telegrams per second. `None` or 0
    /// disables the limit.
    pub fn new(per_second: Option<u32>) -> Self {
        Self {
            interval: per_second
                .filter(|&rate| rate > 0)
                .map(|rate| Duration::from_secs(1) / rate),
            next: None,
        }
    }

    /// Gate that never waits.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Minimum spacing between two telegrams
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Instant the next telegram may go out, if that is in the future.
    pub fn ready_at(&self) -> Option<Instant> {
        self.next.filter(|at| *at > Instant::now())
    }

    /// Record a transmission.
    pub fn record(&mut self) {
        if let Some(interval) = self.interval {
            self.next = Some(Instant::now() + interval);
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    filter: Option<AddressFilter>,
    sender: mpsc::UnboundedSender<Telegram>,
}

impl Subscriber {
    fn wants(&self, telegram: &Telegram) -> bool {
        match (&self.filter, telegram.group_destination()) {
            (None, _) => true,
            (Some(filter), Some(group)) => filter.matches(group),
            (Some(_), None) => false,
        }
    }
}

/// Registry of inbound telegram subscribers.
#[derive(Debug, Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<Vec<Subscriber>>>,
}

impl Subscribers {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to telegrams. `None` receives everything, including
    /// point-to-point telegrams; a filter receives matching group telegrams.
    pub fn subscribe(&self, filter: Option<AddressFilter>) -> TelegramStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { filter, sender });
        TelegramStream { receiver }
    }

    /// Hand `telegram` to every interested subscriber, dropping the ones
    /// that went away. Returns the number of deliveries.
    pub fn dispatch(&self, telegram: &Telegram) -> usize {
        let mut subscribers = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        subscribers.retain(|subscriber| {
            if !subscriber.wants(telegram) {
                return !subscriber.sender.is_closed();
            }
            let alive = subscriber.sender.send(telegram.clone()).is_ok();
            delivered += usize::from(alive);
            alive
        });
        delivered
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// `true` if nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward `inbound` to the subscribers until the connection ends.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<Telegram>) {
        while let Some(telegram) = inbound.recv().await {
            knx_log!(target: telegram, debug, "<- {}", telegram);
            self.dispatch(&telegram);
        }
        knx_log!(debug, "Inbound telegram queue closed");
    }
}

/// Telegrams delivered to one subscriber, in bus order.
#[derive(Debug)]
pub struct TelegramStream {
    receiver: mpsc::UnboundedReceiver<Telegram>,
}

impl TelegramStream {
    /// Next telegram; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Telegram> {
        self.receiver.recv().await
    }

    /// Next telegram if one is waiting.
    pub fn try_recv(&mut self) -> Option<Telegram> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{GroupAddress, IndividualAddress};
    use crate::telegram::{Payload, Tpci};

    fn write(group: &str, value: u8) -> Telegram {
        let group: GroupAddress = group.parse().unwrap();
        Telegram::group_write(group, Payload::Binary(value))
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spacing() {
        let mut limiter = RateLimiter::new(Some(20));
        assert_eq!(limiter.interval(), Some(Duration::from_millis(50)));
        assert!(limiter.ready_at().is_none());
        limiter.record();
        let at = limiter.ready_at().unwrap();
        assert_eq!(at - Instant::now(), Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(limiter.ready_at().is_none());
    }

    #[test]
    fn test_unlimited_never_waits() {
        let mut limiter = RateLimiter::new(Some(0));
        limiter.record();
        assert!(limiter.ready_at().is_none());
        assert!(RateLimiter::unlimited().interval().is_none());
    }

    #[test]
    fn test_dispatch_by_filter() {
        let subscribers = Subscribers::new();
        let mut all = subscribers.subscribe(None);
        let mut lights = subscribers.subscribe(Some("1/*/2-5".parse().unwrap()));

        assert_eq!(subscribers.dispatch(&write("1/7/3", 1)), 2);
        assert_eq!(subscribers.dispatch(&write("2/0/3", 0)), 1);
        let p2p = Telegram::control(IndividualAddress::new(1, 1, 5).unwrap(), Tpci::Connect);
        assert_eq!(subscribers.dispatch(&p2p), 1);

        assert_eq!(lights.try_recv().unwrap(), write("1/7/3", 1));
        assert!(lights.try_recv().is_none());
        assert_eq!(all.try_recv().unwrap(), write("1/7/3", 1));
        assert_eq!(all.try_recv().unwrap(), write("2/0/3", 0));
        assert_eq!(all.try_recv().unwrap(), p2p);
    }

    #[test]
    fn test_dropped_subscriber_removed() {
        let subscribers = Subscribers::new();
        let stream = subscribers.subscribe(None);
        drop(stream);
        assert_eq!(subscribers.dispatch(&write("1/2/3", 1)), 0);
        assert!(subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_run_preserves_order() {
        let subscribers = Subscribers::new();
        let mut stream = subscribers.subscribe(None);
        let (tx, rx) = mpsc::unbounded_channel();
        for value in 0..5 {
            tx.send(write("1/2/3", value)).unwrap();
        }
        drop(tx);
        subscribers.clone().run(rx).await;
        for value in 0..5 {
            assert_eq!(stream.recv().await.unwrap(), write("1/2/3", value));
        }
    }
}
