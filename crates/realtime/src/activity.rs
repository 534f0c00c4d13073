//! App activity tracking.
//!
//! The manager keeps two flags, network online and app foregrounded. Errors
//! while either is false close the channel without retrying; turning both
//! back on sweeps every idle, closed or errored channel into the
//! resubscribe queue.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manager::RealtimeManager;
use crate::transport::RealtimeTransport;
use crate::types::RealtimeEvent;

/// Platform activity signal fed in by the embedding app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    Online,
    Offline,
    Foreground,
    Background,
}

impl<T: RealtimeTransport> RealtimeManager<T> {
    pub fn set_online_status(&self, online: bool) {
        self.apply_activity(|reg_online, _| {
            let changed = *reg_online != online;
            *reg_online = online;
            changed
        });
    }

    pub fn set_active_status(&self, active: bool) {
        self.apply_activity(|_, reg_active| {
            let changed = *reg_active != active;
            *reg_active = active;
            changed
        });
    }

    pub fn is_online(&self) -> bool {
        self.registry().is_online
    }

    pub fn is_active(&self) -> bool {
        self.registry().is_active
    }

    /// Maps a platform signal onto the matching setter.
    pub fn apply_activity_signal(&self, signal: ActivitySignal) {
        match signal {
            ActivitySignal::Online => self.set_online_status(true),
            ActivitySignal::Offline => self.set_online_status(false),
            ActivitySignal::Foreground => self.set_active_status(true),
            ActivitySignal::Background => self.set_active_status(false),
        }
    }

    /// Queues a resubscribe for every channel that is not subscribed,
    /// subscribing or already reconnecting.
    pub fn resubscribe_inactive_channels(&self) {
        let mut topics: Vec<String> = self
            .registry()
            .channels
            .iter()
            .filter(|(_, state)| !state.status().is_live())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort_unstable();

        if !topics.is_empty() {
            info!(count = topics.len(), "resubscribing inactive channels");
        }
        for topic in &topics {
            self.resubscribe(topic);
        }
    }

    fn apply_activity(&self, update: impl FnOnce(&mut bool, &mut bool) -> bool) {
        let (online, active) = {
            let mut reg = self.registry();
            let reg = &mut *reg;
            if !update(&mut reg.is_online, &mut reg.is_active) {
                return;
            }
            (reg.is_online, reg.is_active)
        };

        info!(online, active, "activity changed");
        self.emit(RealtimeEvent::ActivityChanged { online, active });
        if online && active {
            self.resubscribe_inactive_channels();
        }
    }
}

/// Background task forwarding [`ActivitySignal`]s into a manager.
pub struct ActivityMonitor {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ActivityMonitor {
    /// Spawns the forwarding loop. It stops when `signals` closes or on
    /// [`stop`](Self::stop).
    pub fn spawn<T: RealtimeTransport>(
        manager: RealtimeManager<T>,
        mut signals: mpsc::Receiver<ActivitySignal>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    signal = signals.recv() => match signal {
                        Some(signal) => {
                            debug!(?signal, "activity signal");
                            manager.apply_activity_signal(signal);
                        }
                        None => break,
                    },
                }
            }
            debug!("activity monitor stopped");
        });
        Self { handle, cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::RealtimeConfig;
    use crate::memory::MemoryTransport;
    use crate::types::{ChannelStatus, SubscribeStatus};

    fn manager() -> (RealtimeManager<MemoryTransport>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        (
            RealtimeManager::new(transport.clone(), RealtimeConfig::default()),
            transport,
        )
    }

    #[tokio::test]
    async fn starts_online_and_active() {
        let (mgr, _) = manager();
        assert!(mgr.is_online());
        assert!(mgr.is_active());
    }

    #[tokio::test]
    async fn unchanged_flag_emits_nothing() {
        let (mgr, _) = manager();
        let mut events = mgr.take_events().unwrap();

        mgr.set_online_status(true);
        mgr.set_active_status(true);

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_while_backgrounded_closes_without_retry() {
        let (mgr, transport) = manager();
        transport.push_outcomes("a", [Some(SubscribeStatus::ChannelError(None))]);
        mgr.add_channel(mgr.channel("a"));
        mgr.set_active_status(false);

        mgr.subscribe("a", None).await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(mgr.get_channel_status("a"), Some(ChannelStatus::Closed));
        assert!(mgr.queued_topics().is_empty());
        assert_eq!(transport.removed_count("a"), 1);
        assert_eq!(mgr.subscriber_count("a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn foregrounding_resubscribes_closed_channels() {
        let (mgr, transport) = manager();
        transport.push_outcomes("a", [Some(SubscribeStatus::TimedOut)]);
        mgr.add_channel(mgr.channel("a"));
        mgr.add_channel(mgr.channel("b"));
        mgr.set_active_status(false);
        mgr.subscribe("a", None).await.unwrap();
        mgr.subscribe("b", None).await.unwrap();
        assert_eq!(mgr.get_channel_status("a"), Some(ChannelStatus::Closed));
        assert_eq!(mgr.get_channel_status("b"), Some(ChannelStatus::Subscribed));

        mgr.set_active_status(true);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(mgr.get_channel_status("a"), Some(ChannelStatus::Subscribed));
        assert_eq!(transport.subscribe_count("a"), 2);
        assert_eq!(transport.subscribe_count("b"), 1);
    }

    #[tokio::test]
    async fn monitor_forwards_signals() {
        let (mgr, _) = manager();
        let (tx, rx) = mpsc::channel(8);
        let monitor = ActivityMonitor::spawn(mgr.clone(), rx);

        tx.send(ActivitySignal::Offline).await.unwrap();
        tx.send(ActivitySignal::Background).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!mgr.is_online());
        assert!(!mgr.is_active());

        tx.send(ActivitySignal::Online).await.unwrap();
        drop(tx);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn monitor_exits_when_sender_dropped() {
        let (mgr, _) = manager();
        let (tx, rx) = mpsc::channel::<ActivitySignal>(1);
        let monitor = ActivityMonitor::spawn(mgr, rx);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), monitor.handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }
}
