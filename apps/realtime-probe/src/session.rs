//! Simulated wallet session over the in-memory transport.
//!
//! Two channels flap a few times, the app is backgrounded while one of
//! them errors, then comes back to the foreground and everything is torn
//! down again.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use satchel_realtime::{
    ActivityMonitor, ActivitySignal, ChannelStatus, ConnectedCallback, EventFilter, EventKind,
    MemoryTransport, RealtimeConfig, RealtimeEvent, RealtimeManager, SubscribeStatus,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

const BALANCES: &str = "balances";
const QUOTES: &str = "mint-quotes";

/// Counters collected over one run.
#[derive(Debug, Default)]
pub struct Report {
    pub events: usize,
    pub payloads: usize,
    pub reconnects: usize,
}

pub async fn run(config: RealtimeConfig) -> anyhow::Result<Report> {
    let settle = config
        .backoff_ms
        .iter()
        .take(3)
        .sum::<u64>()
        .saturating_add(250);
    let settle = Duration::from_millis(settle);

    let transport = Arc::new(MemoryTransport::new());
    let manager = RealtimeManager::new(transport.clone(), config);
    let mut events = manager
        .take_events()
        .context("event stream already taken")?;
    let collector = tokio::spawn(async move {
        let mut report = Report::default();
        while let Some(event) = events.recv().await {
            report.events += 1;
            match &event {
                RealtimeEvent::Reconnecting { topic, attempt, delay } => {
                    report.reconnects += 1;
                    info!(topic = %topic, attempt, delay_ms = delay.as_millis() as u64, "probe saw reconnect");
                }
                RealtimeEvent::RetriesExhausted { topic, attempts } => {
                    warn!(topic = %topic, attempts, "probe saw retries exhausted");
                }
                other => tracing::debug!(event = ?other, "probe event"),
            }
        }
        report
    });

    let (signals, signal_rx) = mpsc::channel(8);
    let monitor = ActivityMonitor::spawn(manager.clone(), signal_rx);

    let payloads = Arc::new(AtomicUsize::new(0));
    let p = payloads.clone();
    let balances = manager.add_channel(manager.channel(BALANCES).on(
        EventKind::PostgresChanges,
        EventFilter::table("*", "public", "balances"),
        Arc::new(move |payload| {
            p.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(%payload, "balance update");
        }),
    ));
    let quotes = manager.add_channel(manager.channel(QUOTES).on(
        EventKind::Broadcast,
        EventFilter::event("quote_state"),
        Arc::new(|payload| tracing::debug!(%payload, "quote update")),
    ));

    // Balances fail once before joining; quotes time out twice.
    transport.push_outcomes(BALANCES, [Some(SubscribeStatus::ChannelError(Some("socket reset".into())))]);
    transport.push_outcomes(QUOTES, [Some(SubscribeStatus::TimedOut), Some(SubscribeStatus::TimedOut)]);

    let on_connected: ConnectedCallback = Arc::new(|| info!("balances connected"));
    balances.subscribe(Some(on_connected.clone())).await?;
    quotes.subscribe(None).await?;
    tokio::time::sleep(settle).await;

    expect_status(&manager, BALANCES, ChannelStatus::Subscribed)?;
    expect_status(&manager, QUOTES, ChannelStatus::Subscribed)?;
    transport.emit_payload(BALANCES, EventKind::PostgresChanges, &serde_json::json!({"amount": 2100}));

    // Backgrounded: an error closes the channel instead of retrying.
    signals.send(ActivitySignal::Background).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    transport.emit_status(BALANCES, SubscribeStatus::ChannelError(Some("app suspended".into())));
    expect_status(&manager, BALANCES, ChannelStatus::Closed)?;

    // Foreground again: the closed channel is resubscribed.
    signals.send(ActivitySignal::Foreground).await?;
    tokio::time::sleep(settle).await;
    expect_status(&manager, BALANCES, ChannelStatus::Subscribed)?;
    transport.emit_payload(BALANCES, EventKind::PostgresChanges, &serde_json::json!({"amount": 4200}));

    balances.unsubscribe(Some(&on_connected)).await;
    quotes.unsubscribe(None).await;
    monitor.shutdown().await;
    info!(live = transport.live_count(), "session torn down");

    // The event stream ends once every manager clone is gone.
    drop((balances, quotes, manager));
    let mut report = collector.await?;
    report.payloads = payloads.load(Ordering::SeqCst);
    Ok(report)
}

fn expect_status(
    manager: &RealtimeManager<MemoryTransport>,
    topic: &str,
    want: ChannelStatus,
) -> anyhow::Result<()> {
    match manager.get_channel_status(topic) {
        Some(status) if status == want => Ok(()),
        other => bail!("{topic}: expected {want}, got {other:?}"),
    }
}
