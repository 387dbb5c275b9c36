use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use std::time::{ Duration, Instant };

use tokio_util::sync::CancellationToken;
use tracing::{ debug, info };

/// Gateway-to-speaker side.
#[derive(Debug, Default)]
pub struct RxCounters {
    pub datagrams: AtomicU64,
    pub bytes: AtomicU64,
    pub parse_errors: AtomicU64,
    pub voice_frames_played: AtomicU64,
    /// Closed log rows (keyup edges seen).
    pub transmissions: AtomicU64,
}

/// Microphone/console-to-gateway side. Packets count once per destination,
/// voice frames once per frame.
#[derive(Debug, Default)]
pub struct TxCounters {
    pub packets: AtomicU64,
    pub voice_frames: AtomicU64,
    pub send_errors: AtomicU64,
}

/// Lock-free protocol counters
#[derive(Debug, Default)]
pub struct Stats {
    pub rx: RxCounters,
    pub tx: TxCounters,
    pub events_dropped: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline(always)]
    pub fn record_recv(&self, bytes: usize) {
        self.rx.datagrams.fetch_add(1, Ordering::Relaxed);
        self.rx.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_parse_error(&self) {
        self.rx.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_voice_frame(&self) {
        self.rx.voice_frames_played.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_transmission(&self) {
        self.rx.transmissions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_send(&self) {
        self.tx.packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_voice_sent(&self) {
        self.tx.voice_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_send_error(&self) {
        self.tx.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_event_drop(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset counters, return rates
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);
        let rate = |c: &AtomicU64| (c.swap(0, Ordering::Relaxed) as f64) / secs;

        let rx_bytes = self.rx.bytes.swap(0, Ordering::Relaxed);
        StatsSnapshot {
            rx: RxSnapshot {
                pps: rate(&self.rx.datagrams),
                kbps: ((rx_bytes as f64) * 8.0) / (secs * 1_000.0),
                voice_fps: rate(&self.rx.voice_frames_played),
                transmissions: self.rx.transmissions.swap(0, Ordering::Relaxed),
                parse_errors: self.rx.parse_errors.swap(0, Ordering::Relaxed),
            },
            tx: TxSnapshot {
                pps: rate(&self.tx.packets),
                voice_fps: rate(&self.tx.voice_frames),
                send_errors: self.tx.send_errors.swap(0, Ordering::Relaxed),
            },
            events_dropped: self.events_dropped.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct RxSnapshot {
    pub pps: f64,
    pub kbps: f64,
    pub voice_fps: f64,
    pub transmissions: u64,
    pub parse_errors: u64,
}

#[derive(Debug)]
pub struct TxSnapshot {
    pub pps: f64,
    pub voice_fps: f64,
    pub send_errors: u64,
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub rx: RxSnapshot,
    pub tx: TxSnapshot,
    pub events_dropped: u64,
}

impl StatsSnapshot {
    /// Nothing moved in either direction.
    pub fn is_idle(&self) -> bool {
        self.rx.pps == 0.0 && self.tx.pps == 0.0 && self.events_dropped == 0
    }
}

/// Background stats reporter task
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64, shutdown: CancellationToken) {
    if interval_secs == 0 {
        // Stats disabled: park until shutdown
        shutdown.cancelled().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        if snap.is_idle() {
            debug!("📊 idle");
            continue;
        }
        info!(
            pps = format!("{:.0}", snap.rx.pps),
            kbps = format!("{:.1}", snap.rx.kbps),
            voice_fps = format!("{:.0}", snap.rx.voice_fps),
            transmissions = snap.rx.transmissions,
            parse_errors = snap.rx.parse_errors,
            "📊 rx"
        );
        info!(
            pps = format!("{:.0}", snap.tx.pps),
            voice_fps = format!("{:.0}", snap.tx.voice_fps),
            send_errors = snap.tx.send_errors,
            events_dropped = snap.events_dropped,
            "📊 tx"
        );
    }
}
