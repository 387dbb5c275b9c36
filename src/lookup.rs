use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, warn };

use crate::events::{ EventBus, UiEvent };

/// Source of station pictures, keyed by callsign.
///
/// Implementations may block (an HTTP scrape, a file lookup); the worker
/// runs them on the blocking pool.
pub trait CallsignLookup: Send + Sync + 'static {
    fn lookup(&self, call: &str) -> Option<String>;
}

/// Lookup that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLookup;

impl CallsignLookup for NoLookup {
    fn lookup(&self, _call: &str) -> Option<String> {
        None
    }
}

/// Fire-and-forget handle used by the RX and TX paths.
#[derive(Clone)]
pub struct LookupHandle {
    tx: mpsc::Sender<String>,
}

impl LookupHandle {
    /// Queue a lookup; dropped silently if the worker is busy.
    pub fn request(&self, call: &str) {
        if self.tx.try_send(call.to_string()).is_err() {
            debug!(call, "lookup request dropped");
        }
    }

    /// Handle whose requests go nowhere.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        LookupHandle { tx }
    }
}

/// Spawn the lookup worker. Results (cached per callsign for the life of
/// the process, misses included) go out as [`UiEvent::Avatar`].
pub fn spawn_lookup_worker(
    lookup: Arc<dyn CallsignLookup>,
    events: EventBus,
    shutdown: CancellationToken
) -> (LookupHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<String>(32);
    let handle = tokio::spawn(async move {
        let mut cache: HashMap<String, Option<String>> = HashMap::new();
        loop {
            let call = tokio::select! {
                _ = shutdown.cancelled() => break,
                call = rx.recv() => match call {
                    Some(c) => c,
                    None => break,
                },
            };

            let image_url = match cache.get(&call) {
                Some(hit) => hit.clone(),
                None => {
                    let lookup = lookup.clone();
                    let key = call.clone();
                    let result = match tokio::task::spawn_blocking(move || lookup.lookup(&key)).await {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(call = %call, error = %e, "lookup task failed");
                            None
                        }
                    };
                    cache.insert(call.clone(), result.clone());
                    result
                }
            };
            events.emit(UiEvent::Avatar { call, image_url });
        }
        debug!("lookup worker stopped");
    });
    (LookupHandle { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use std::sync::atomic::{ AtomicUsize, Ordering };

    struct Counting(AtomicUsize);

    impl CallsignLookup for Counting {
        fn lookup(&self, call: &str) -> Option<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            (call == "N4IRR").then(|| "https://example.invalid/n4irr.jpg".to_string())
        }
    }

    #[tokio::test]
    async fn test_results_are_cached() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let (events, mut rx) = EventBus::new(16, Stats::new());
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_lookup_worker(counting.clone(), events, shutdown.clone());

        handle.request("N4IRR");
        handle.request("N4IRR");
        handle.request("W1AW");

        let first = rx.recv().await.unwrap();
        assert_eq!(first, UiEvent::Avatar {
            call: "N4IRR".into(),
            image_url: Some("https://example.invalid/n4irr.jpg".into()),
        });
        assert_eq!(rx.recv().await.unwrap(), first);
        assert_eq!(rx.recv().await.unwrap(), UiEvent::Avatar { call: "W1AW".into(), image_url: None });
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_disabled_handle_never_blocks() {
        let handle = LookupHandle::disabled();
        handle.request("N4IRR");
        handle.request("N4IRR");
        assert_eq!(NoLookup.lookup("N4IRR"), None);
    }
}
