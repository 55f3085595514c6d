use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::backfill::{now_s, LiveBar, SessionBuffer};
use crate::chain::LiveSource;
use crate::db::bars::BarKind;

const CHANNEL_CAPACITY: usize = 64;

struct PollState {
    subscribers: usize,
    task: Option<JoinHandle<()>>,
}

/// Live bar fan-out for one (series, kind).
///
/// A single poll task reads the current value on a fixed cadence, merges it
/// into the shared session buffer and broadcasts the affected bar.  The task
/// starts with the first subscriber and is torn down with the last one, so an
/// idle feed costs no external reads.  Delivery is lag-tolerant: a slow
/// subscriber misses intermediate bars but always observes the latest.
pub struct LiveFeed {
    series_id: String,
    kind: BarKind,
    poll_ms: u64,
    source: Arc<dyn LiveSource>,
    buf: Arc<Mutex<SessionBuffer>>,
    tx: broadcast::Sender<LiveBar>,
    poll: Mutex<PollState>,
}

impl LiveFeed {
    pub fn new(
        series_id: String,
        kind: BarKind,
        poll_ms: u64,
        source: Arc<dyn LiveSource>,
        buf: Arc<Mutex<SessionBuffer>>,
    ) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            series_id,
            kind,
            poll_ms,
            source,
            buf,
            tx,
            poll: Mutex::new(PollState {
                subscribers: 0,
                task: None,
            }),
        }
    }

    pub fn source(&self) -> &dyn LiveSource {
        self.source.as_ref()
    }

    /// Attach a subscriber, starting the poll task if this is the first one.
    pub async fn subscribe(&self) -> broadcast::Receiver<LiveBar> {
        let rx = self.tx.subscribe();
        let mut poll = self.poll.lock().await;
        poll.subscribers += 1;
        if poll.task.is_none() {
            poll.task = Some(self.spawn_poll_task());
        }
        rx
    }

    /// Detach one subscriber; the poll task stops when none remain.
    /// The subscriber's own receiver stops delivering when dropped.
    pub async fn unsubscribe(&self) {
        let mut poll = self.poll.lock().await;
        poll.subscribers = poll.subscribers.saturating_sub(1);
        if poll.subscribers == 0 {
            if let Some(task) = poll.task.take() {
                task.abort();
                tracing::debug!(
                    "last subscriber left {}/{}, poll task stopped",
                    self.series_id,
                    self.kind.as_str()
                );
            }
        }
    }

    fn spawn_poll_task(&self) -> JoinHandle<()> {
        let series = self.series_id.clone();
        let kind = self.kind;
        let source = Arc::clone(&self.source);
        let buf = Arc::clone(&self.buf);
        let tx = self.tx.clone();
        let poll_ms = self.poll_ms;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(poll_ms));
            loop {
                interval.tick().await;
                match source.current(&series, kind).await {
                    Ok(value) if !value.is_zero() => {
                        let bar = buf.lock().await.merge(now_s(), value);
                        // Receiver-less send is fine; lagging receivers skip.
                        let _ = tx.send(bar);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Transient: no sample this tick, buffer unchanged.
                        tracing::debug!("live poll for {series} failed: {e}");
                    }
                }
            }
        })
    }
}

/// A feed dropped with live subscribers must not leave its poll task
/// running; the task holds the buffer and keeps issuing point reads.
impl Drop for LiveFeed {
    fn drop(&mut self) {
        if let Some(task) = self.poll.get_mut().task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Returns an increasing value per read; errors when `fail` is set.
    struct CountingSource {
        reads: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl LiveSource for CountingSource {
        async fn current(&self, _series_id: &str, _kind: BarKind) -> Result<Decimal, ChainError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ChainError::Upstream("offline".into()));
            }
            Ok(Decimal::from(100 + n))
        }
    }

    fn feed(fail: bool) -> (LiveFeed, Arc<Mutex<SessionBuffer>>, Arc<CountingSource>) {
        let buf = Arc::new(Mutex::new(SessionBuffer::new()));
        let source = Arc::new(CountingSource {
            reads: AtomicU64::new(0),
            fail,
        });
        let feed = LiveFeed::new(
            "s".to_string(),
            BarKind::Price,
            5,
            Arc::clone(&source) as Arc<dyn LiveSource>,
            Arc::clone(&buf),
        );
        (feed, buf, source)
    }

    #[tokio::test]
    async fn subscribers_share_one_poll_loop() {
        let (feed, _buf, _src) = feed(false);
        let mut rx1 = feed.subscribe().await;
        let mut rx2 = feed.subscribe().await;

        let bar1 = rx1.recv().await.unwrap();
        let bar2 = rx2.recv().await.unwrap();
        assert!(bar2.bucket_start >= bar1.bucket_start);

        // One loop, not one per subscriber.
        {
            let poll = feed.poll.lock().await;
            assert_eq!(poll.subscribers, 2);
            assert!(poll.task.is_some());
        }

        feed.unsubscribe().await;
        // Remaining subscriber still receives.
        assert!(rx2.recv().await.is_ok());
        feed.unsubscribe().await;
    }

    #[tokio::test]
    async fn poll_task_stops_with_last_subscriber() {
        let (feed, _buf, _src) = feed(false);
        let _rx = feed.subscribe().await;
        assert!(feed.poll.lock().await.task.is_some());

        feed.unsubscribe().await;
        assert!(feed.poll.lock().await.task.is_none());
    }

    #[tokio::test]
    async fn failed_point_read_skips_tick() {
        let (feed, buf, _src) = feed(true);
        let _rx = feed.subscribe().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(buf.lock().await.is_empty());
        feed.unsubscribe().await;
    }

    #[tokio::test]
    async fn dropping_feed_aborts_poll_task() {
        let (feed, _buf, src) = feed(false);
        let mut rx = feed.subscribe().await;
        rx.recv().await.unwrap(); // polling is live
        drop(feed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_drop = src.reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(src.reads.load(Ordering::SeqCst), after_drop);
    }

    #[tokio::test]
    async fn samples_merge_into_shared_buffer() {
        let (feed, buf, _src) = feed(false);
        let mut rx = feed.subscribe().await;
        let bar = rx.recv().await.unwrap();
        assert_eq!(buf.lock().await.bars().last().unwrap().bucket_start, bar.bucket_start);
        feed.unsubscribe().await;
    }
}
