//! Hand-driven context and transport for unit tests.

use async_trait::async_trait;
use healer_env::{ContextId, EnvError, Envelope, HealerContext, Subscription, Transport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock that only moves when told to.
pub struct ManualContext {
    now_ms: AtomicU64,
}

impl ManualContext {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicU64::new(start_ms),
        })
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealerContext for ManualContext {
    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration.as_millis() as u64);
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn random_f64(&self) -> f64 {
        0.5
    }

    fn seed(&self) -> u64 {
        0
    }
}

/// Transport that records what was handed to it.
pub struct RecordingTransport {
    local_id: ContextId,
    sent: Mutex<Vec<Envelope>>,
    dropping: AtomicBool,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new(local_id: ContextId) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            sent: Mutex::new(Vec::new()),
            dropping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Makes every send report a chaos drop.
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }

    pub fn take_sent(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), EnvError> {
        if self.is_closed() {
            return Err(EnvError::Closed);
        }
        if self.dropping.load(Ordering::SeqCst) {
            return Err(EnvError::Dropped);
        }
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }

    fn subscribe(&self) -> Result<Subscription, EnvError> {
        let (_tx, subscription) = Subscription::channel();
        Ok(subscription)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn local_id(&self) -> ContextId {
        self.local_id
    }
}
