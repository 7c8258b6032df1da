#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use murmur_crypto::engine::EngineCell;
use murmur_crypto::test_engine::XorEngine;
use murmur_crypto::{
    ensure_identity, DeviceContext, MemoryBlobStore, MemoryDirectory, PairwiseSession,
    SignalStore, DEFAULT_DEVICE_ID,
};

use murmur_call::{
    GroupKeyManager, InboundRouter, KeyReceipt, MediaKeySink, MediaSinkError, MessageKind,
    RetryPolicy, SignalingTransport, TransportError,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub to_user: String,
    pub to_device: String,
    pub kind: MessageKind,
    pub envelope: Vec<u8>,
}

/// Transport that records deliveries and fails on command.
#[derive(Default)]
pub struct FlakyTransport {
    deliveries: Mutex<Vec<Delivery>>,
    failures: Mutex<HashMap<String, u32>>,
    pub sends: AtomicUsize,
}

impl FlakyTransport {
    /// Make the next `count` sends to `peer` fail.
    pub fn fail_next(&self, peer: &str, count: u32) {
        self.failures.lock().insert(peer.to_string(), count);
    }

    pub fn take_deliveries(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.deliveries.lock())
    }
}

#[async_trait]
impl SignalingTransport for FlakyTransport {
    async fn send(
        &self,
        to_user: &str,
        to_device: &str,
        kind: MessageKind,
        envelope: &[u8],
    ) -> Result<(), TransportError> {
        self.sends.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(remaining) = self.failures.lock().get_mut(to_user) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError(format!("injected failure to {to_user}")));
            }
        }
        self.deliveries.lock().push(Delivery {
            to_user: to_user.to_string(),
            to_device: to_device.to_string(),
            kind,
            envelope: envelope.to_vec(),
        });
        Ok(())
    }
}

/// Media sink that records every applied key.
#[derive(Default)]
pub struct RecordingSink {
    applied: Mutex<Vec<(Vec<u8>, u64)>>,
}

impl RecordingSink {
    pub fn indices(&self) -> Vec<u64> {
        self.applied.lock().iter().map(|(_, i)| *i).collect()
    }

    pub fn last(&self) -> Option<(Vec<u8>, u64)> {
        self.applied.lock().last().cloned()
    }
}

impl MediaKeySink for RecordingSink {
    fn apply_key(&self, key: &[u8; 32], index: u64) -> Result<(), MediaSinkError> {
        self.applied.lock().push((key.to_vec(), index));
        Ok(())
    }
}

pub struct Participant {
    pub user: String,
    pub engine: Arc<XorEngine>,
    pub session: Arc<PairwiseSession>,
    pub transport: Arc<FlakyTransport>,
    pub sink: Arc<RecordingSink>,
    pub manager: Arc<GroupKeyManager>,
    pub router: InboundRouter,
}

/// Build a fully bootstrapped participant wired to a shared directory.
pub async fn participant(
    user: &str,
    directory: Arc<MemoryDirectory>,
    channel: &str,
) -> Participant {
    let engine = Arc::new(XorEngine::new());
    let ctx = Arc::new(DeviceContext::new(
        user,
        DEFAULT_DEVICE_ID,
        EngineCell::preloaded(engine.clone()),
        SignalStore::new(Arc::new(MemoryBlobStore::new())),
        directory,
    ));
    ensure_identity(&ctx).await.expect("bootstrap");

    let session = Arc::new(PairwiseSession::new(ctx));
    let transport = Arc::new(FlakyTransport::default());
    let sink = Arc::new(RecordingSink::default());
    let manager = Arc::new(GroupKeyManager::new(
        channel,
        session.clone(),
        transport.clone(),
        sink.clone(),
        RetryPolicy::default(),
    ));
    let router = InboundRouter::new(session.clone());
    router.set_active_call(Some(manager.clone()));

    Participant {
        user: user.to_string(),
        engine,
        session,
        transport,
        sink,
        manager,
        router,
    }
}

/// Drain `from`'s outbox and hand each delivery to its recipient's manager.
pub async fn deliver_all(from: &Participant, others: &[&Participant]) -> Vec<(String, KeyReceipt)> {
    let mut receipts = Vec::new();
    for delivery in from.transport.take_deliveries() {
        let target = others
            .iter()
            .find(|p| p.user == delivery.to_user)
            .expect("delivery to unknown participant");
        let receipt = target
            .manager
            .receive_delivery(&from.user, DEFAULT_DEVICE_ID, &delivery.envelope)
            .await
            .expect("receive delivery");
        receipts.push((delivery.to_user, receipt));
    }
    receipts
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
    }
}
