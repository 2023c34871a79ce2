/*!
Shared fixtures for the integration tests: sample documents and
failure-injecting backing stores.
*/

#![allow(dead_code)]

use async_trait::async_trait;
use drafthold_core::{
    BackingStore, Component, Connection, DraftError, Document, MemoryStore, Result,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Small valid document with one connection
pub fn sample_document(id: &str) -> Document {
    Document::new(id)
        .with_component(Component::new("api", "service", 10.0, 20.0))
        .with_component(Component::new("db", "database", 200.0, 20.0))
        .with_connection(Connection::new("api-db", "api", "db", "reads"))
}

/// Document whose serialized form is well above the compression threshold
/// and compresses well
pub fn large_document(id: &str) -> Document {
    let mut doc = Document::new(id);
    for i in 0..800 {
        doc = doc.with_component(
            Component::new(format!("node-{i}"), "service", i as f64, (i * 2) as f64)
                .with_property("notes", json!("replicated service behind the gateway")),
        );
    }
    doc
}

/// Failure to inject on a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Quota,
    Storage,
}

impl Fault {
    fn into_error(self, key: &str) -> DraftError {
        match self {
            Fault::Quota => DraftError::quota_exceeded(key),
            Fault::Storage => DraftError::storage(format!("injected failure writing {key}")),
        }
    }
}

/// Memory store that fails writes to keys with a given prefix on demand
pub struct FaultyStore {
    inner: MemoryStore,
    prefix: String,
    queued: Mutex<VecDeque<Fault>>,
    always: Mutex<Option<Fault>>,
    writes: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore, prefix: &str) -> Self {
        Self {
            inner,
            prefix: prefix.to_string(),
            queued: Mutex::new(VecDeque::new()),
            always: Mutex::new(None),
            writes: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` matching writes
    pub fn fail_next(&self, fault: Fault, times: usize) {
        let mut queued = self.queued.lock().unwrap();
        queued.extend(std::iter::repeat(fault).take(times));
    }

    /// Fail every matching write until cleared
    pub fn fail_always(&self, fault: Option<Fault>) {
        *self.always.lock().unwrap() = fault;
    }

    /// Matching writes attempted so far, failed or not
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl BackingStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if key.starts_with(&self.prefix) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let fault = self
                .queued
                .lock()
                .unwrap()
                .pop_front()
                .or(*self.always.lock().unwrap());
            if let Some(fault) = fault {
                return Err(fault.into_error(key));
            }
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }
}

/// Memory store whose writes take time and record how many overlap
pub struct SlowStore {
    inner: MemoryStore,
    latency: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl SlowStore {
    pub fn new(latency: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            latency,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Highest number of writes in progress at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Keys in the order their writes completed
    pub fn write_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackingStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.latency).await;
        let result = self.inner.set(key, value).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(key.to_string());
        result
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }
}
