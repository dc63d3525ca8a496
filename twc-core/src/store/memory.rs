//! In-memory object store used by tests.
#![cfg(any(test, feature = "test-utils"))]

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{ByteRange, ByteStream, ObjectStore, StoreError};

type ObjectKey = (String, String);

/// Object store backed by a hash map, with request counting, injected
/// failures and optional latency.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ObjectKey, Bytes>>,
    gets: Mutex<HashMap<ObjectKey, usize>>,
    failing: Mutex<HashSet<ObjectKey>>,
    latency: Option<Duration>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every request, making concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    pub fn remove(&self, bucket: &str, key: &str) {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Makes every request for the object fail with a transport error.
    pub fn fail_requests(&self, bucket: &str, key: &str) {
        self.failing
            .lock()
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Number of GET requests issued for the object.
    pub fn get_count(&self, bucket: &str, key: &str) -> usize {
        self.gets
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    async fn simulate_request(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self
            .failing
            .lock()
            .contains(&(bucket.to_string(), key.to_string()))
        {
            return Err(StoreError::Request {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ByteStream>, StoreError> {
        *self
            .gets
            .lock()
            .entry((bucket.to_string(), key.to_string()))
            .or_default() += 1;
        self.simulate_request(bucket, key).await?;

        let Some(body) = self.object(bucket, key) else {
            return Ok(None);
        };

        let body = match range {
            Some(range) => {
                let start = (range.start as usize).min(body.len());
                let end = (range.end as usize).saturating_add(1).min(body.len());
                body.slice(start..end.max(start))
            }
            None => body,
        };

        Ok(Some(Box::pin(Cursor::new(body))))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.simulate_request(bucket, key).await?;
        self.insert(bucket, key, body);
        Ok(())
    }
}
