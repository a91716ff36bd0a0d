use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};
use tokio::sync::RwLock;

/// An immutable, published frame. At most one per view-id lives in the
/// [`FrameStore`] at a time.
#[derive(Clone)]
pub struct Frame {
    pub png: Arc<[u8]>,
    pub etag: Arc<str>,
    pub ts: i64,
}

impl Frame {
    pub fn new(png: Vec<u8>) -> Self {
        let etag = format!("\"{}\"", sha1_hex(&png));
        let ts = now_millis();
        Self {
            png: Arc::from(png.into_boxed_slice()),
            etag: Arc::from(etag),
            ts,
        }
    }
}

pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Holds the latest frame per view-id.
#[derive(Default)]
pub struct FrameStore {
    frames: RwLock<HashMap<String, Frame>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, view_id: &str) -> Option<Frame> {
        self.frames.read().await.get(view_id).cloned()
    }

    pub async fn publish(&self, view_id: &str, frame: Frame) {
        self.frames.write().await.insert(view_id.to_string(), frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_quoted_sha1_of_png() {
        let frame = Frame::new(vec![1, 2, 3, 4]);
        let expected = format!("\"{}\"", sha1_hex(&[1, 2, 3, 4]));
        assert_eq!(frame.etag.as_ref(), expected);
        assert_eq!(frame.etag.len(), 42);
    }

    #[tokio::test]
    async fn store_round_trips_latest_frame() {
        let store = FrameStore::new();
        assert!(store.get("a").await.is_none());
        let frame = Frame::new(vec![9, 9, 9]);
        store.publish("a", frame.clone()).await;
        let fetched = store.get("a").await.unwrap();
        assert_eq!(fetched.etag, frame.etag);
    }
}
