// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Change-notification bus
//!
//! A per-VFS registry of path subscriptions. Mutating operations emit
//! `rename`/`change` events; every subscriber whose watched prefix matches
//! receives them. A [`Watcher`] is an async stream of events that
//! unsubscribes when closed or dropped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::path::{basename, dirname};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Rename,
    Change,
}

/// The event shape delivered to watchers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// Path of the changed node, relative to the watched path.
    pub filename: String,
}

struct Subscription {
    path: String,
    recursive: bool,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Subscription {
    /// The filename to deliver if this subscription matches `path`.
    fn relative(&self, path: &str) -> Option<String> {
        if path == self.path {
            return Some(basename(path).to_string());
        }
        if self.recursive {
            if let Some(rest) = path.strip_prefix(self.path.as_str()) {
                if let Some(rel) = rest.strip_prefix('/') {
                    return Some(rel.to_string());
                }
                if self.path == "/" {
                    return Some(rest.to_string());
                }
            }
            None
        } else if dirname(path) == self.path {
            Some(basename(path).to_string())
        } else {
            None
        }
    }
}

pub(crate) struct WatcherBus {
    subs: Mutex<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
}

impl WatcherBus {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(self: &Arc<Self>, path: String, recursive: bool) -> Watcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().unwrap().insert(
            id,
            Subscription {
                path,
                recursive,
                tx,
            },
        );
        Watcher {
            id,
            rx,
            bus: Arc::downgrade(self),
        }
    }

    pub fn emit(&self, event_type: EventType, path: &str) {
        let subs = self.subs.lock().unwrap();
        for sub in subs.values() {
            if let Some(filename) = sub.relative(path) {
                // A full receiver just drops the event; watchers are lossy
                // by contract.
                let _ = sub.tx.send(WatchEvent {
                    event_type,
                    filename,
                });
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subs.lock().unwrap().remove(&id);
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }
}

/// A live subscription. Stream of [`WatchEvent`]s; ends after [`close`]
/// (or drop) once buffered events are drained.
///
/// [`close`]: Watcher::close
pub struct Watcher {
    id: u64,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    bus: std::sync::Weak<WatcherBus>,
}

impl Watcher {
    /// Next event, or `None` once the subscription is closed and drained.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Stop receiving new events. Already-delivered events remain readable.
    pub fn close(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
        self.rx.close();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

impl Stream for Watcher {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<WatchEvent>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_exact_and_parent_watchers() {
        let bus = Arc::new(WatcherBus::new());
        let mut on_file = bus.subscribe("/a/f".to_string(), false);
        let mut on_dir = bus.subscribe("/a".to_string(), false);

        bus.emit(EventType::Change, "/a/f");

        let ev = on_file.next_event().await.unwrap();
        assert_eq!(ev.event_type, EventType::Change);
        assert_eq!(ev.filename, "f");

        let ev = on_dir.next_event().await.unwrap();
        assert_eq!(ev.filename, "f");
    }

    #[tokio::test]
    async fn non_recursive_ignores_grandchildren() {
        let bus = Arc::new(WatcherBus::new());
        let mut shallow = bus.subscribe("/a".to_string(), false);
        let mut deep = bus.subscribe("/a".to_string(), true);

        bus.emit(EventType::Rename, "/a/b/c");

        let ev = deep.next_event().await.unwrap();
        assert_eq!(ev.filename, "b/c");

        shallow.close();
        assert!(shallow.next_event().await.is_none());
    }

    #[tokio::test]
    async fn close_unsubscribes_and_ends_stream() {
        let bus = Arc::new(WatcherBus::new());
        let mut w = bus.subscribe("/x".to_string(), false);
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(EventType::Change, "/x");
        w.close();
        assert_eq!(bus.subscriber_count(), 0);

        // Buffered event still delivered, then the stream ends.
        assert!(w.next_event().await.is_some());
        assert!(w.next_event().await.is_none());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = Arc::new(WatcherBus::new());
        let w = bus.subscribe("/x".to_string(), false);
        drop(w);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
