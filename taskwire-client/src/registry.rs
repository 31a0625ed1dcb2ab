//! Channel registry.
//!
//! Maps correlation keys to their [`TaskChannel`]. The registry is the only
//! owner of channels and their timers; everything else works on short-lived
//! snapshots so no lock is ever held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use tokio::task::AbortHandle;

use crate::channel::{ChannelInfo, ChannelSnapshot, ErrorCallback, TaskChannel, TimerKind};
use crate::metrics::set_active_channels;

#[derive(Debug, Default)]
struct RegistryInner {
    channels: HashMap<String, TaskChannel>,
    next_generation: u64,
    next_timer_id: u64,
}

/// Shared table of active task channels.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a channel. Returns `false` and leaves the table untouched if
    /// the key is already taken.
    pub fn register(&self, channel: TaskChannel) -> bool {
        self.register_with_generation(channel).is_some()
    }

    /// Register a channel and return the generation stamped on it.
    pub(crate) fn register_with_generation(&self, mut channel: TaskChannel) -> Option<u64> {
        let mut inner = self.write();
        if inner.channels.contains_key(channel.key()) {
            tracing::debug!(key = %channel.key(), "Duplicate channel registration ignored");
            return None;
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        channel.generation = generation;
        inner.channels.insert(channel.key().to_string(), channel);
        set_active_channels(inner.channels.len());
        Some(generation)
    }

    /// Remove a channel, cancelling its pending timers.
    pub fn remove(&self, key: &str) -> Option<TaskChannel> {
        let mut inner = self.write();
        let mut channel = inner.channels.remove(key)?;
        channel.terminate();
        set_active_channels(inner.channels.len());
        Some(channel)
    }

    /// Remove a channel only if it is still the registration identified by
    /// `generation`.
    pub(crate) fn remove_if_generation(&self, key: &str, generation: u64) -> bool {
        let mut inner = self.write();
        let matches = inner
            .channels
            .get(key)
            .is_some_and(|channel| channel.generation == generation);
        if !matches {
            return false;
        }
        if let Some(mut channel) = inner.channels.remove(key) {
            channel.terminate();
        }
        set_active_channels(inner.channels.len());
        true
    }

    pub(crate) fn is_registered(&self, key: &str, generation: u64) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .get(key)
            .is_some_and(|channel| channel.generation == generation)
    }

    /// Whether a channel with this key is registered.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .contains_key(key)
    }

    /// Read-only view of every registered channel.
    #[must_use]
    pub fn all(&self) -> Vec<ChannelInfo> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<ChannelInfo> = inner.channels.values().map(TaskChannel::info).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .len()
    }

    /// Whether no channel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn snapshot(&self, key: &str) -> Option<ChannelSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .get(key)
            .map(TaskChannel::snapshot)
    }

    /// Arm a timer slot of the channel registered as `(key, generation)`.
    ///
    /// `spawn` receives the timer id and must return the handle of the spawned
    /// timer task. It runs under the write lock, so the timer cannot release
    /// its slot before the slot holds it. Returns `false` without calling
    /// `spawn` when the channel is gone, replaced or terminated.
    pub(crate) fn install_timer<F>(
        &self,
        key: &str,
        generation: u64,
        kind: TimerKind,
        spawn: F,
    ) -> bool
    where
        F: FnOnce(u64) -> AbortHandle,
    {
        let mut inner = self.write();
        inner.next_timer_id += 1;
        let id = inner.next_timer_id;
        let Some(channel) = inner.channels.get_mut(key) else {
            return false;
        };
        if channel.generation != generation || channel.is_terminated() {
            return false;
        }
        channel.timers.replace(kind, id, spawn(id));
        true
    }

    /// Called by a firing timer. Returns `false` when the timer no longer
    /// belongs to a live registration and must not act.
    pub(crate) fn release_timer(
        &self,
        key: &str,
        generation: u64,
        kind: TimerKind,
        id: u64,
    ) -> bool {
        let mut inner = self.write();
        match inner.channels.get_mut(key) {
            Some(channel) if channel.generation == generation => channel.timers.release(kind, id),
            _ => false,
        }
    }

    /// Split the table for a fresh connection: external channels are removed
    /// (timers cancelled) and returned, internal channel keys are returned
    /// for re-arming.
    pub(crate) fn partition_for_reconnect(&self) -> (Vec<String>, Vec<TaskChannel>) {
        let mut inner = self.write();
        let external: Vec<String> = inner
            .channels
            .iter()
            .filter(|(_, channel)| !channel.is_internal())
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = Vec::with_capacity(external.len());
        for key in external {
            if let Some(mut channel) = inner.channels.remove(&key) {
                channel.terminate();
                removed.push(channel);
            }
        }
        let mut internal: Vec<String> = inner.channels.keys().cloned().collect();
        internal.sort();
        set_active_channels(inner.channels.len());
        (internal, removed)
    }

    pub(crate) fn error_callbacks(&self) -> Vec<ErrorCallback> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .values()
            .filter_map(TaskChannel::error_callback)
            .collect()
    }

    /// Remove every channel, cancelling all timers.
    pub(crate) fn clear(&self) {
        let mut inner = self.write();
        for (_, mut channel) in inner.channels.drain() {
            channel.terminate();
        }
        set_active_channels(0);
    }
}
