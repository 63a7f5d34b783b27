use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use crate::types::Frame;

/// Thread-safe slot holding the most recent value produced by a capture stage.
///
/// Cloning the manager yields another handle to the same slot.
#[derive(Debug)]
pub struct FrameManager<T = Frame> {
    latest: Arc<Mutex<Option<T>>>,
    sequence: Arc<AtomicU64>,
}

impl<T> Clone for FrameManager<T> {
    fn clone(&self) -> Self {
        Self {
            latest: Arc::clone(&self.latest),
            sequence: Arc::clone(&self.sequence),
        }
    }
}

impl<T> Default for FrameManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameManager<T> {
    pub fn new() -> Self {
        Self {
            latest: Arc::new(Mutex::new(None)),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the stored value.
    pub fn update(&self, value: T) {
        if let Ok(mut guard) = self.latest.lock() {
            *guard = Some(value);
            self.sequence.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop the stored value, e.g. when the camera disappears.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.latest.lock() {
            *guard = None;
        }
    }

    /// Number of updates accepted so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl<T: Clone> FrameManager<T> {
    /// Copy of the latest value, if any.
    pub fn get(&self) -> Option<T> {
        match self.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    /// Latest value together with the update count that produced it.
    ///
    /// The count never goes backwards, even across `clear`, so consumers can
    /// use it to skip values they already handled.
    pub fn latest(&self) -> Option<(T, u64)> {
        let guard = self.latest.lock().ok()?;
        let value = guard.clone()?;
        Some((value, self.sequence.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn empty_until_first_update() {
        let manager: FrameManager<u32> = FrameManager::new();
        assert_eq!(manager.get(), None);
        assert_eq!(manager.sequence(), 0);

        manager.update(7);
        manager.update(9);
        assert_eq!(manager.get(), Some(9));
        assert_eq!(manager.sequence(), 2);

        manager.clear();
        assert_eq!(manager.get(), None);
        assert_eq!(manager.sequence(), 2);
    }

    #[test]
    fn latest_pairs_value_with_monotonic_sequence() {
        let manager: FrameManager<u32> = FrameManager::new();
        assert_eq!(manager.latest(), None);

        manager.update(1);
        assert_eq!(manager.latest(), Some((1, 1)));

        manager.clear();
        assert_eq!(manager.latest(), None);
        manager.update(1);
        assert_eq!(manager.latest(), Some((1, 2)));
    }

    #[test]
    fn clones_share_the_slot_across_threads() {
        let manager: FrameManager<String> = FrameManager::new();
        let writer = manager.clone();
        thread::spawn(move || {
            for i in 0..10 {
                writer.update(format!("frame-{i}"));
            }
        })
        .join()
        .unwrap();

        assert_eq!(manager.get().as_deref(), Some("frame-9"));
        assert_eq!(manager.sequence(), 10);
    }
}
