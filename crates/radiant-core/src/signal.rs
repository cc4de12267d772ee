//! Minimal multi-slot signal used for change broadcasts between subsystems.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Signal::connect`], used to disconnect the slot again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection(u64);

/// A list of callbacks invoked in connection order.
///
/// Slots are called without holding the internal lock, so a slot may connect or
/// disconnect other slots (changes take effect on the next emission).
pub struct Signal<T> {
    slots: Mutex<Vec<(u64, Slot<T>)>>,
    next_id: AtomicU64,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connect(&self, slot: impl Fn(&T) + Send + Sync + 'static) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push((id, Arc::new(slot)));
        Connection(id)
    }

    pub fn disconnect(&self, connection: Connection) {
        self.slots.lock().retain(|(id, _)| *id != connection.0);
    }

    pub fn emit(&self, value: &T) {
        let slots: Vec<Slot<T>> = self.slots.lock().iter().map(|(_, s)| s.clone()).collect();
        for slot in slots {
            slot(value);
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").field("slots", &self.slot_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_and_disconnect() {
        let signal = Signal::<usize>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t = total.clone();
        let conn = signal.connect(move |v| {
            t.fetch_add(*v, Ordering::SeqCst);
        });

        signal.emit(&3);
        signal.emit(&4);
        assert_eq!(total.load(Ordering::SeqCst), 7);

        signal.disconnect(conn);
        signal.emit(&10);
        assert_eq!(total.load(Ordering::SeqCst), 7);
        assert_eq!(signal.slot_count(), 0);
    }
}
