use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Hands out isolate box ids so that concurrent sandboxes never share a box
pub struct BoxPool {
    free: Mutex<BTreeSet<u32>>,
}

impl BoxPool {
    pub fn new(first: u32, count: u32) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((first..first.saturating_add(count)).collect()),
        })
    }

    /// Takes the lowest free id, or `None` when every box is in use
    pub fn lease(self: &Arc<Self>) -> Option<BoxLease> {
        let id = self.free.lock().pop_first()?;
        Some(BoxLease {
            id,
            pool: Arc::clone(self),
        })
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// A box id in use; returned to the pool on drop
pub struct BoxLease {
    id: u32,
    pool: Arc<BoxPool>,
}

impl BoxLease {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        self.pool.free.lock().insert(self.id);
    }
}
