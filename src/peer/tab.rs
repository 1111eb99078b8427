//! One active peer connection per tab.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::CommsError;

/// Token shared by every peer manager of one tab. Whoever holds it owns the tab's only
/// live connection.
#[derive(Clone, Debug, Default)]
pub struct TabSlot {
    holder: Arc<Mutex<Option<u64>>>,
}

impl TabSlot {
    /// A free slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `owner`. Re-claiming by the current holder succeeds.
    pub fn claim(&self, owner: u64) -> Result<(), CommsError> {
        let mut holder = self.holder.lock();
        match *holder {
            Some(current) if current != owner => Err(CommsError::ConnectionActive),
            _ => {
                *holder = Some(owner);
                debug!(owner, "tab slot claimed");
                Ok(())
            }
        }
    }

    /// Release the slot if `owner` holds it.
    pub fn release(&self, owner: u64) {
        let mut holder = self.holder.lock();
        if *holder == Some(owner) {
            *holder = None;
            debug!(owner, "tab slot released");
        }
    }

    /// Id of the manager holding the slot, if any.
    pub fn holder(&self) -> Option<u64> {
        *self.holder.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_owner_is_refused_until_release() {
        let slot = TabSlot::new();
        let shared = slot.clone();
        slot.claim(1).unwrap();
        slot.claim(1).unwrap();
        assert!(matches!(shared.claim(2), Err(CommsError::ConnectionActive)));
        shared.release(2);
        assert_eq!(slot.holder(), Some(1));
        slot.release(1);
        shared.claim(2).unwrap();
    }
}
