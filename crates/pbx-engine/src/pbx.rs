use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use pbx_core::Extension;
use pbx_config::PbxConfig;
use tracing::info;

use crate::tu::Tu;

/// Failure modes of the extension directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PbxError {
    /// Every extension slot is taken.
    DirectoryFull,
    /// The unit is not (or no longer) in the directory.
    NotRegistered,
}

impl std::fmt::Display for PbxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PbxError::DirectoryFull => write!(f, "extension directory is full"),
            PbxError::NotRegistered => write!(f, "telephone unit is not registered"),
        }
    }
}

impl std::error::Error for PbxError {}

/// The extension directory: a fixed number of slots, one per registrable
/// unit, where the slot index is the extension number.
///
/// The directory lock is ordered before any unit lock. Operations that
/// resolve or remove units keep it held across the unit transition so a
/// unit cannot leave the directory while a dial still routes to it.
pub struct Pbx {
    slots: Mutex<Vec<Option<Arc<Tu>>>>,
    /// Signalled on every unregistration; shutdown waits on it until the
    /// directory is empty.
    drained: Condvar,
}

impl Pbx {
    pub fn new(cfg: &PbxConfig) -> Pbx {
        Pbx {
            slots: Mutex::new(vec![None; cfg.max_extensions]),
            drained: Condvar::new(),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<Arc<Tu>>>> {
        self.slots.lock().unwrap()
    }

    /// Assigns the lowest free extension to `tu`, announces the unit's
    /// initial state on its connection, and keeps a handle in the slot.
    pub fn register(&self, tu: Arc<Tu>) -> Result<Extension, PbxError> {
        let mut slots = self.lock_slots();
        let Some(idx) = slots.iter().position(|s| s.is_none()) else {
            tracing::warn!("registry full: all {} extensions in use", slots.len());
            return Err(PbxError::DirectoryFull);
        };
        let ext = idx as Extension;
        tu.assign_extension(ext);
        slots[idx] = Some(tu.clone());
        info!("TU {}: registered ({}/{} extensions in use)", ext, occupied_of(&slots), slots.len());
        tu.notify_current();
        Ok(ext)
    }

    /// Removes `tu` from the directory, hanging up any call it is part of
    /// first so the far end is notified while both units are still routable.
    pub fn unregister(&self, tu: &Arc<Tu>) -> Result<(), PbxError> {
        let mut slots = self.lock_slots();
        let Some(idx) = slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|t| Arc::ptr_eq(t, tu)))
        else {
            return Err(PbxError::NotRegistered);
        };
        tu.hangup();
        slots[idx] = None;
        info!("TU {}: unregistered ({}/{} extensions in use)", idx, occupied_of(&slots), slots.len());
        self.drained.notify_all();
        Ok(())
    }

    /// Resolves `ext` and lets the registered caller dial it. Resolution and
    /// the dial happen under the directory lock, so the target cannot be
    /// unregistered halfway into the link.
    pub fn dial(&self, tu: &Arc<Tu>, ext: Extension) -> Result<(), PbxError> {
        let slots = self.lock_slots();
        if !slots
            .iter()
            .flatten()
            .any(|t| Arc::ptr_eq(t, tu))
        {
            return Err(PbxError::NotRegistered);
        }
        let target = slots.get(ext as usize).and_then(|s| s.as_ref());
        tu.dial(target);
        Ok(())
    }

    /// Two-phase shutdown: abort every registered unit's connection, then
    /// block until the servicing threads have unregistered them all.
    pub fn shutdown(&self) {
        let slots = self.lock_slots();
        let open = occupied_of(&slots);
        info!("shutdown: aborting {} open connections", open);
        for tu in slots.iter().flatten() {
            tu.shutdown_link();
        }
        let _slots = self
            .drained
            .wait_while(slots, |slots| slots.iter().any(|s| s.is_some()))
            .unwrap();
        info!("shutdown: directory drained");
    }

    /// Number of extensions currently in use.
    pub fn occupied(&self) -> usize {
        occupied_of(&self.lock_slots())
    }
}

fn occupied_of(slots: &[Option<Arc<Tu>>]) -> usize {
    slots.iter().flatten().count()
}
