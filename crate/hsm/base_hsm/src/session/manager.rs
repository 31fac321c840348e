use std::{
    collections::HashMap,
    fmt, ptr,
    sync::{Arc, Mutex, MutexGuard},
};

use bitflags::bitflags;
use pkcs11_sys::{CK_FLAGS, CK_SESSION_HANDLE, CK_SLOT_ID, CKF_RW_SESSION, CKF_SERIAL_SESSION};
use tracing::{debug, warn};

use crate::{HError, HResult, hsm_lib::HsmLib, session::Session};

bitflags! {
    /// Options accepted when opening a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionFlags: CK_FLAGS {
        const RW_SESSION = CKF_RW_SESSION;
        const SERIAL_SESSION = CKF_SERIAL_SESSION;
    }
}

impl SessionFlags {
    /// Convert raw `CKF_*` bits, refusing any bit that is not a session option.
    pub fn from_raw(flags: CK_FLAGS) -> HResult<Self> {
        Self::from_bits(flags).ok_or(HError::InvalidSessionFlags(flags))
    }
}

/// Where a session handle stands in its lifecycle. Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Open,
    Closed,
}

/// A process-local reference to a session opened through a [`crate::Token`].
///
/// Ids are never reused, so a handle that has been closed stays closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: u64,
    slot_id: CK_SLOT_ID,
    flags: SessionFlags,
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    #[must_use]
    pub const fn flags(&self) -> SessionFlags {
        self.flags
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session #{} on slot {}", self.id, self.slot_id)
    }
}

struct Registry {
    next_id: u64,
    open: HashMap<u64, Arc<Mutex<Session>>>,
}

/// Owns every native session opened on a module.
///
/// The registry lock is held across `C_OpenSession` and `C_CloseSession` so
/// that the open set always matches what the module knows. Operations only
/// hold the lock of their own session.
pub(crate) struct SessionManager {
    registry: Mutex<Registry>,
}

impl SessionManager {
    pub(crate) fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                open: HashMap::new(),
            }),
        }
    }

    fn registry(&self) -> HResult<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|e| HError::Default(format!("session registry lock poisoned: {e}")))
    }

    pub(crate) fn open(
        &self,
        hsm: &Arc<HsmLib>,
        slot_id: CK_SLOT_ID,
        flags: SessionFlags,
    ) -> HResult<SessionHandle> {
        if !SessionFlags::all().contains(flags) {
            return Err(HError::InvalidSessionFlags(flags.bits()));
        }
        let mut registry = self.registry()?;
        let mut native: CK_SESSION_HANDLE = 0;
        hsm_call!(
            hsm,
            SessionOpenFailed,
            C_OpenSession,
            slot_id,
            flags.bits(),
            ptr::null_mut(),
            None,
            &raw mut native
        );
        let id = registry.next_id;
        registry.next_id += 1;
        registry.open.insert(
            id,
            Arc::new(Mutex::new(Session::new(hsm.clone(), native, slot_id))),
        );
        debug!("opened session #{id} on slot {slot_id} (native handle {native})");
        Ok(SessionHandle { id, slot_id, flags })
    }

    /// Close a session. On failure the session stays open and may be closed
    /// again later.
    pub(crate) fn close(&self, handle: SessionHandle) -> HResult<()> {
        let mut registry = self.registry()?;
        let session = Self::lookup(&registry, handle)?;
        {
            let mut session = session
                .lock()
                .map_err(|e| HError::Default(format!("session lock poisoned: {e}")))?;
            session.close()?;
        }
        registry.open.remove(&handle.id);
        debug!("closed {handle}");
        Ok(())
    }

    /// Run `f` on the session behind `handle`, with that session locked.
    pub(crate) fn with_session<R>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&Session) -> HResult<R>,
    ) -> HResult<R> {
        let session = {
            let registry = self.registry()?;
            Self::lookup(&registry, handle)?
        };
        let session = session
            .lock()
            .map_err(|e| HError::Default(format!("session lock poisoned: {e}")))?;
        // closed while we were waiting for the lock
        if session.is_closed() {
            return Err(HError::SessionClosed(handle.id));
        }
        f(&session)
    }

    fn lookup(registry: &Registry, handle: SessionHandle) -> HResult<Arc<Mutex<Session>>> {
        match registry.open.get(&handle.id) {
            Some(session) => Ok(session.clone()),
            None if handle.id < registry.next_id => Err(HError::SessionClosed(handle.id)),
            None => Err(HError::SessionNotOpen(handle.id)),
        }
    }

    pub(crate) fn state(&self, handle: SessionHandle) -> HResult<SessionState> {
        let registry = self.registry()?;
        Ok(if registry.open.contains_key(&handle.id) {
            SessionState::Open
        } else if handle.id < registry.next_id {
            SessionState::Closed
        } else {
            SessionState::Unopened
        })
    }

    pub(crate) fn open_count(&self) -> HResult<usize> {
        Ok(self.registry()?.open.len())
    }

    /// Run `f` only when no session is open, keeping new sessions out until
    /// it returns.
    pub(crate) fn when_idle<R>(&self, f: impl FnOnce() -> HResult<R>) -> HResult<R> {
        let registry = self.registry()?;
        if !registry.open.is_empty() {
            warn!("{} session(s) still open", registry.open.len());
            return Err(HError::SessionsStillOpen(registry.open.len()));
        }
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_flags_reject_unknown_bits() {
        let flags = SessionFlags::from_raw(CKF_RW_SESSION | CKF_SERIAL_SESSION).unwrap();
        assert_eq!(flags, SessionFlags::RW_SESSION | SessionFlags::SERIAL_SESSION);
        assert!(matches!(
            SessionFlags::from_raw(CKF_SERIAL_SESSION | 0x8000),
            Err(HError::InvalidSessionFlags(_))
        ));
        assert_eq!(SessionFlags::from_raw(0).unwrap(), SessionFlags::empty());
    }

    #[test]
    fn unknown_ids_are_unopened() {
        let manager = SessionManager::new();
        let handle = SessionHandle {
            id: 1,
            slot_id: 1,
            flags: SessionFlags::SERIAL_SESSION,
        };
        assert_eq!(manager.state(handle).unwrap(), SessionState::Unopened);
        assert!(matches!(
            manager.with_session(handle, |_| Ok(())),
            Err(HError::SessionNotOpen(1))
        ));
        assert_eq!(manager.open_count().unwrap(), 0);
        assert!(manager.when_idle(|| Ok(())).is_ok());
    }
}
