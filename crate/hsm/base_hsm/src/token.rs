use std::{path::Path, sync::Arc};

use pkcs11_sys::CK_SLOT_ID;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{
    AttributeTemplate, HResult, KeyHandle, Mechanism, SessionFlags, SessionHandle, SessionState,
    hsm_lib::HsmLib, resolve_library, session::SessionManager,
};

/// A loaded and initialized PKCS#11 module.
///
/// The token is the only owner of the module: sessions are opened and used
/// through it, and it must outlive them. Finalizing is refused while any session
/// is still open. A token dropped without [`Token::finalize`] finalizes the
/// module on drop.
pub struct Token {
    pub(crate) hsm: Arc<HsmLib>,
    sessions: SessionManager,
}

impl Token {
    /// Load the module at `location` and initialize it.
    pub fn load(location: impl AsRef<Path>) -> HResult<Self> {
        let path = resolve_library(location)?;
        debug!("loading PKCS#11 library {}", path.display());
        let token = Self::from_lib(HsmLib::instantiate(&path)?);
        info!("PKCS#11 library {} loaded", path.display());
        Ok(token)
    }

    pub(crate) fn from_lib(hsm: HsmLib) -> Self {
        Self {
            hsm: Arc::new(hsm),
            sessions: SessionManager::new(),
        }
    }

    /// Release the module. Fails with `SessionsStillOpen` while sessions are
    /// open; after success, every call on this token fails.
    pub fn finalize(&self) -> HResult<()> {
        self.sessions.when_idle(|| self.hsm.finalize())
    }

    pub fn open_session(&self, slot_id: CK_SLOT_ID, flags: SessionFlags) -> HResult<SessionHandle> {
        self.sessions.open(&self.hsm, slot_id, flags)
    }

    /// Close a session. The handle is unusable afterwards, including for a
    /// second close.
    pub fn close_session(&self, session: SessionHandle) -> HResult<()> {
        self.sessions.close(session)
    }

    pub fn session_state(&self, session: SessionHandle) -> HResult<SessionState> {
        self.sessions.state(session)
    }

    pub fn open_session_count(&self) -> HResult<usize> {
        self.sessions.open_count()
    }

    /// Encrypt `data` in a single call.
    ///
    /// `output_len` sizes the ciphertext buffer; `None` lets the module report
    /// the length first.
    pub fn encrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: KeyHandle,
        data: &[u8],
        output_len: Option<usize>,
    ) -> HResult<Vec<u8>> {
        self.sessions
            .with_session(session, |s| s.encrypt(mechanism, key, data, output_len))
    }

    pub fn decrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: KeyHandle,
        data: &[u8],
        output_len: Option<usize>,
    ) -> HResult<Zeroizing<Vec<u8>>> {
        self.sessions
            .with_session(session, |s| s.decrypt(mechanism, key, data, output_len))
    }

    /// Digest `data` in a single call. With no `output_len` the buffer is sized
    /// for the mechanism; `Some(0)` is rejected before reaching the module.
    pub fn digest(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        data: &[u8],
        output_len: Option<usize>,
    ) -> HResult<Vec<u8>> {
        self.sessions
            .with_session(session, |s| s.digest(mechanism, data, output_len))
    }

    pub fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &AttributeTemplate,
        label: &str,
        is_private: bool,
    ) -> HResult<KeyHandle> {
        self.sessions.with_session(session, |s| {
            s.generate_key(mechanism, template, label, is_private)
        })
    }

    /// Exactly `len` random bytes from the token generator.
    pub fn generate_random(&self, session: SessionHandle, len: usize) -> HResult<Vec<u8>> {
        self.sessions
            .with_session(session, |s| s.generate_random(len))
    }

    pub fn seed_random(&self, session: SessionHandle, seed: &[u8]) -> HResult<()> {
        self.sessions.with_session(session, |s| s.seed_random(seed))
    }
}
