use std::{ffi::OsStr, ptr, sync::Mutex};

use libloading::Library;
use pkcs11_sys::{
    CK_C_CloseSession, CK_C_Decrypt, CK_C_DecryptInit, CK_C_Digest, CK_C_DigestInit,
    CK_C_Encrypt, CK_C_EncryptInit, CK_C_Finalize, CK_C_GenerateKey, CK_C_GenerateRandom,
    CK_C_GetInfo, CK_C_GetSlotInfo, CK_C_GetSlotList, CK_C_GetTokenInfo, CK_C_INITIALIZE_ARGS,
    CK_C_Initialize, CK_C_OpenSession, CK_C_SeedRandom, CK_RV, CK_VOID_PTR,
    CKF_OS_LOCKING_OK, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_GENERAL_ERROR, CKR_OK,
};
use tracing::{debug, warn};

use crate::{HError, HResult, error::rv_name};

/// Lifecycle of the loaded module as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModuleState {
    /// Loaded, `C_Initialize` not called yet or rejected.
    Uninitialized,
    Ready,
    Finalized,
    /// The module reported a code after which no further call is meaningful.
    Failed { operation: &'static str, rv: CK_RV },
}

/// The PKCS#11 function table of a dynamically loaded module.
///
/// Only the functions the token layer needs are resolved. The library handle
/// is kept alive for as long as the table exists and the module is finalized
/// on drop if nobody did it before.
pub struct HsmLib {
    // `None` when the table is wired to functions linked into this process.
    pub(crate) _library: Option<Library>,
    pub(crate) state: Mutex<ModuleState>,

    pub(crate) C_Initialize: CK_C_Initialize,
    pub(crate) C_Finalize: CK_C_Finalize,
    pub(crate) C_GetInfo: CK_C_GetInfo,
    pub(crate) C_GetSlotList: CK_C_GetSlotList,
    pub(crate) C_GetSlotInfo: CK_C_GetSlotInfo,
    pub(crate) C_GetTokenInfo: CK_C_GetTokenInfo,

    pub(crate) C_OpenSession: CK_C_OpenSession,
    pub(crate) C_CloseSession: CK_C_CloseSession,

    pub(crate) C_EncryptInit: CK_C_EncryptInit,
    pub(crate) C_Encrypt: CK_C_Encrypt,
    pub(crate) C_DecryptInit: CK_C_DecryptInit,
    pub(crate) C_Decrypt: CK_C_Decrypt,
    pub(crate) C_DigestInit: CK_C_DigestInit,
    pub(crate) C_Digest: CK_C_Digest,

    pub(crate) C_GenerateKey: CK_C_GenerateKey,
    pub(crate) C_SeedRandom: CK_C_SeedRandom,
    pub(crate) C_GenerateRandom: CK_C_GenerateRandom,
}

impl HsmLib {
    /// Load the module at `path`, resolve its function table and initialize it
    /// with OS locking.
    pub(crate) fn instantiate<P>(path: P) -> HResult<Self>
    where
        P: AsRef<OsStr>,
    {
        #[allow(unsafe_code)]
        let hsm_lib = unsafe {
            let library = Library::new(path)?;
            Self {
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetInfo: Some(*library.get(b"C_GetInfo")?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList")?),
                C_GetSlotInfo: Some(*library.get(b"C_GetSlotInfo")?),
                C_GetTokenInfo: Some(*library.get(b"C_GetTokenInfo")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_EncryptInit: Some(*library.get(b"C_EncryptInit")?),
                C_Encrypt: Some(*library.get(b"C_Encrypt")?),
                C_DecryptInit: Some(*library.get(b"C_DecryptInit")?),
                C_Decrypt: Some(*library.get(b"C_Decrypt")?),
                C_DigestInit: Some(*library.get(b"C_DigestInit")?),
                C_Digest: Some(*library.get(b"C_Digest")?),
                C_GenerateKey: Some(*library.get(b"C_GenerateKey")?),
                C_SeedRandom: Some(*library.get(b"C_SeedRandom")?),
                C_GenerateRandom: Some(*library.get(b"C_GenerateRandom")?),
                state: Mutex::new(ModuleState::Uninitialized),
                // we need to keep the library alive
                _library: Some(library),
            }
        };
        hsm_lib.initialize()?;
        Ok(hsm_lib)
    }

    pub(crate) fn initialize(&self) -> HResult<()> {
        let mut init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        let function = self
            .C_Initialize
            .ok_or(HError::FunctionNotSupported("C_Initialize"))?;
        #[allow(unsafe_code)]
        let rv = unsafe { function(&raw mut init_args as CK_VOID_PTR) };
        if rv != CKR_OK {
            return Err(HError::ModuleCallFailed {
                operation: "C_Initialize",
                rv,
            });
        }
        *self.lock_state() = ModuleState::Ready;
        debug!("module initialized");
        Ok(())
    }

    /// Release the module. A second call fails: the module is no longer usable.
    pub(crate) fn finalize(&self) -> HResult<()> {
        let mut state = self.lock_state();
        match *state {
            ModuleState::Finalized => {
                return Err(HError::ModuleUnusable("the module is finalized".to_owned()));
            }
            ModuleState::Uninitialized => {
                return Err(HError::ModuleUnusable("the module is not initialized".to_owned()));
            }
            ModuleState::Ready | ModuleState::Failed { .. } => {}
        }
        let function = self
            .C_Finalize
            .ok_or(HError::FunctionNotSupported("C_Finalize"))?;
        #[allow(unsafe_code)]
        let rv = unsafe { function(ptr::null_mut()) };
        // whatever the outcome, the module must not be called again
        *state = ModuleState::Finalized;
        if rv != CKR_OK {
            return Err(HError::ModuleCallFailed {
                operation: "C_Finalize",
                rv,
            });
        }
        debug!("module finalized");
        Ok(())
    }

    pub(crate) fn ensure_usable(&self) -> HResult<()> {
        match *self.lock_state() {
            ModuleState::Ready => Ok(()),
            ModuleState::Uninitialized => Err(HError::ModuleUnusable(
                "the module is not initialized".to_owned(),
            )),
            ModuleState::Finalized => Err(HError::ModuleUnusable(
                "the module is finalized".to_owned(),
            )),
            ModuleState::Failed { operation, rv } => Err(HError::ModuleUnusable(format!(
                "{operation} reported {}",
                rv_name(&rv)
            ))),
        }
    }

    /// Record the outcome of a module call, latching fatal return codes.
    pub(crate) fn observe(&self, operation: &'static str, rv: CK_RV) {
        if rv == CKR_GENERAL_ERROR || rv == CKR_CRYPTOKI_NOT_INITIALIZED {
            let mut state = self.lock_state();
            if *state == ModuleState::Ready {
                warn!("{operation} returned {}: the module is now unusable", rv_name(&rv));
                *state = ModuleState::Failed { operation, rv };
            }
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        matches!(*self.lock_state(), ModuleState::Failed { .. })
    }

    fn is_initialized(&self) -> bool {
        matches!(
            *self.lock_state(),
            ModuleState::Ready | ModuleState::Failed { .. }
        )
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ModuleState> {
        // the state is a plain value: a poisoned lock still holds a valid one
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for HsmLib {
    fn drop(&mut self) {
        if self.is_initialized() {
            let _ = self.finalize();
        }
    }
}
