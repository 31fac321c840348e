//! Single-shot operations on one open session.
//!
//! Every operation is an init call followed by exactly one call over the whole
//! input. When the caller does not size the output, the module is asked for the
//! length first with a null output buffer.

use std::{ptr, sync::Arc};

use pkcs11_sys::{
    CK_BYTE_PTR, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG, CK_ULONG_PTR,
    CKR_BUFFER_TOO_SMALL, CKR_OK,
};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::{HError, HResult, Mechanism, MechanismKind, hsm_lib::HsmLib, session::KeyHandle};

pub(crate) struct Session {
    pub(super) hsm: Arc<HsmLib>,
    pub(super) handle: CK_SESSION_HANDLE,
    pub(super) slot_id: CK_SLOT_ID,
    closed: bool,
}

impl Session {
    pub(crate) fn new(hsm: Arc<HsmLib>, handle: CK_SESSION_HANDLE, slot_id: CK_SLOT_ID) -> Self {
        Self {
            hsm,
            handle,
            slot_id,
            closed: false,
        }
    }

    pub(crate) const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the native session. Once the module has failed it is not called
    /// again: the session is only forgotten, and finalize releases it.
    pub(crate) fn close(&mut self) -> HResult<()> {
        if self.hsm.is_failed() {
            debug!("module failed, forgetting native session {}", self.handle);
            self.closed = true;
            return Ok(());
        }
        hsm_call!(self.hsm, SessionCloseFailed, C_CloseSession, self.handle);
        self.closed = true;
        Ok(())
    }

    pub(super) fn check_key(&self, key: KeyHandle) -> HResult<()> {
        if key.slot_id() != self.slot_id {
            return Err(HError::KeySlotMismatch {
                key_slot: key.slot_id(),
                session_slot: self.slot_id,
            });
        }
        Ok(())
    }

    pub(crate) fn encrypt(
        &self,
        mechanism: &Mechanism,
        key: KeyHandle,
        data: &[u8],
        output_len: Option<usize>,
    ) -> HResult<Vec<u8>> {
        mechanism.ensure_kind("C_EncryptInit", MechanismKind::Cipher)?;
        self.check_key(key)?;
        let data_len = CK_ULONG::try_from(data.len())?;
        let encrypted = mechanism.with_raw(|raw_mechanism| {
            hsm_call!(
                self.hsm,
                EncryptFailed,
                C_EncryptInit,
                self.handle,
                raw_mechanism,
                key.object()
            );
            Self::single_part(
                "C_Encrypt",
                output_len,
                |operation, rv| HError::EncryptFailed { operation, rv },
                |out, out_len| {
                    Ok(hsm_rv!(
                        self.hsm,
                        C_Encrypt,
                        self.handle,
                        data.as_ptr().cast_mut(),
                        data_len,
                        out,
                        out_len
                    ))
                },
            )
        })?;
        trace!("encrypted {} bytes into {}", data.len(), encrypted.len());
        Ok(encrypted.to_vec())
    }

    pub(crate) fn decrypt(
        &self,
        mechanism: &Mechanism,
        key: KeyHandle,
        data: &[u8],
        output_len: Option<usize>,
    ) -> HResult<Zeroizing<Vec<u8>>> {
        mechanism.ensure_kind("C_DecryptInit", MechanismKind::Cipher)?;
        self.check_key(key)?;
        let data_len = CK_ULONG::try_from(data.len())?;
        mechanism.with_raw(|raw_mechanism| {
            hsm_call!(
                self.hsm,
                DecryptFailed,
                C_DecryptInit,
                self.handle,
                raw_mechanism,
                key.object()
            );
            Self::single_part(
                "C_Decrypt",
                output_len,
                |operation, rv| HError::DecryptFailed { operation, rv },
                |out, out_len| {
                    Ok(hsm_rv!(
                        self.hsm,
                        C_Decrypt,
                        self.handle,
                        data.as_ptr().cast_mut(),
                        data_len,
                        out,
                        out_len
                    ))
                },
            )
        })
    }

    /// Digest `data` in one call. The output is sized from the mechanism unless
    /// the caller provides a length; a zero length never reaches the module.
    pub(crate) fn digest(
        &self,
        mechanism: &Mechanism,
        data: &[u8],
        output_len: Option<usize>,
    ) -> HResult<Vec<u8>> {
        mechanism.ensure_kind("C_DigestInit", MechanismKind::Digest)?;
        let digest_len = mechanism.digest_len().ok_or(HError::MechanismMismatch {
            operation: "C_DigestInit",
            mechanism: mechanism.name(),
        })?;
        let output_len = output_len.unwrap_or(digest_len);
        if output_len == 0 {
            return Err(HError::BufferTooSmall {
                operation: "C_Digest",
                provided: 0,
                required: Some(digest_len),
            });
        }
        let data_len = CK_ULONG::try_from(data.len())?;
        let digest = mechanism.with_raw(|raw_mechanism| {
            hsm_call!(self.hsm, DigestFailed, C_DigestInit, self.handle, raw_mechanism);
            Self::single_part(
                "C_Digest",
                Some(output_len),
                |operation, rv| HError::DigestFailed { operation, rv },
                |out, out_len| {
                    Ok(hsm_rv!(
                        self.hsm,
                        C_Digest,
                        self.handle,
                        data.as_ptr().cast_mut(),
                        data_len,
                        out,
                        out_len
                    ))
                },
            )
        })?;
        Ok(digest.to_vec())
    }

    pub(crate) fn generate_random(&self, len: usize) -> HResult<Vec<u8>> {
        if len == 0 {
            return Err(HError::BufferTooSmall {
                operation: "C_GenerateRandom",
                provided: 0,
                required: None,
            });
        }
        let mut values = vec![0_u8; len];
        hsm_call!(
            self.hsm,
            RandomGenFailed,
            C_GenerateRandom,
            self.handle,
            values.as_mut_ptr(),
            CK_ULONG::try_from(len)?
        );
        Ok(values)
    }

    /// The module may overwrite the seed buffer: it gets a copy, wiped after
    /// the call.
    pub(crate) fn seed_random(&self, seed: &[u8]) -> HResult<()> {
        let mut seed = Zeroizing::new(seed.to_vec());
        let seed_len = CK_ULONG::try_from(seed.len())?;
        hsm_call!(
            self.hsm,
            SeedFailed,
            C_SeedRandom,
            self.handle,
            seed.as_mut_ptr(),
            seed_len
        );
        Ok(())
    }

    /// Drive the second half of an operation whose init call succeeded.
    ///
    /// With no `output_len` the length is queried first. With a caller-provided
    /// length that turns out too small, the operation still active on the
    /// session is completed into a scratch buffer and discarded so the session
    /// can be used again, and `BufferTooSmall` reports the required length.
    fn single_part<C>(
        operation: &'static str,
        output_len: Option<usize>,
        failure: fn(&'static str, CK_RV) -> HError,
        mut call: C,
    ) -> HResult<Zeroizing<Vec<u8>>>
    where
        C: FnMut(CK_BYTE_PTR, CK_ULONG_PTR) -> HResult<CK_RV>,
    {
        let provided = match output_len {
            Some(0) => {
                let required = Self::complete_into_scratch(&mut call);
                if required == Some(0) {
                    return Ok(Zeroizing::new(Vec::new()));
                }
                return Err(HError::BufferTooSmall {
                    operation,
                    provided: 0,
                    required,
                });
            }
            Some(provided) => provided,
            None => {
                let mut required: CK_ULONG = 0;
                let rv = call(ptr::null_mut(), &raw mut required)?;
                if rv != CKR_OK {
                    return Err(failure(operation, rv));
                }
                usize::try_from(required)?
            }
        };

        let mut output = Zeroizing::new(vec![0_u8; provided]);
        let mut output_len = CK_ULONG::try_from(provided)?;
        let rv = call(output.as_mut_ptr(), &raw mut output_len)?;
        match rv {
            CKR_OK => {
                output.truncate(usize::try_from(output_len)?);
                Ok(output)
            }
            CKR_BUFFER_TOO_SMALL => {
                let reported = usize::try_from(output_len)?;
                let reported = (reported > provided).then_some(reported);
                let completed = Self::complete_into_scratch(&mut call);
                debug!("{operation}: {provided} bytes provided, {reported:?} required");
                Err(HError::BufferTooSmall {
                    operation,
                    provided,
                    required: reported.or(completed),
                })
            }
            rv => Err(failure(operation, rv)),
        }
    }

    /// Finish an operation left active on the session, dropping its output.
    /// Returns the output length when the module reported it.
    fn complete_into_scratch<C>(call: &mut C) -> Option<usize>
    where
        C: FnMut(CK_BYTE_PTR, CK_ULONG_PTR) -> HResult<CK_RV>,
    {
        let mut required: CK_ULONG = 0;
        if !matches!(call(ptr::null_mut(), &raw mut required), Ok(CKR_OK)) {
            return None;
        }
        let len = usize::try_from(required).ok()?;
        let mut scratch = Zeroizing::new(vec![0_u8; len]);
        let mut scratch_len = required;
        if !matches!(call(scratch.as_mut_ptr(), &raw mut scratch_len), Ok(CKR_OK)) {
            debug!("could not complete the pending operation");
        }
        Some(len)
    }
}
