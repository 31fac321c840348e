//! An in-process PKCS#11 module used to drive the token layer through its real
//! dispatch path. Built for the tests of this crate, and for dependents with
//! the `soft-token` feature.
//!
//! Slots:
//! - 1: token present, hardware slot
//! - 2: token present, removable hardware slot
//! - 3: empty slot
//! - 4: write-protected token whose device fails when a session is opened
//!
//! Only AES keys, AES ECB/CBC/CBC-PAD and SHA-2 digests are implemented. State
//! is process-wide and initialization is reference counted so tests running in
//! parallel do not finalize each other's module.
#![allow(unsafe_code, clippy::missing_safety_doc)]

use std::{
    collections::HashMap,
    slice,
    sync::{LazyLock, Mutex, MutexGuard, PoisonError},
};

use aes::{
    Aes128, Aes192, Aes256,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_BYTE_PTR, CK_FLAGS, CK_INFO, CK_MECHANISM,
    CK_MECHANISM_TYPE, CK_NOTIFY, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID,
    CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG, CK_ULONG_PTR, CK_VERSION, CK_VOID_PTR, CKA_CLASS,
    CKA_DECRYPT, CKA_ENCRYPT, CKA_KEY_TYPE, CKA_LABEL, CKA_PRIVATE, CKA_VALUE_LEN, CKF_HW_SLOT,
    CKF_LOGIN_REQUIRED, CKF_REMOVABLE_DEVICE, CKF_RNG, CKF_RW_SESSION, CKF_SERIAL_SESSION,
    CKF_TOKEN_INITIALIZED, CKF_TOKEN_PRESENT, CKF_USER_PIN_INITIALIZED, CKF_WRITE_PROTECTED,
    CKK_AES, CKM_AES_CBC, CKM_AES_CBC_PAD, CKM_AES_ECB, CKM_AES_KEY_GEN, CKM_SHA256, CKM_SHA384,
    CKM_SHA512, CKO_SECRET_KEY, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_VALUE_INVALID,
    CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DATA_LEN_RANGE,
    CKR_ENCRYPTED_DATA_INVALID, CKR_ENCRYPTED_DATA_LEN_RANGE, CKR_FUNCTION_FAILED,
    CKR_GENERAL_ERROR, CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID,
    CKR_MECHANISM_INVALID, CKR_MECHANISM_PARAM_INVALID, CKR_OK, CKR_OPERATION_ACTIVE,
    CKR_OPERATION_NOT_INITIALIZED, CKR_SESSION_HANDLE_INVALID,
    CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SLOT_ID_INVALID, CKR_TEMPLATE_INCOMPLETE,
    CKR_TEMPLATE_INCONSISTENT, CKR_TOKEN_NOT_PRESENT,
};
use rand::{TryRngCore, rngs::OsRng};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::{
    HResult, Token,
    hsm_lib::{HsmLib, ModuleState},
};

pub const SLOTS: [CK_SLOT_ID; 4] = [1, 2, 3, 4];
pub const EMPTY_SLOT: CK_SLOT_ID = 3;
pub const FAILING_SLOT: CK_SLOT_ID = 4;

const AES_BLOCK: usize = 16;

#[derive(Clone, Copy)]
enum Cipher {
    Ecb,
    Cbc([u8; AES_BLOCK]),
    CbcPad([u8; AES_BLOCK]),
}

enum Active {
    Encrypt { cipher: Cipher, key: Vec<u8> },
    Decrypt { cipher: Cipher, key: Vec<u8> },
    Digest(CK_MECHANISM_TYPE),
}

struct SoftSession {
    slot_id: CK_SLOT_ID,
    flags: CK_FLAGS,
    active: Option<Active>,
}

/// What the module recorded about a generated key.
#[derive(Debug, Clone)]
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) struct SoftKey {
    pub slot_id: CK_SLOT_ID,
    pub value: Vec<u8>,
    pub label: Vec<u8>,
    pub private: bool,
    pub encrypt: bool,
    pub decrypt: bool,
    /// Attribute types in the order the template listed them.
    pub template_types: Vec<CK_ATTRIBUTE_TYPE>,
}

#[derive(Default)]
struct SoftState {
    init_count: usize,
    next_handle: CK_ULONG,
    sessions: HashMap<CK_SESSION_HANDLE, SoftSession>,
    objects: HashMap<CK_OBJECT_HANDLE, SoftKey>,
}

impl SoftState {
    fn next_handle(&mut self) -> CK_ULONG {
        self.next_handle += 1;
        self.next_handle
    }
}

static STATE: LazyLock<Mutex<SoftState>> = LazyLock::new(|| Mutex::new(SoftState::default()));

fn state() -> MutexGuard<'static, SoftState> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock the state and fail with `CKR_CRYPTOKI_NOT_INITIALIZED` when no
/// caller has the module initialized.
fn initialized() -> Result<MutexGuard<'static, SoftState>, CK_RV> {
    let state = state();
    if state.init_count == 0 {
        return Err(CKR_CRYPTOKI_NOT_INITIALIZED);
    }
    Ok(state)
}

fn rv(result: Result<(), CK_RV>) -> CK_RV {
    result.err().unwrap_or(CKR_OK)
}

fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [b' '; N];
    let len = text.len().min(N);
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
    field
}

const fn version(major: u8, minor: u8) -> CK_VERSION {
    CK_VERSION { major, minor }
}

fn slot_flags(slot_id: CK_SLOT_ID) -> Option<CK_FLAGS> {
    match slot_id {
        1 => Some(CKF_TOKEN_PRESENT | CKF_HW_SLOT),
        2 => Some(CKF_TOKEN_PRESENT | CKF_REMOVABLE_DEVICE | CKF_HW_SLOT),
        3 => Some(0),
        4 => Some(CKF_TOKEN_PRESENT),
        _ => None,
    }
}

fn token_flags(slot_id: CK_SLOT_ID) -> Result<CK_FLAGS, CK_RV> {
    match slot_id {
        1 | 2 => Ok(CKF_RNG | CKF_TOKEN_INITIALIZED | CKF_LOGIN_REQUIRED | CKF_USER_PIN_INITIALIZED),
        EMPTY_SLOT => Err(CKR_TOKEN_NOT_PRESENT),
        FAILING_SLOT => Ok(CKF_TOKEN_INITIALIZED | CKF_WRITE_PROTECTED),
        _ => Err(CKR_SLOT_ID_INVALID),
    }
}

/// The state of a key generated by the module, if it exists.
#[cfg(test)]
pub(crate) fn soft_key(object: CK_OBJECT_HANDLE) -> Option<SoftKey> {
    state().objects.get(&object).cloned()
}

/// A function table wired to this module, not yet initialized.
pub(crate) fn hsm_lib() -> HsmLib {
    HsmLib {
        _library: None,
        state: Mutex::new(ModuleState::Uninitialized),
        C_Initialize: Some(C_Initialize),
        C_Finalize: Some(C_Finalize),
        C_GetInfo: Some(C_GetInfo),
        C_GetSlotList: Some(C_GetSlotList),
        C_GetSlotInfo: Some(C_GetSlotInfo),
        C_GetTokenInfo: Some(C_GetTokenInfo),
        C_OpenSession: Some(C_OpenSession),
        C_CloseSession: Some(C_CloseSession),
        C_EncryptInit: Some(C_EncryptInit),
        C_Encrypt: Some(C_Encrypt),
        C_DecryptInit: Some(C_DecryptInit),
        C_Decrypt: Some(C_Decrypt),
        C_DigestInit: Some(C_DigestInit),
        C_Digest: Some(C_Digest),
        C_GenerateKey: Some(C_GenerateKey),
        C_SeedRandom: Some(C_SeedRandom),
        C_GenerateRandom: Some(C_GenerateRandom),
    }
}

/// A token over this module, initialized.
pub fn soft_token() -> HResult<Token> {
    token_from(hsm_lib())
}

pub(crate) fn token_from(hsm_lib: HsmLib) -> HResult<Token> {
    hsm_lib.initialize()?;
    Ok(Token::from_lib(hsm_lib))
}

// ---------------------------------------------------------------------------
// General purpose and slot management

unsafe extern "C" fn C_Initialize(_init_args: CK_VOID_PTR) -> CK_RV {
    state().init_count += 1;
    CKR_OK
}

unsafe extern "C" fn C_Finalize(_reserved: CK_VOID_PTR) -> CK_RV {
    let mut state = state();
    if state.init_count == 0 {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    state.init_count -= 1;
    CKR_OK
}

unsafe extern "C" fn C_GetInfo(info: *mut CK_INFO) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        drop(initialized()?);
        if info.is_null() {
            return Err(CKR_ARGUMENTS_BAD);
        }
        let info = unsafe { &mut *info };
        info.cryptokiVersion = version(2, 40);
        info.manufacturerID = padded("Soft Token Labs");
        info.flags = 0;
        info.libraryDescription = padded("In-process soft token");
        info.libraryVersion = version(1, 5);
        Ok(())
    })())
}

unsafe extern "C" fn C_GetSlotList(
    token_present: CK_BBOOL,
    slot_list: *mut CK_SLOT_ID,
    count: CK_ULONG_PTR,
) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        drop(initialized()?);
        if count.is_null() {
            return Err(CKR_ARGUMENTS_BAD);
        }
        let slots: Vec<CK_SLOT_ID> = SLOTS
            .into_iter()
            .filter(|slot| {
                token_present == 0
                    || slot_flags(*slot).is_some_and(|flags| flags & CKF_TOKEN_PRESENT != 0)
            })
            .collect();
        let available = unsafe { *count };
        let needed = slots.len() as CK_ULONG;
        unsafe { *count = needed };
        if slot_list.is_null() {
            return Ok(());
        }
        if available < needed {
            return Err(CKR_BUFFER_TOO_SMALL);
        }
        unsafe { slice::from_raw_parts_mut(slot_list, slots.len()) }.copy_from_slice(&slots);
        Ok(())
    })())
}

unsafe extern "C" fn C_GetSlotInfo(slot_id: CK_SLOT_ID, info: *mut CK_SLOT_INFO) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        drop(initialized()?);
        let flags = slot_flags(slot_id).ok_or(CKR_SLOT_ID_INVALID)?;
        if info.is_null() {
            return Err(CKR_ARGUMENTS_BAD);
        }
        let info = unsafe { &mut *info };
        info.slotDescription = padded(&format!("Soft slot {slot_id}"));
        info.manufacturerID = padded("Soft Token Labs");
        info.flags = flags;
        info.hardwareVersion = version(1, 0);
        info.firmwareVersion = version(2, 3);
        Ok(())
    })())
}

unsafe extern "C" fn C_GetTokenInfo(slot_id: CK_SLOT_ID, info: *mut CK_TOKEN_INFO) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        let state = initialized()?;
        let flags = token_flags(slot_id)?;
        if info.is_null() {
            return Err(CKR_ARGUMENTS_BAD);
        }
        let on_slot = state.sessions.values().filter(|s| s.slot_id == slot_id);
        let sessions = on_slot.clone().count() as CK_ULONG;
        let rw_sessions = on_slot.filter(|s| s.flags & CKF_RW_SESSION != 0).count() as CK_ULONG;
        let info = unsafe { &mut *info };
        info.label = padded(&format!("Soft token {slot_id}"));
        info.manufacturerID = padded("Soft Token Labs");
        info.model = padded("SOFT-1");
        info.serialNumber = padded(&format!("{slot_id:016}"));
        info.flags = flags;
        info.ulMaxSessionCount = 16;
        info.ulSessionCount = sessions;
        info.ulMaxRwSessionCount = 8;
        info.ulRwSessionCount = rw_sessions;
        info.ulMaxPinLen = 255;
        info.ulMinPinLen = 4;
        info.ulTotalPublicMemory = 32_768;
        info.ulFreePublicMemory = 16_384;
        info.ulTotalPrivateMemory = 65_536;
        info.ulFreePrivateMemory = 49_152;
        info.hardwareVersion = version(1, 0);
        info.firmwareVersion = version(2, 3);
        info.utcTime = padded("2024010112000000");
        Ok(())
    })())
}

// ---------------------------------------------------------------------------
// Sessions

unsafe extern "C" fn C_OpenSession(
    slot_id: CK_SLOT_ID,
    flags: CK_FLAGS,
    _application: CK_VOID_PTR,
    _notify: CK_NOTIFY,
    session: *mut CK_SESSION_HANDLE,
) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        let mut state = initialized()?;
        token_flags(slot_id)?;
        if slot_id == FAILING_SLOT {
            return Err(CKR_GENERAL_ERROR);
        }
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(CKR_SESSION_PARALLEL_NOT_SUPPORTED);
        }
        if session.is_null() {
            return Err(CKR_ARGUMENTS_BAD);
        }
        let handle = state.next_handle();
        state.sessions.insert(
            handle,
            SoftSession {
                slot_id,
                flags,
                active: None,
            },
        );
        unsafe { *session = handle };
        Ok(())
    })())
}

unsafe extern "C" fn C_CloseSession(session: CK_SESSION_HANDLE) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        let mut state = initialized()?;
        state
            .sessions
            .remove(&session)
            .map(drop)
            .ok_or(CKR_SESSION_HANDLE_INVALID)
    })())
}

// ---------------------------------------------------------------------------
// Ciphers and digests

fn cipher_of(mechanism: &CK_MECHANISM) -> Result<Cipher, CK_RV> {
    let iv = || -> Result<[u8; AES_BLOCK], CK_RV> {
        if mechanism.pParameter.is_null() || mechanism.ulParameterLen != AES_BLOCK as CK_ULONG {
            return Err(CKR_MECHANISM_PARAM_INVALID);
        }
        let mut iv = [0_u8; AES_BLOCK];
        iv.copy_from_slice(unsafe {
            slice::from_raw_parts(mechanism.pParameter.cast::<u8>(), AES_BLOCK)
        });
        Ok(iv)
    };
    match mechanism.mechanism {
        CKM_AES_ECB => Ok(Cipher::Ecb),
        CKM_AES_CBC => Ok(Cipher::Cbc(iv()?)),
        CKM_AES_CBC_PAD => Ok(Cipher::CbcPad(iv()?)),
        _ => Err(CKR_MECHANISM_INVALID),
    }
}

enum AesKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesKey {
    fn new(key: &[u8]) -> Result<Self, CK_RV> {
        Ok(match key.len() {
            16 => Self::Aes128(Aes128::new_from_slice(key).map_err(|_| CKR_FUNCTION_FAILED)?),
            24 => Self::Aes192(Aes192::new_from_slice(key).map_err(|_| CKR_FUNCTION_FAILED)?),
            32 => Self::Aes256(Aes256::new_from_slice(key).map_err(|_| CKR_FUNCTION_FAILED)?),
            _ => return Err(CKR_FUNCTION_FAILED),
        })
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(cipher) => cipher.encrypt_block(block),
            Self::Aes192(cipher) => cipher.encrypt_block(block),
            Self::Aes256(cipher) => cipher.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(cipher) => cipher.decrypt_block(block),
            Self::Aes192(cipher) => cipher.decrypt_block(block),
            Self::Aes256(cipher) => cipher.decrypt_block(block),
        }
    }
}

fn encrypt(cipher: Cipher, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CK_RV> {
    let aes = AesKey::new(key)?;
    let mut output = data.to_vec();
    if let Cipher::CbcPad(_) = cipher {
        let pad = AES_BLOCK - data.len() % AES_BLOCK;
        output.resize(data.len() + pad, pad as u8);
    } else if data.len() % AES_BLOCK != 0 {
        return Err(CKR_DATA_LEN_RANGE);
    }
    let mut chain = match cipher {
        Cipher::Ecb => None,
        Cipher::Cbc(iv) | Cipher::CbcPad(iv) => Some(iv),
    };
    for block in output.chunks_exact_mut(AES_BLOCK) {
        if let Some(previous) = &chain {
            block.iter_mut().zip(previous).for_each(|(b, p)| *b ^= p);
        }
        aes.encrypt_block(block);
        if let Some(previous) = &mut chain {
            previous.copy_from_slice(block);
        }
    }
    Ok(output)
}

fn decrypt(cipher: Cipher, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CK_RV> {
    let aes = AesKey::new(key)?;
    if data.len() % AES_BLOCK != 0 {
        return Err(CKR_ENCRYPTED_DATA_LEN_RANGE);
    }
    let mut output = data.to_vec();
    let mut chain = match cipher {
        Cipher::Ecb => None,
        Cipher::Cbc(iv) | Cipher::CbcPad(iv) => Some(iv),
    };
    for block in output.chunks_exact_mut(AES_BLOCK) {
        let mut encrypted = [0_u8; AES_BLOCK];
        encrypted.copy_from_slice(block);
        aes.decrypt_block(block);
        if let Some(previous) = &mut chain {
            block.iter_mut().zip(previous.iter()).for_each(|(b, p)| *b ^= p);
            *previous = encrypted;
        }
    }
    if let Cipher::CbcPad(_) = cipher {
        let pad = usize::from(*output.last().ok_or(CKR_ENCRYPTED_DATA_LEN_RANGE)?);
        if pad == 0 || pad > AES_BLOCK || output[output.len() - pad..].iter().any(|b| usize::from(*b) != pad) {
            return Err(CKR_ENCRYPTED_DATA_INVALID);
        }
        output.truncate(output.len() - pad);
    }
    Ok(output)
}

fn digest(mechanism: CK_MECHANISM_TYPE, data: &[u8]) -> Result<Vec<u8>, CK_RV> {
    match mechanism {
        CKM_SHA256 => Ok(Sha256::digest(data).to_vec()),
        CKM_SHA384 => Ok(Sha384::digest(data).to_vec()),
        CKM_SHA512 => Ok(Sha512::digest(data).to_vec()),
        _ => Err(CKR_MECHANISM_INVALID),
    }
}

fn cipher_init(
    session: CK_SESSION_HANDLE,
    mechanism: *mut CK_MECHANISM,
    key: CK_OBJECT_HANDLE,
    for_encryption: bool,
) -> Result<(), CK_RV> {
    let mut state = initialized()?;
    if mechanism.is_null() {
        return Err(CKR_ARGUMENTS_BAD);
    }
    let cipher = cipher_of(unsafe { &*mechanism })?;
    let slot_id = state
        .sessions
        .get(&session)
        .ok_or(CKR_SESSION_HANDLE_INVALID)?
        .slot_id;
    let key = state
        .objects
        .get(&key)
        .filter(|k| k.slot_id == slot_id)
        .ok_or(CKR_KEY_HANDLE_INVALID)?;
    let permitted = if for_encryption { key.encrypt } else { key.decrypt };
    if !permitted {
        return Err(CKR_KEY_FUNCTION_NOT_PERMITTED);
    }
    let key = key.value.clone();
    let soft_session = state
        .sessions
        .get_mut(&session)
        .ok_or(CKR_SESSION_HANDLE_INVALID)?;
    if soft_session.active.is_some() {
        return Err(CKR_OPERATION_ACTIVE);
    }
    soft_session.active = Some(if for_encryption {
        Active::Encrypt { cipher, key }
    } else {
        Active::Decrypt { cipher, key }
    });
    Ok(())
}

/// Single-part call with PKCS#11 length semantics: a null output only
/// reports the length, a short output reports the length and keeps the
/// operation active, anything else ends it.
fn single_part(
    session: CK_SESSION_HANDLE,
    data: CK_BYTE_PTR,
    data_len: CK_ULONG,
    output: CK_BYTE_PTR,
    output_len: CK_ULONG_PTR,
) -> Result<(), CK_RV> {
    let mut state = initialized()?;
    let soft_session = state
        .sessions
        .get_mut(&session)
        .ok_or(CKR_SESSION_HANDLE_INVALID)?;
    if soft_session.active.is_none() {
        return Err(CKR_OPERATION_NOT_INITIALIZED);
    }
    if output_len.is_null() || (data.is_null() && data_len != 0) {
        soft_session.active = None;
        return Err(CKR_ARGUMENTS_BAD);
    }
    let input = if data_len == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(data, data_len as usize) }
    };
    let result = match &soft_session.active {
        Some(Active::Encrypt { cipher, key }) => encrypt(*cipher, key, input),
        Some(Active::Decrypt { cipher, key }) => decrypt(*cipher, key, input),
        Some(Active::Digest(mechanism)) => digest(*mechanism, input),
        None => Err(CKR_OPERATION_NOT_INITIALIZED),
    };
    let result = match result {
        Ok(result) => result,
        Err(rv) => {
            soft_session.active = None;
            return Err(rv);
        }
    };
    let available = unsafe { *output_len };
    unsafe { *output_len = result.len() as CK_ULONG };
    if output.is_null() {
        return Ok(());
    }
    if (available as usize) < result.len() {
        return Err(CKR_BUFFER_TOO_SMALL);
    }
    unsafe { slice::from_raw_parts_mut(output, result.len()) }.copy_from_slice(&result);
    soft_session.active = None;
    Ok(())
}

unsafe extern "C" fn C_EncryptInit(
    session: CK_SESSION_HANDLE,
    mechanism: *mut CK_MECHANISM,
    key: CK_OBJECT_HANDLE,
) -> CK_RV {
    rv(cipher_init(session, mechanism, key, true))
}

unsafe extern "C" fn C_Encrypt(
    session: CK_SESSION_HANDLE,
    data: CK_BYTE_PTR,
    data_len: CK_ULONG,
    encrypted: CK_BYTE_PTR,
    encrypted_len: CK_ULONG_PTR,
) -> CK_RV {
    rv(single_part(session, data, data_len, encrypted, encrypted_len))
}

unsafe extern "C" fn C_DecryptInit(
    session: CK_SESSION_HANDLE,
    mechanism: *mut CK_MECHANISM,
    key: CK_OBJECT_HANDLE,
) -> CK_RV {
    rv(cipher_init(session, mechanism, key, false))
}

unsafe extern "C" fn C_Decrypt(
    session: CK_SESSION_HANDLE,
    encrypted: CK_BYTE_PTR,
    encrypted_len: CK_ULONG,
    data: CK_BYTE_PTR,
    data_len: CK_ULONG_PTR,
) -> CK_RV {
    rv(single_part(session, encrypted, encrypted_len, data, data_len))
}

unsafe extern "C" fn C_DigestInit(session: CK_SESSION_HANDLE, mechanism: *mut CK_MECHANISM) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        let mut state = initialized()?;
        if mechanism.is_null() {
            return Err(CKR_ARGUMENTS_BAD);
        }
        let mechanism = unsafe { &*mechanism }.mechanism;
        digest(mechanism, &[])?;
        let soft_session = state
            .sessions
            .get_mut(&session)
            .ok_or(CKR_SESSION_HANDLE_INVALID)?;
        if soft_session.active.is_some() {
            return Err(CKR_OPERATION_ACTIVE);
        }
        soft_session.active = Some(Active::Digest(mechanism));
        Ok(())
    })())
}

unsafe extern "C" fn C_Digest(
    session: CK_SESSION_HANDLE,
    data: CK_BYTE_PTR,
    data_len: CK_ULONG,
    digest: CK_BYTE_PTR,
    digest_len: CK_ULONG_PTR,
) -> CK_RV {
    rv(single_part(session, data, data_len, digest, digest_len))
}

// ---------------------------------------------------------------------------
// Keys and random

fn read_ulong(attribute: &CK_ATTRIBUTE) -> Result<CK_ULONG, CK_RV> {
    if attribute.pValue.is_null() || attribute.ulValueLen as usize != size_of::<CK_ULONG>() {
        return Err(CKR_ATTRIBUTE_VALUE_INVALID);
    }
    Ok(unsafe { attribute.pValue.cast::<CK_ULONG>().read_unaligned() })
}

fn read_bool(attribute: &CK_ATTRIBUTE) -> Result<bool, CK_RV> {
    if attribute.pValue.is_null() || attribute.ulValueLen != 1 {
        return Err(CKR_ATTRIBUTE_VALUE_INVALID);
    }
    Ok(unsafe { *attribute.pValue.cast::<u8>() } != 0)
}

fn read_bytes(attribute: &CK_ATTRIBUTE) -> Vec<u8> {
    if attribute.pValue.is_null() || attribute.ulValueLen == 0 {
        return Vec::new();
    }
    unsafe { slice::from_raw_parts(attribute.pValue.cast::<u8>(), attribute.ulValueLen as usize) }
        .to_vec()
}

unsafe extern "C" fn C_GenerateKey(
    session: CK_SESSION_HANDLE,
    mechanism: *mut CK_MECHANISM,
    template: *mut CK_ATTRIBUTE,
    count: CK_ULONG,
    key: *mut CK_OBJECT_HANDLE,
) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        let mut state = initialized()?;
        if mechanism.is_null() || key.is_null() || (template.is_null() && count != 0) {
            return Err(CKR_ARGUMENTS_BAD);
        }
        let slot_id = state
            .sessions
            .get(&session)
            .ok_or(CKR_SESSION_HANDLE_INVALID)?
            .slot_id;
        if unsafe { &*mechanism }.mechanism != CKM_AES_KEY_GEN {
            return Err(CKR_MECHANISM_INVALID);
        }
        let template = if count == 0 {
            &[][..]
        } else {
            unsafe { slice::from_raw_parts(template, count as usize) }
        };
        let mut soft_key = SoftKey {
            slot_id,
            value: Vec::new(),
            label: Vec::new(),
            private: true,
            encrypt: false,
            decrypt: false,
            template_types: Vec::with_capacity(template.len()),
        };
        let mut value_len = None;
        for attribute in template {
            soft_key.template_types.push(attribute.type_);
            match attribute.type_ {
                CKA_CLASS if read_ulong(attribute)? != CKO_SECRET_KEY => {
                    return Err(CKR_TEMPLATE_INCONSISTENT);
                }
                CKA_KEY_TYPE if read_ulong(attribute)? != CKK_AES => {
                    return Err(CKR_TEMPLATE_INCONSISTENT);
                }
                CKA_VALUE_LEN => value_len = Some(read_ulong(attribute)?),
                CKA_LABEL => soft_key.label = read_bytes(attribute),
                CKA_PRIVATE => soft_key.private = read_bool(attribute)?,
                CKA_ENCRYPT => soft_key.encrypt = read_bool(attribute)?,
                CKA_DECRYPT => soft_key.decrypt = read_bool(attribute)?,
                _ => {}
            }
        }
        let value_len = match value_len.ok_or(CKR_TEMPLATE_INCOMPLETE)? {
            len @ (16 | 24 | 32) => len as usize,
            _ => return Err(CKR_ATTRIBUTE_VALUE_INVALID),
        };
        soft_key.value = vec![0_u8; value_len];
        OsRng
            .try_fill_bytes(&mut soft_key.value)
            .map_err(|_| CKR_FUNCTION_FAILED)?;
        let handle = state.next_handle();
        state.objects.insert(handle, soft_key);
        unsafe { *key = handle };
        Ok(())
    })())
}

unsafe extern "C" fn C_SeedRandom(session: CK_SESSION_HANDLE, seed: CK_BYTE_PTR, seed_len: CK_ULONG) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        let state = initialized()?;
        if !state.sessions.contains_key(&session) {
            return Err(CKR_SESSION_HANDLE_INVALID);
        }
        if seed.is_null() || seed_len == 0 {
            return Err(CKR_ARGUMENTS_BAD);
        }
        // the seed is consumed: callers cannot rely on it afterwards
        unsafe { slice::from_raw_parts_mut(seed, seed_len as usize) }.fill(0);
        Ok(())
    })())
}

unsafe extern "C" fn C_GenerateRandom(
    session: CK_SESSION_HANDLE,
    random: CK_BYTE_PTR,
    random_len: CK_ULONG,
) -> CK_RV {
    rv((|| -> Result<(), CK_RV> {
        let state = initialized()?;
        if !state.sessions.contains_key(&session) {
            return Err(CKR_SESSION_HANDLE_INVALID);
        }
        if random.is_null() || random_len == 0 {
            return Err(CKR_ARGUMENTS_BAD);
        }
        OsRng
            .try_fill_bytes(unsafe { slice::from_raw_parts_mut(random, random_len as usize) })
            .map_err(|_| CKR_FUNCTION_FAILED)
    })())
}
