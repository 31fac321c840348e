//! Read-only queries about the module, its slots and their tokens.
//!
//! Nothing here needs a session and nothing is cached: every call goes to the
//! module.

use std::{fmt, ptr};

use bitflags::bitflags;
use pkcs11_sys::{
    CK_FLAGS, CK_INFO, CK_SLOT_ID, CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG, CK_VERSION,
    CKF_HW_SLOT, CKF_LOGIN_REQUIRED, CKF_REMOVABLE_DEVICE, CKF_RNG, CKF_TOKEN_INITIALIZED,
    CKF_TOKEN_PRESENT, CKF_USER_PIN_INITIALIZED, CKF_WRITE_PROTECTED, CKR_BUFFER_TOO_SMALL,
    CKR_OK, CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT,
};
use tracing::debug;

use crate::{HError, HResult, Token};

/// A `major.minor` version as reported by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl From<CK_VERSION> for Version {
    fn from(version: CK_VERSION) -> Self {
        Self {
            major: version.major,
            minor: version.minor,
        }
    }
}

impl fmt::Display for Version {
    /// Minor numbers below ten are zero-padded: `2.01`, `2.40`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: CK_FLAGS {
        const TOKEN_PRESENT = CKF_TOKEN_PRESENT;
        const REMOVABLE_DEVICE = CKF_REMOVABLE_DEVICE;
        const HW_SLOT = CKF_HW_SLOT;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TokenFlags: CK_FLAGS {
        const TOKEN_INITIALIZED = CKF_TOKEN_INITIALIZED;
        const RNG = CKF_RNG;
        const WRITE_PROTECTED = CKF_WRITE_PROTECTED;
        const LOGIN_REQUIRED = CKF_LOGIN_REQUIRED;
        const USER_PIN_INITIALIZED = CKF_USER_PIN_INITIALIZED;
    }
}

fn write_flag_names(
    f: &mut fmt::Formatter<'_>,
    names: impl Iterator<Item = &'static str>,
) -> fmt::Result {
    let mut empty = true;
    for name in names {
        if !empty {
            f.write_str(" ")?;
        }
        f.write_str(name)?;
        empty = false;
    }
    if empty {
        f.write_str("<none>")?;
    }
    Ok(())
}

impl fmt::Display for SlotFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::TOKEN_PRESENT, "TokenPresent"),
            (Self::REMOVABLE_DEVICE, "RemovableDevice"),
            (Self::HW_SLOT, "Hardware"),
        ];
        write_flag_names(
            f,
            names
                .into_iter()
                .filter(|(flag, _)| self.contains(*flag))
                .map(|(_, name)| name),
        )
    }
}

impl fmt::Display for TokenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::TOKEN_INITIALIZED, "TokenInitialised"),
            (Self::RNG, "RNG"),
            (Self::WRITE_PROTECTED, "WriteProtected"),
            (Self::LOGIN_REQUIRED, "LoginRequired"),
            (Self::USER_PIN_INITIALIZED, "UserPINInitialised"),
        ];
        write_flag_names(
            f,
            names
                .into_iter()
                .filter(|(flag, _)| self.contains(*flag))
                .map(|(_, name)| name),
        )
    }
}

/// Fixed-width, space-padded text fields.
fn padded_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches([' ', '\0'])
        .to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub cryptoki_version: Version,
    pub manufacturer_id: String,
    pub flags: CK_FLAGS,
    pub library_description: String,
    pub library_version: Version,
}

impl From<CK_INFO> for ModuleInfo {
    fn from(info: CK_INFO) -> Self {
        Self {
            cryptoki_version: info.cryptokiVersion.into(),
            manufacturer_id: padded_text(&info.manufacturerID),
            flags: info.flags,
            library_description: padded_text(&info.libraryDescription),
            library_version: info.libraryVersion.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_id: CK_SLOT_ID,
    pub description: String,
    pub manufacturer_id: String,
    pub flags: SlotFlags,
    pub hardware_version: Version,
    pub firmware_version: Version,
}

impl SlotInfo {
    fn from_raw(slot_id: CK_SLOT_ID, info: &CK_SLOT_INFO) -> Self {
        Self {
            slot_id,
            description: padded_text(&info.slotDescription),
            manufacturer_id: padded_text(&info.manufacturerID),
            flags: SlotFlags::from_bits_truncate(info.flags),
            hardware_version: info.hardwareVersion.into(),
            firmware_version: info.firmwareVersion.into(),
        }
    }

    #[must_use]
    pub const fn token_present(&self) -> bool {
        self.flags.contains(SlotFlags::TOKEN_PRESENT)
    }
}

/// Descriptive record of the token in a slot, with its session, PIN length
/// and memory counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub slot_id: CK_SLOT_ID,
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    pub flags: TokenFlags,
    /// All the bits reported by the module, including those without a name in
    /// [`TokenFlags`].
    pub raw_flags: CK_FLAGS,
    pub max_session_count: u64,
    pub session_count: u64,
    pub max_rw_session_count: u64,
    pub rw_session_count: u64,
    pub max_pin_len: u64,
    pub min_pin_len: u64,
    pub total_public_memory: u64,
    pub free_public_memory: u64,
    pub total_private_memory: u64,
    pub free_private_memory: u64,
    pub hardware_version: Version,
    pub firmware_version: Version,
    pub utc_time: String,
}

impl TokenInfo {
    fn from_raw(slot_id: CK_SLOT_ID, info: &CK_TOKEN_INFO) -> Self {
        Self {
            slot_id,
            label: padded_text(&info.label),
            manufacturer_id: padded_text(&info.manufacturerID),
            model: padded_text(&info.model),
            serial_number: padded_text(&info.serialNumber),
            flags: TokenFlags::from_bits_truncate(info.flags),
            raw_flags: info.flags,
            max_session_count: u64::from(info.ulMaxSessionCount),
            session_count: u64::from(info.ulSessionCount),
            max_rw_session_count: u64::from(info.ulMaxRwSessionCount),
            rw_session_count: u64::from(info.ulRwSessionCount),
            max_pin_len: u64::from(info.ulMaxPinLen),
            min_pin_len: u64::from(info.ulMinPinLen),
            total_public_memory: u64::from(info.ulTotalPublicMemory),
            free_public_memory: u64::from(info.ulFreePublicMemory),
            total_private_memory: u64::from(info.ulTotalPrivateMemory),
            free_private_memory: u64::from(info.ulFreePrivateMemory),
            hardware_version: info.hardwareVersion.into(),
            firmware_version: info.firmwareVersion.into(),
            utc_time: padded_text(&info.utcTime),
        }
    }
}

impl Token {
    /// General information about the loaded module.
    pub fn general_info(&self) -> HResult<ModuleInfo> {
        let mut info = CK_INFO::default();
        hsm_call!(self.hsm, InfoQueryFailed, C_GetInfo, &raw mut info);
        Ok(info.into())
    }

    /// The slot ids known to the module, restricted to slots holding a token
    /// when `token_present` is set.
    pub fn slot_list(&self, token_present: bool) -> HResult<Vec<CK_SLOT_ID>> {
        let token_present = u8::from(token_present);
        loop {
            let mut count: CK_ULONG = 0;
            hsm_call!(
                self.hsm,
                InfoQueryFailed,
                C_GetSlotList,
                token_present,
                ptr::null_mut(),
                &raw mut count
            );
            let mut slots: Vec<CK_SLOT_ID> = vec![0; usize::try_from(count)?];
            let rv = hsm_rv!(
                self.hsm,
                C_GetSlotList,
                token_present,
                slots.as_mut_ptr(),
                &raw mut count
            );
            match rv {
                CKR_OK => {
                    slots.truncate(usize::try_from(count)?);
                    return Ok(slots);
                }
                // a slot appeared between the two calls
                CKR_BUFFER_TOO_SMALL => debug!("slot list grew, querying again"),
                rv => {
                    return Err(HError::InfoQueryFailed {
                        operation: "C_GetSlotList",
                        rv,
                    });
                }
            }
        }
    }

    pub fn slot_info(&self, slot_id: CK_SLOT_ID) -> HResult<SlotInfo> {
        let mut info = CK_SLOT_INFO::default();
        let rv = hsm_rv!(self.hsm, C_GetSlotInfo, slot_id, &raw mut info);
        match rv {
            CKR_OK => Ok(SlotInfo::from_raw(slot_id, &info)),
            CKR_SLOT_ID_INVALID => Err(HError::InvalidSlot { slot_id, rv }),
            rv => Err(HError::InfoQueryFailed {
                operation: "C_GetSlotInfo",
                rv,
            }),
        }
    }

    pub fn token_info(&self, slot_id: CK_SLOT_ID) -> HResult<TokenInfo> {
        let mut info = CK_TOKEN_INFO::default();
        let rv = hsm_rv!(self.hsm, C_GetTokenInfo, slot_id, &raw mut info);
        match rv {
            CKR_OK => Ok(TokenInfo::from_raw(slot_id, &info)),
            CKR_SLOT_ID_INVALID => Err(HError::InvalidSlot { slot_id, rv }),
            CKR_TOKEN_NOT_PRESENT => Err(HError::NoTokenPresent { slot_id, rv }),
            rv => Err(HError::InfoQueryFailed {
                operation: "C_GetTokenInfo",
                rv,
            }),
        }
    }
}
