use pkcs11_sys::{
    CK_FLAGS, CK_RV, CK_SLOT_ID, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_ATTRIBUTE_VALUE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_ALREADY_INITIALIZED,
    CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DATA_LEN_RANGE, CKR_DEVICE_ERROR, CKR_DEVICE_REMOVED,
    CKR_ENCRYPTED_DATA_INVALID, CKR_ENCRYPTED_DATA_LEN_RANGE, CKR_FUNCTION_FAILED,
    CKR_FUNCTION_NOT_SUPPORTED, CKR_GENERAL_ERROR, CKR_HOST_MEMORY, CKR_KEY_FUNCTION_NOT_PERMITTED,
    CKR_KEY_HANDLE_INVALID, CKR_KEY_SIZE_RANGE, CKR_KEY_TYPE_INCONSISTENT,
    CKR_MECHANISM_INVALID, CKR_MECHANISM_PARAM_INVALID, CKR_OK, CKR_OPERATION_ACTIVE,
    CKR_OPERATION_NOT_INITIALIZED, CKR_RANDOM_NO_RNG, CKR_RANDOM_SEED_NOT_SUPPORTED,
    CKR_SESSION_CLOSED, CKR_SESSION_COUNT, CKR_SESSION_HANDLE_INVALID,
    CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SLOT_ID_INVALID, CKR_TEMPLATE_INCOMPLETE,
    CKR_TEMPLATE_INCONSISTENT, CKR_TOKEN_NOT_PRESENT, CKR_TOKEN_WRITE_PROTECTED,
    CKR_USER_NOT_LOGGED_IN,
};
use thiserror::Error;

use crate::AttributeKind;

pub type HResult<T> = Result<T, HError>;

/// Failures of the token layer.
///
/// Variants raised from a module return value carry the PKCS#11 function that
/// failed (`operation`) and the code it returned (`rv`). Library location and
/// loading failures are kept apart from those operation failures.
#[derive(Error, Debug)]
pub enum HError {
    #[error("{0}")]
    Default(String),

    #[error("Library not found on the current platform: {0}")]
    LibraryNotFound(String),

    #[error("Error loading the library: {0}")]
    LibLoading(#[from] libloading::Error),

    #[error("Module call {operation} failed: {}", rv_name(.rv))]
    ModuleCallFailed { operation: &'static str, rv: CK_RV },

    #[error("The module can no longer be used: {0}")]
    ModuleUnusable(String),

    #[error("{0} not available on library")]
    FunctionNotSupported(&'static str),

    #[error("Invalid session flags {0:#x}: only read/write and serial are recognized")]
    InvalidSessionFlags(CK_FLAGS),

    #[error("Failed opening a session: {operation} returned {}", rv_name(.rv))]
    SessionOpenFailed { operation: &'static str, rv: CK_RV },

    #[error("Failed closing a session: {operation} returned {}", rv_name(.rv))]
    SessionCloseFailed { operation: &'static str, rv: CK_RV },

    #[error("Session #{0} was never opened")]
    SessionNotOpen(u64),

    #[error("Session #{0} is closed")]
    SessionClosed(u64),

    #[error("Cannot finalize the module: {0} session(s) still open")]
    SessionsStillOpen(usize),

    #[error("Failed encrypting: {operation} returned {}", rv_name(.rv))]
    EncryptFailed { operation: &'static str, rv: CK_RV },

    #[error("Failed decrypting: {operation} returned {}", rv_name(.rv))]
    DecryptFailed { operation: &'static str, rv: CK_RV },

    #[error("Failed digesting: {operation} returned {}", rv_name(.rv))]
    DigestFailed { operation: &'static str, rv: CK_RV },

    #[error("Failed generating key: {operation} returned {}", rv_name(.rv))]
    KeyGenFailed { operation: &'static str, rv: CK_RV },

    #[error("Failed generating random data: {operation} returned {}", rv_name(.rv))]
    RandomGenFailed { operation: &'static str, rv: CK_RV },

    #[error("Failed seeding the random generator: {operation} returned {}", rv_name(.rv))]
    SeedFailed { operation: &'static str, rv: CK_RV },

    #[error(
        "{operation}: output buffer of {provided} bytes is too small{}",
        required.map(|r| format!(", {r} bytes required")).unwrap_or_default()
    )]
    BufferTooSmall {
        operation: &'static str,
        provided: usize,
        required: Option<usize>,
    },

    #[error("{operation} cannot be used with mechanism {mechanism}")]
    MechanismMismatch {
        operation: &'static str,
        mechanism: &'static str,
    },

    #[error("Duplicate attribute {0} in template")]
    DuplicateAttribute(AttributeKind),

    #[error("Attribute {attribute} does not apply to mechanism {mechanism}")]
    AttributeNotApplicable {
        attribute: AttributeKind,
        mechanism: &'static str,
    },

    #[error("Key belongs to slot {key_slot}, the session is on slot {session_slot}")]
    KeySlotMismatch {
        key_slot: CK_SLOT_ID,
        session_slot: CK_SLOT_ID,
    },

    #[error("Invalid slot {slot_id}: {}", rv_name(.rv))]
    InvalidSlot { slot_id: CK_SLOT_ID, rv: CK_RV },

    #[error("No token present in slot {slot_id}")]
    NoTokenPresent { slot_id: CK_SLOT_ID, rv: CK_RV },

    #[error("Failed querying the module: {operation} returned {}", rv_name(.rv))]
    InfoQueryFailed { operation: &'static str, rv: CK_RV },

    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
}

impl HError {
    /// The code returned by the module, when the failure came from it.
    #[must_use]
    pub const fn rv(&self) -> Option<CK_RV> {
        match self {
            Self::ModuleCallFailed { rv, .. }
            | Self::SessionOpenFailed { rv, .. }
            | Self::SessionCloseFailed { rv, .. }
            | Self::EncryptFailed { rv, .. }
            | Self::DecryptFailed { rv, .. }
            | Self::DigestFailed { rv, .. }
            | Self::KeyGenFailed { rv, .. }
            | Self::RandomGenFailed { rv, .. }
            | Self::SeedFailed { rv, .. }
            | Self::InvalidSlot { rv, .. }
            | Self::NoTokenPresent { rv, .. }
            | Self::InfoQueryFailed { rv, .. } => Some(*rv),
            Self::BufferTooSmall { .. } => Some(CKR_BUFFER_TOO_SMALL),
            _ => None,
        }
    }

    /// The PKCS#11 function the failure originates from, if any.
    #[must_use]
    pub const fn operation(&self) -> Option<&'static str> {
        match self {
            Self::ModuleCallFailed { operation, .. }
            | Self::SessionOpenFailed { operation, .. }
            | Self::SessionCloseFailed { operation, .. }
            | Self::EncryptFailed { operation, .. }
            | Self::DecryptFailed { operation, .. }
            | Self::DigestFailed { operation, .. }
            | Self::KeyGenFailed { operation, .. }
            | Self::RandomGenFailed { operation, .. }
            | Self::SeedFailed { operation, .. }
            | Self::BufferTooSmall { operation, .. }
            | Self::MechanismMismatch { operation, .. }
            | Self::InfoQueryFailed { operation, .. } => Some(operation),
            Self::FunctionNotSupported(operation) => Some(operation),
            Self::InvalidSlot { .. } => Some("C_GetSlotInfo"),
            Self::NoTokenPresent { .. } => Some("C_GetTokenInfo"),
            _ => None,
        }
    }
}

/// Render a `CK_RV` as its symbolic name followed by the hex code.
#[must_use]
pub fn rv_name(rv: &CK_RV) -> String {
    let name = match *rv {
        CKR_OK => "CKR_OK",
        CKR_HOST_MEMORY => "CKR_HOST_MEMORY",
        CKR_SLOT_ID_INVALID => "CKR_SLOT_ID_INVALID",
        CKR_GENERAL_ERROR => "CKR_GENERAL_ERROR",
        CKR_FUNCTION_FAILED => "CKR_FUNCTION_FAILED",
        CKR_ARGUMENTS_BAD => "CKR_ARGUMENTS_BAD",
        CKR_ATTRIBUTE_TYPE_INVALID => "CKR_ATTRIBUTE_TYPE_INVALID",
        CKR_ATTRIBUTE_VALUE_INVALID => "CKR_ATTRIBUTE_VALUE_INVALID",
        CKR_DATA_LEN_RANGE => "CKR_DATA_LEN_RANGE",
        CKR_DEVICE_ERROR => "CKR_DEVICE_ERROR",
        CKR_DEVICE_REMOVED => "CKR_DEVICE_REMOVED",
        CKR_ENCRYPTED_DATA_INVALID => "CKR_ENCRYPTED_DATA_INVALID",
        CKR_ENCRYPTED_DATA_LEN_RANGE => "CKR_ENCRYPTED_DATA_LEN_RANGE",
        CKR_FUNCTION_NOT_SUPPORTED => "CKR_FUNCTION_NOT_SUPPORTED",
        CKR_KEY_HANDLE_INVALID => "CKR_KEY_HANDLE_INVALID",
        CKR_KEY_SIZE_RANGE => "CKR_KEY_SIZE_RANGE",
        CKR_KEY_TYPE_INCONSISTENT => "CKR_KEY_TYPE_INCONSISTENT",
        CKR_KEY_FUNCTION_NOT_PERMITTED => "CKR_KEY_FUNCTION_NOT_PERMITTED",
        CKR_MECHANISM_INVALID => "CKR_MECHANISM_INVALID",
        CKR_MECHANISM_PARAM_INVALID => "CKR_MECHANISM_PARAM_INVALID",
        CKR_OPERATION_ACTIVE => "CKR_OPERATION_ACTIVE",
        CKR_OPERATION_NOT_INITIALIZED => "CKR_OPERATION_NOT_INITIALIZED",
        CKR_SESSION_CLOSED => "CKR_SESSION_CLOSED",
        CKR_SESSION_COUNT => "CKR_SESSION_COUNT",
        CKR_SESSION_HANDLE_INVALID => "CKR_SESSION_HANDLE_INVALID",
        CKR_SESSION_PARALLEL_NOT_SUPPORTED => "CKR_SESSION_PARALLEL_NOT_SUPPORTED",
        CKR_TEMPLATE_INCOMPLETE => "CKR_TEMPLATE_INCOMPLETE",
        CKR_TEMPLATE_INCONSISTENT => "CKR_TEMPLATE_INCONSISTENT",
        CKR_TOKEN_NOT_PRESENT => "CKR_TOKEN_NOT_PRESENT",
        CKR_TOKEN_WRITE_PROTECTED => "CKR_TOKEN_WRITE_PROTECTED",
        CKR_USER_NOT_LOGGED_IN => "CKR_USER_NOT_LOGGED_IN",
        CKR_BUFFER_TOO_SMALL => "CKR_BUFFER_TOO_SMALL",
        CKR_RANDOM_SEED_NOT_SUPPORTED => "CKR_RANDOM_SEED_NOT_SUPPORTED",
        CKR_RANDOM_NO_RNG => "CKR_RANDOM_NO_RNG",
        CKR_CRYPTOKI_NOT_INITIALIZED => "CKR_CRYPTOKI_NOT_INITIALIZED",
        CKR_CRYPTOKI_ALREADY_INITIALIZED => "CKR_CRYPTOKI_ALREADY_INITIALIZED",
        _ => "CKR_UNKNOWN",
    };
    format!("{name} ({rv:#x})")
}
