//! Single-shot operations over a PKCS#11 token.
//!
//! A [`Token`] owns the loaded module. Sessions opened on it are addressed by
//! [`SessionHandle`] values, which index a registry owned by the token, and every
//! cryptographic call goes through that registry so a closed or never-opened
//! handle fails before anything reaches the module.

#![allow(non_snake_case)]

/// Invoke a function of the module table and return its raw `CK_RV`.
///
/// Fails early when the module has been finalized or has reported a fatal
/// error, or when the library does not export the function.
macro_rules! hsm_rv {
    ($hsm:expr, $function:ident $(, $arg:expr)* $(,)?) => {{
        let hsm = &$hsm;
        hsm.ensure_usable()?;
        let function = hsm
            .$function
            .ok_or($crate::HError::FunctionNotSupported(stringify!($function)))?;
        #[allow(unsafe_code)]
        let rv = unsafe { function($($arg),*) };
        hsm.observe(stringify!($function), rv);
        rv
    }};
}

/// Invoke a function of the module table and return early with the typed
/// `$failure` variant when the module does not answer `CKR_OK`.
macro_rules! hsm_call {
    ($hsm:expr, $failure:ident, $function:ident $(, $arg:expr)* $(,)?) => {{
        let rv = $crate::hsm_rv!($hsm, $function $(, $arg)*);
        if rv != pkcs11_sys::CKR_OK {
            tracing::debug!("{} returned {}", stringify!($function), $crate::rv_name(&rv));
            return Err($crate::HError::$failure {
                operation: stringify!($function),
                rv,
            });
        }
    }};
}

pub(crate) use hsm_call;
pub(crate) use hsm_rv;

mod error;
mod hsm_lib;
mod info;
mod library;
mod mechanism;
mod session;
#[cfg(any(test, feature = "soft-token"))]
pub mod soft_token;
mod template;
mod token;

pub use error::{HError, HResult, rv_name};
pub use info::{ModuleInfo, SlotFlags, SlotInfo, TokenFlags, TokenInfo, Version};
pub use library::resolve_library;
pub use mechanism::{Mechanism, MechanismKind};
pub use pkcs11_sys::{CK_OBJECT_HANDLE, CK_RV, CK_SLOT_ID};
pub use session::{KeyHandle, SessionFlags, SessionHandle, SessionState};
pub use template::{Attribute, AttributeKind, AttributeTemplate};
pub use token::Token;

#[cfg(test)]
mod tests;
