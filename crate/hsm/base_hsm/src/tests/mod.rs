//! These tests drive the token layer through the in-process module of
//! `crate::soft_token`, which the function table calls exactly as it would call a
//! dynamically loaded library.
#![allow(clippy::unwrap_used, clippy::panic_in_result_fn)]

mod operation_tests;

use pkcs11_sys::CK_ULONG;

use crate::{
    Attribute, AttributeKind, AttributeTemplate, HResult, KeyHandle, Mechanism, SessionFlags,
    SessionHandle, Token,
};

pub(crate) fn rw_serial() -> SessionFlags {
    SessionFlags::RW_SESSION | SessionFlags::SERIAL_SESSION
}

/// An AES key usable for both encryption and decryption.
pub(crate) fn aes_key(token: &Token, session: SessionHandle, len: CK_ULONG) -> HResult<KeyHandle> {
    let template = AttributeTemplate::build([
        Attribute::bool(AttributeKind::Encrypt, true),
        Attribute::bool(AttributeKind::Decrypt, true),
        Attribute::ulong(AttributeKind::ValueLen, len),
    ])?;
    token.generate_key(session, &Mechanism::AesKeyGen, &template, "test key", false)
}
