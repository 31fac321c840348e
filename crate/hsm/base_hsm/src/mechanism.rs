use std::ptr;

use pkcs11_sys::{
    CK_KEY_TYPE, CK_MECHANISM, CK_MECHANISM_PTR, CK_MECHANISM_TYPE, CK_ULONG, CKK_AES, CKK_DES3,
    CKK_GENERIC_SECRET, CKM_AES_CBC, CKM_AES_CBC_PAD, CKM_AES_ECB, CKM_AES_KEY_GEN, CKM_DES3_CBC,
    CKM_DES3_CBC_PAD, CKM_DES3_ECB, CKM_DES3_KEY_GEN, CKM_GENERIC_SECRET_KEY_GEN, CKM_SHA_1,
    CKM_SHA256, CKM_SHA384, CKM_SHA512,
};

use crate::{AttributeKind, HError, HResult};

/// What a mechanism can be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismKind {
    Cipher,
    Digest,
    KeyGeneration,
}

/// The mechanisms the token layer knows how to drive, each with its own
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    AesEcb,
    AesCbc { iv: [u8; 16] },
    AesCbcPad { iv: [u8; 16] },
    Des3Ecb,
    Des3Cbc { iv: [u8; 8] },
    Des3CbcPad { iv: [u8; 8] },
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    AesKeyGen,
    Des3KeyGen,
    GenericSecretKeyGen,
}

const SECRET_KEY_ATTRIBUTES: &[AttributeKind] = &[
    AttributeKind::Token,
    AttributeKind::Id,
    AttributeKind::Sensitive,
    AttributeKind::Extractable,
    AttributeKind::Modifiable,
    AttributeKind::Encrypt,
    AttributeKind::Decrypt,
    AttributeKind::Wrap,
    AttributeKind::Unwrap,
    AttributeKind::Sign,
    AttributeKind::Verify,
    AttributeKind::Derive,
];

// Generic secrets are not cipher keys.
const GENERIC_SECRET_ATTRIBUTES: &[AttributeKind] = &[
    AttributeKind::Token,
    AttributeKind::Id,
    AttributeKind::Sensitive,
    AttributeKind::Extractable,
    AttributeKind::Modifiable,
    AttributeKind::Sign,
    AttributeKind::Verify,
    AttributeKind::Derive,
    AttributeKind::ValueLen,
];

impl Mechanism {
    #[must_use]
    pub const fn kind(&self) -> MechanismKind {
        match self {
            Self::AesEcb
            | Self::AesCbc { .. }
            | Self::AesCbcPad { .. }
            | Self::Des3Ecb
            | Self::Des3Cbc { .. }
            | Self::Des3CbcPad { .. } => MechanismKind::Cipher,
            Self::Sha1 | Self::Sha256 | Self::Sha384 | Self::Sha512 => MechanismKind::Digest,
            Self::AesKeyGen | Self::Des3KeyGen | Self::GenericSecretKeyGen => {
                MechanismKind::KeyGeneration
            }
        }
    }

    #[must_use]
    pub const fn mechanism_type(&self) -> CK_MECHANISM_TYPE {
        match self {
            Self::AesEcb => CKM_AES_ECB,
            Self::AesCbc { .. } => CKM_AES_CBC,
            Self::AesCbcPad { .. } => CKM_AES_CBC_PAD,
            Self::Des3Ecb => CKM_DES3_ECB,
            Self::Des3Cbc { .. } => CKM_DES3_CBC,
            Self::Des3CbcPad { .. } => CKM_DES3_CBC_PAD,
            Self::Sha1 => CKM_SHA_1,
            Self::Sha256 => CKM_SHA256,
            Self::Sha384 => CKM_SHA384,
            Self::Sha512 => CKM_SHA512,
            Self::AesKeyGen => CKM_AES_KEY_GEN,
            Self::Des3KeyGen => CKM_DES3_KEY_GEN,
            Self::GenericSecretKeyGen => CKM_GENERIC_SECRET_KEY_GEN,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AesEcb => "CKM_AES_ECB",
            Self::AesCbc { .. } => "CKM_AES_CBC",
            Self::AesCbcPad { .. } => "CKM_AES_CBC_PAD",
            Self::Des3Ecb => "CKM_DES3_ECB",
            Self::Des3Cbc { .. } => "CKM_DES3_CBC",
            Self::Des3CbcPad { .. } => "CKM_DES3_CBC_PAD",
            Self::Sha1 => "CKM_SHA_1",
            Self::Sha256 => "CKM_SHA256",
            Self::Sha384 => "CKM_SHA384",
            Self::Sha512 => "CKM_SHA512",
            Self::AesKeyGen => "CKM_AES_KEY_GEN",
            Self::Des3KeyGen => "CKM_DES3_KEY_GEN",
            Self::GenericSecretKeyGen => "CKM_GENERIC_SECRET_KEY_GEN",
        }
    }

    /// Length in bytes of the digest produced by a digest mechanism.
    #[must_use]
    pub const fn digest_len(&self) -> Option<usize> {
        match self {
            Self::Sha1 => Some(20),
            Self::Sha256 => Some(32),
            Self::Sha384 => Some(48),
            Self::Sha512 => Some(64),
            _ => None,
        }
    }

    /// Key type of the objects created by a key generation mechanism.
    #[must_use]
    pub const fn key_type(&self) -> Option<CK_KEY_TYPE> {
        match self {
            Self::AesKeyGen => Some(CKK_AES),
            Self::Des3KeyGen => Some(CKK_DES3),
            Self::GenericSecretKeyGen => Some(CKK_GENERIC_SECRET),
            _ => None,
        }
    }

    /// Whether a template attribute is meaningful for this key generation
    /// mechanism. DES3 keys have a fixed length, so `CKA_VALUE_LEN` is refused.
    #[must_use]
    pub fn accepts(&self, attribute: AttributeKind) -> bool {
        if matches!(attribute, AttributeKind::Label | AttributeKind::Private) {
            return self.kind() == MechanismKind::KeyGeneration;
        }
        match self {
            Self::AesKeyGen => {
                attribute == AttributeKind::ValueLen || SECRET_KEY_ATTRIBUTES.contains(&attribute)
            }
            Self::Des3KeyGen => SECRET_KEY_ATTRIBUTES.contains(&attribute),
            Self::GenericSecretKeyGen => GENERIC_SECRET_ATTRIBUTES.contains(&attribute),
            _ => false,
        }
    }

    pub(crate) fn ensure_kind(&self, operation: &'static str, kind: MechanismKind) -> HResult<()> {
        if self.kind() != kind {
            return Err(HError::MechanismMismatch {
                operation,
                mechanism: self.name(),
            });
        }
        Ok(())
    }

    /// Run `f` with a raw `CK_MECHANISM` describing `self`.
    ///
    /// The parameter block lives on this stack frame until `f` returns.
    pub(crate) fn with_raw<R>(&self, f: impl FnOnce(CK_MECHANISM_PTR) -> HResult<R>) -> HResult<R> {
        let mut parameter: Vec<u8> = match self {
            Self::AesCbc { iv } | Self::AesCbcPad { iv } => iv.to_vec(),
            Self::Des3Cbc { iv } | Self::Des3CbcPad { iv } => iv.to_vec(),
            _ => Vec::new(),
        };
        let mut mechanism = CK_MECHANISM {
            mechanism: self.mechanism_type(),
            pParameter: if parameter.is_empty() {
                ptr::null_mut()
            } else {
                parameter.as_mut_ptr().cast()
            },
            ulParameterLen: CK_ULONG::try_from(parameter.len())?,
        };
        f(&raw mut mechanism)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(Mechanism::AesCbcPad { iv: [0; 16] }.kind(), MechanismKind::Cipher);
        assert_eq!(Mechanism::Sha384.kind(), MechanismKind::Digest);
        assert_eq!(Mechanism::Des3KeyGen.kind(), MechanismKind::KeyGeneration);
        assert!(Mechanism::Sha256.ensure_kind("C_Digest", MechanismKind::Digest).is_ok());
        assert!(matches!(
            Mechanism::AesEcb.ensure_kind("C_Digest", MechanismKind::Digest),
            Err(HError::MechanismMismatch {
                operation: "C_Digest",
                mechanism: "CKM_AES_ECB"
            })
        ));
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(Mechanism::Sha1.digest_len(), Some(20));
        assert_eq!(Mechanism::Sha512.digest_len(), Some(64));
        assert_eq!(Mechanism::AesEcb.digest_len(), None);
    }

    #[test]
    fn template_attributes_per_mechanism() {
        assert!(Mechanism::AesKeyGen.accepts(AttributeKind::ValueLen));
        assert!(!Mechanism::Des3KeyGen.accepts(AttributeKind::ValueLen));
        assert!(Mechanism::Des3KeyGen.accepts(AttributeKind::Encrypt));
        assert!(!Mechanism::GenericSecretKeyGen.accepts(AttributeKind::Encrypt));
        assert!(Mechanism::GenericSecretKeyGen.accepts(AttributeKind::Sign));
        assert!(!Mechanism::Sha256.accepts(AttributeKind::Token));
    }

    #[test]
    fn raw_view_carries_the_iv() {
        let iv = [7_u8; 16];
        Mechanism::AesCbc { iv }
            .with_raw(|raw| {
                #[allow(unsafe_code)]
                let raw = unsafe { &*raw };
                assert_eq!(raw.mechanism, CKM_AES_CBC);
                assert_eq!(raw.ulParameterLen, 16);
                #[allow(unsafe_code)]
                let parameter = unsafe { std::slice::from_raw_parts(raw.pParameter.cast::<u8>(), 16) };
                assert_eq!(parameter, &iv);
                Ok(())
            })
            .unwrap();
        Mechanism::Sha256
            .with_raw(|raw| {
                #[allow(unsafe_code)]
                let raw = unsafe { &*raw };
                assert!(raw.pParameter.is_null());
                assert_eq!(raw.ulParameterLen, 0);
                Ok(())
            })
            .unwrap();
    }
}
