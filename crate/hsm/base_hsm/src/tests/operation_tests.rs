use cryptoki_mgmt_logger::log_init;
use pkcs11_sys::{
    CKA_CLASS, CKA_DECRYPT, CKA_ENCRYPT, CKA_KEY_TYPE, CKA_LABEL, CKA_PRIVATE, CKA_VALUE_LEN,
    CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_VALUE_INVALID, CKR_DATA_LEN_RANGE,
    CKR_ENCRYPTED_DATA_LEN_RANGE, CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_MECHANISM_INVALID,
    CKR_TEMPLATE_INCOMPLETE,
};
use sha2::{Digest, Sha256};

use super::{aes_key, rw_serial};
use crate::{
    Attribute, AttributeKind, AttributeTemplate, HError, HResult, Mechanism, SessionFlags,
    soft_token::{soft_key, soft_token},
};

const IV: [u8; 16] = *b"0123456789abcdef";

#[test]
fn encrypt_decrypt_round_trip() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, rw_serial())?;
    for key_len in [16, 24, 32] {
        let key = aes_key(&token, session, key_len)?;
        let block_aligned = [0x5a_u8; 48];
        for mechanism in [Mechanism::AesEcb, Mechanism::AesCbc { iv: IV }] {
            let ciphertext = token.encrypt(session, &mechanism, key, &block_aligned, None)?;
            assert_eq!(ciphertext.len(), block_aligned.len());
            assert_ne!(ciphertext.as_slice(), block_aligned.as_slice());
            let plaintext = token.decrypt(session, &mechanism, key, &ciphertext, None)?;
            assert_eq!(plaintext.as_slice(), block_aligned.as_slice());
        }

        let mechanism = Mechanism::AesCbcPad { iv: IV };
        for plaintext in [&b""[..], b"a", b"sixteen bytes!!!", b"a message that spans several blocks"] {
            let ciphertext = token.encrypt(session, &mechanism, key, plaintext, None)?;
            assert_eq!(ciphertext.len() % 16, 0);
            assert!(ciphertext.len() > plaintext.len());
            let decrypted = token.decrypt(session, &mechanism, key, &ciphertext, None)?;
            assert_eq!(decrypted.as_slice(), plaintext);
        }
    }
    token.close_session(session)?;
    Ok(())
}

#[test]
fn undersized_output_reports_required_length() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, rw_serial())?;
    let key = aes_key(&token, session, 32)?;
    let mechanism = Mechanism::AesCbcPad { iv: IV };
    let plaintext = [7_u8; 20];

    let err = token
        .encrypt(session, &mechanism, key, &plaintext, Some(16))
        .unwrap_err();
    assert!(matches!(
        err,
        HError::BufferTooSmall {
            operation: "C_Encrypt",
            provided: 16,
            required: Some(32)
        }
    ));

    // the session is still usable and an exact buffer works
    let ciphertext = token.encrypt(session, &mechanism, key, &plaintext, Some(32))?;
    assert_eq!(ciphertext.len(), 32);
    // a larger buffer is truncated to the real length
    let decrypted = token.decrypt(session, &mechanism, key, &ciphertext, Some(64))?;
    assert_eq!(decrypted.as_slice(), plaintext.as_slice());

    let err = token
        .decrypt(session, &mechanism, key, &ciphertext, Some(0))
        .unwrap_err();
    assert!(matches!(
        err,
        HError::BufferTooSmall {
            provided: 0,
            required: Some(_),
            ..
        }
    ));

    // an empty buffer is exactly right for an empty result
    assert!(
        token
            .encrypt(session, &Mechanism::AesEcb, key, b"", Some(0))?
            .is_empty()
    );
    assert!(token.encrypt(session, &Mechanism::AesEcb, key, b"", None)?.is_empty());
    token.close_session(session)?;
    Ok(())
}

#[test]
fn cipher_failures_carry_operation_and_code() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(2, rw_serial())?;
    let key = aes_key(&token, session, 16)?;

    let err = token
        .encrypt(session, &Mechanism::AesEcb, key, b"not a block", None)
        .unwrap_err();
    assert!(matches!(err, HError::EncryptFailed { .. }));
    assert_eq!(err.operation(), Some("C_Encrypt"));
    assert_eq!(err.rv(), Some(CKR_DATA_LEN_RANGE));

    let err = token
        .decrypt(session, &Mechanism::AesEcb, key, &[0_u8; 15], None)
        .unwrap_err();
    assert!(matches!(
        err,
        HError::DecryptFailed {
            operation: "C_Decrypt",
            rv: CKR_ENCRYPTED_DATA_LEN_RANGE
        }
    ));

    let err = token
        .encrypt(session, &Mechanism::Des3Cbc { iv: [0; 8] }, key, &[0_u8; 8], None)
        .unwrap_err();
    assert!(matches!(
        err,
        HError::EncryptFailed {
            operation: "C_EncryptInit",
            rv: CKR_MECHANISM_INVALID
        }
    ));

    // failures are not retried and leave the session usable
    let ciphertext = token.encrypt(session, &Mechanism::AesEcb, key, &[1_u8; 16], None)?;
    assert_eq!(ciphertext.len(), 16);
    token.close_session(session)?;
    Ok(())
}

#[test]
fn key_usage_is_enforced_by_the_token() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, rw_serial())?;
    let template = AttributeTemplate::build([Attribute::ulong(AttributeKind::ValueLen, 16)])?;
    let key = token.generate_key(session, &Mechanism::AesKeyGen, &template, "no usage", false)?;
    let err = token
        .encrypt(session, &Mechanism::AesEcb, key, &[0_u8; 16], None)
        .unwrap_err();
    assert!(matches!(
        err,
        HError::EncryptFailed {
            operation: "C_EncryptInit",
            rv: CKR_KEY_FUNCTION_NOT_PERMITTED
        }
    ));
    token.close_session(session)?;
    Ok(())
}

#[test]
fn caller_errors_never_reach_the_token() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let on_one = token.open_session(1, rw_serial())?;
    let on_two = token.open_session(2, rw_serial())?;
    let key = aes_key(&token, on_one, 16)?;

    assert!(matches!(
        token.encrypt(on_one, &Mechanism::Sha256, key, &[0_u8; 16], None),
        Err(HError::MechanismMismatch {
            operation: "C_EncryptInit",
            mechanism: "CKM_SHA256"
        })
    ));
    assert!(matches!(
        token.digest(on_one, &Mechanism::AesEcb, b"data", None),
        Err(HError::MechanismMismatch { .. })
    ));
    assert!(matches!(
        token.encrypt(on_two, &Mechanism::AesEcb, key, &[0_u8; 16], None),
        Err(HError::KeySlotMismatch {
            key_slot: 1,
            session_slot: 2
        })
    ));
    token.close_session(on_one)?;
    token.close_session(on_two)?;
    Ok(())
}

#[test]
fn digest_is_deterministic() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, SessionFlags::SERIAL_SESSION)?;

    let first = token.digest(session, &Mechanism::Sha256, b"abc", None)?;
    let second = token.digest(session, &Mechanism::Sha256, b"abc", None)?;
    assert_eq!(first, second);
    assert_eq!(
        hex::encode(&first),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );

    let data = b"The quick brown fox jumps over the lazy dog".repeat(40);
    assert_eq!(
        token.digest(session, &Mechanism::Sha256, &data, Some(32))?,
        Sha256::digest(&data).to_vec()
    );
    assert_eq!(token.digest(session, &Mechanism::Sha384, &data, None)?.len(), 48);
    assert_eq!(token.digest(session, &Mechanism::Sha512, &data, None)?.len(), 64);
    assert_eq!(token.digest(session, &Mechanism::Sha256, b"", None)?.len(), 32);
    token.close_session(session)?;
    Ok(())
}

#[test]
fn digest_rejects_zero_length_output() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, SessionFlags::SERIAL_SESSION)?;

    let err = token
        .digest(session, &Mechanism::Sha256, b"abc", Some(0))
        .unwrap_err();
    assert!(matches!(
        err,
        HError::BufferTooSmall {
            operation: "C_Digest",
            provided: 0,
            required: Some(32)
        }
    ));

    let err = token
        .digest(session, &Mechanism::Sha512, b"abc", Some(16))
        .unwrap_err();
    assert!(matches!(
        err,
        HError::BufferTooSmall {
            provided: 16,
            required: Some(64),
            ..
        }
    ));

    // neither failure left an operation active
    assert_eq!(token.digest(session, &Mechanism::Sha256, b"abc", None)?.len(), 32);
    token.close_session(session)?;
    Ok(())
}

#[test]
fn unsupported_digest_is_a_digest_failure() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, SessionFlags::SERIAL_SESSION)?;
    let err = token
        .digest(session, &Mechanism::Sha1, b"abc", None)
        .unwrap_err();
    assert!(matches!(
        err,
        HError::DigestFailed {
            operation: "C_DigestInit",
            rv: CKR_MECHANISM_INVALID
        }
    ));
    token.close_session(session)?;
    Ok(())
}

#[test]
fn random_has_the_requested_length() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, SessionFlags::SERIAL_SESSION)?;
    for len in [1, 20, 257, 4096] {
        assert_eq!(token.generate_random(session, len)?.len(), len);
    }
    let a = token.generate_random(session, 32)?;
    let b = token.generate_random(session, 32)?;
    assert_ne!(a, b);

    assert!(matches!(
        token.generate_random(session, 0),
        Err(HError::BufferTooSmall {
            operation: "C_GenerateRandom",
            provided: 0,
            required: None
        })
    ));
    token.close_session(session)?;
    Ok(())
}

#[test]
fn seeding_never_breaks_generation() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, rw_serial())?;
    let seed = b"some caller entropy".to_vec();
    token.seed_random(session, &seed)?;
    // the caller's buffer is left alone
    assert_eq!(seed, b"some caller entropy");
    assert_eq!(token.generate_random(session, 16)?.len(), 16);

    let err = token.seed_random(session, &[]).unwrap_err();
    assert!(matches!(
        err,
        HError::SeedFailed {
            operation: "C_SeedRandom",
            rv: CKR_ARGUMENTS_BAD
        }
    ));
    assert_eq!(token.generate_random(session, 16)?.len(), 16);
    token.close_session(session)?;
    Ok(())
}

#[test]
fn random_seed_random_on_slot_two() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(2, rw_serial())?;

    let before = token.generate_random(session, 20)?;
    token.seed_random(session, &hex::decode("deadbeefdeadbeef").unwrap())?;
    let after = token.generate_random(session, 20)?;
    assert_eq!(before.len(), 20);
    assert_eq!(after.len(), 20);
    assert_ne!(before, after);

    token.close_session(session)?;
    Ok(())
}

#[test]
fn generated_key_carries_label_visibility_and_template_order() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, rw_serial())?;
    let template = AttributeTemplate::build([
        Attribute::bool(AttributeKind::Encrypt, true),
        Attribute::ulong(AttributeKind::ValueLen, 24),
        Attribute::bool(AttributeKind::Decrypt, false),
    ])?;
    let key = token.generate_key(session, &Mechanism::AesKeyGen, &template, "my-aes-key", true)?;
    assert_eq!(key.slot_id(), 1);

    let stored = soft_key(key.object()).unwrap();
    assert_eq!(stored.label, b"my-aes-key");
    assert!(stored.private);
    assert!(stored.encrypt);
    assert!(!stored.decrypt);
    assert_eq!(stored.value.len(), 24);
    assert_eq!(
        stored.template_types,
        vec![
            CKA_CLASS,
            CKA_KEY_TYPE,
            CKA_ENCRYPT,
            CKA_VALUE_LEN,
            CKA_DECRYPT,
            CKA_LABEL,
            CKA_PRIVATE
        ]
    );

    let public = token.generate_key(session, &Mechanism::AesKeyGen, &template, "public", false)?;
    assert!(!soft_key(public.object()).unwrap().private);
    token.close_session(session)?;
    Ok(())
}

#[test]
fn template_is_checked_against_the_mechanism() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, rw_serial())?;

    let with_label = AttributeTemplate::build([
        Attribute::ulong(AttributeKind::ValueLen, 16),
        Attribute::bytes(AttributeKind::Label, "other"),
    ])?;
    assert!(matches!(
        token.generate_key(session, &Mechanism::AesKeyGen, &with_label, "label", false),
        Err(HError::DuplicateAttribute(AttributeKind::Label))
    ));

    let with_private = AttributeTemplate::build([Attribute::bool(AttributeKind::Private, true)])?;
    assert!(matches!(
        token.generate_key(session, &Mechanism::AesKeyGen, &with_private, "label", false),
        Err(HError::DuplicateAttribute(AttributeKind::Private))
    ));

    let des3_with_len = AttributeTemplate::build([Attribute::ulong(AttributeKind::ValueLen, 24)])?;
    assert!(matches!(
        token.generate_key(session, &Mechanism::Des3KeyGen, &des3_with_len, "des3", false),
        Err(HError::AttributeNotApplicable {
            attribute: AttributeKind::ValueLen,
            mechanism: "CKM_DES3_KEY_GEN"
        })
    ));

    assert!(matches!(
        token.generate_key(session, &Mechanism::AesCbc { iv: IV }, &des3_with_len, "x", false),
        Err(HError::MechanismMismatch { .. })
    ));
    token.close_session(session)?;
    Ok(())
}

#[test]
fn key_generation_failures_carry_the_module_code() -> HResult<()> {
    log_init("debug");
    let token = soft_token()?;
    let session = token.open_session(1, rw_serial())?;

    let des3 = AttributeTemplate::build([Attribute::bool(AttributeKind::Encrypt, true)])?;
    let err = token
        .generate_key(session, &Mechanism::Des3KeyGen, &des3, "des3", false)
        .unwrap_err();
    assert!(matches!(err, HError::KeyGenFailed { .. }));
    assert_eq!(err.rv(), Some(CKR_MECHANISM_INVALID));

    let odd_len = AttributeTemplate::build([Attribute::ulong(AttributeKind::ValueLen, 20)])?;
    let err = token
        .generate_key(session, &Mechanism::AesKeyGen, &odd_len, "aes", false)
        .unwrap_err();
    assert_eq!(err.rv(), Some(CKR_ATTRIBUTE_VALUE_INVALID));

    let no_len = AttributeTemplate::build([Attribute::bool(AttributeKind::Token, false)])?;
    let err = token
        .generate_key(session, &Mechanism::AesKeyGen, &no_len, "aes", false)
        .unwrap_err();
    assert!(matches!(
        err,
        HError::KeyGenFailed {
            operation: "C_GenerateKey",
            rv: CKR_TEMPLATE_INCOMPLETE
        }
    ));
    token.close_session(session)?;
    Ok(())
}
