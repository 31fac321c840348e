use pkcs11_sys::{
    CK_ATTRIBUTE, CK_KEY_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_SLOT_ID, CK_ULONG,
    CKA_CLASS, CKA_KEY_TYPE, CKO_SECRET_KEY,
};
use tracing::debug;

use crate::{
    Attribute, AttributeKind, AttributeTemplate, HError, HResult, Mechanism, MechanismKind,
    session::Session,
};

/// A key object held by the token.
///
/// Only the object handle and the slot it lives in are known here; the key
/// material never leaves the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle {
    slot_id: CK_SLOT_ID,
    object: CK_OBJECT_HANDLE,
}

impl KeyHandle {
    /// Refer to an existing object of the token in `slot_id`.
    #[must_use]
    pub const fn from_raw(slot_id: CK_SLOT_ID, object: CK_OBJECT_HANDLE) -> Self {
        Self { slot_id, object }
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    #[must_use]
    pub const fn object(&self) -> CK_OBJECT_HANDLE {
        self.object
    }
}

fn ulong_attribute(attribute_type: CK_ULONG, value: &mut CK_ULONG) -> HResult<CK_ATTRIBUTE> {
    Ok(CK_ATTRIBUTE {
        type_: attribute_type,
        pValue: (value as *mut CK_ULONG).cast(),
        ulValueLen: CK_ULONG::try_from(size_of::<CK_ULONG>())?,
    })
}

impl Session {
    /// Generate a secret key from `template`, adding the object class, the key
    /// type of the mechanism, the label and the private flag.
    pub(crate) fn generate_key(
        &self,
        mechanism: &Mechanism,
        template: &AttributeTemplate,
        label: &str,
        is_private: bool,
    ) -> HResult<KeyHandle> {
        mechanism.ensure_kind("C_GenerateKey", MechanismKind::KeyGeneration)?;
        for kind in [AttributeKind::Label, AttributeKind::Private] {
            if template.contains(kind) {
                return Err(HError::DuplicateAttribute(kind));
            }
        }
        if let Some(attribute) = template.iter().find(|a| !mechanism.accepts(a.kind())) {
            return Err(HError::AttributeNotApplicable {
                attribute: attribute.kind(),
                mechanism: mechanism.name(),
            });
        }
        let key_type: CK_KEY_TYPE = mechanism.key_type().ok_or(HError::MechanismMismatch {
            operation: "C_GenerateKey",
            mechanism: mechanism.name(),
        })?;

        let label = Attribute::bytes(AttributeKind::Label, label.as_bytes());
        let private = Attribute::bool(AttributeKind::Private, is_private);
        let mut class: CK_OBJECT_CLASS = CKO_SECRET_KEY;
        let mut key_type = key_type;
        let mut raw_template = vec![
            ulong_attribute(CKA_CLASS, &mut class)?,
            ulong_attribute(CKA_KEY_TYPE, &mut key_type)?,
        ];
        raw_template.extend(template.to_raw()?);
        raw_template.push(label.as_raw()?);
        raw_template.push(private.as_raw()?);
        let template_len = CK_ULONG::try_from(raw_template.len())?;

        let object = mechanism.with_raw(|raw_mechanism| {
            let mut object: CK_OBJECT_HANDLE = 0;
            hsm_call!(
                self.hsm,
                KeyGenFailed,
                C_GenerateKey,
                self.handle,
                raw_mechanism,
                raw_template.as_mut_ptr(),
                template_len,
                &raw mut object
            );
            Ok(object)
        })?;
        debug!(
            "generated {} key {object} on slot {}",
            mechanism.name(),
            self.slot_id
        );
        Ok(KeyHandle::from_raw(self.slot_id, object))
    }
}
