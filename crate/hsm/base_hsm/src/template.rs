use std::fmt::{self, Display};

use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_ULONG, CKA_DECRYPT,
    CKA_DERIVE, CKA_ENCRYPT, CKA_EXTRACTABLE, CKA_ID, CKA_LABEL, CKA_MODIFIABLE, CKA_PRIVATE,
    CKA_SENSITIVE, CKA_SIGN, CKA_TOKEN, CKA_UNWRAP, CKA_VALUE_LEN, CKA_VERIFY, CKA_WRAP,
};

use crate::{HError, HResult};

const CK_TRUE: CK_BBOOL = 1;
const CK_FALSE: CK_BBOOL = 0;

/// Attribute types that may appear in a key generation template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Token,
    Private,
    Label,
    Id,
    Sensitive,
    Extractable,
    Modifiable,
    Encrypt,
    Decrypt,
    Wrap,
    Unwrap,
    Sign,
    Verify,
    Derive,
    ValueLen,
}

impl AttributeKind {
    #[must_use]
    pub const fn attribute_type(self) -> CK_ATTRIBUTE_TYPE {
        match self {
            Self::Token => CKA_TOKEN,
            Self::Private => CKA_PRIVATE,
            Self::Label => CKA_LABEL,
            Self::Id => CKA_ID,
            Self::Sensitive => CKA_SENSITIVE,
            Self::Extractable => CKA_EXTRACTABLE,
            Self::Modifiable => CKA_MODIFIABLE,
            Self::Encrypt => CKA_ENCRYPT,
            Self::Decrypt => CKA_DECRYPT,
            Self::Wrap => CKA_WRAP,
            Self::Unwrap => CKA_UNWRAP,
            Self::Sign => CKA_SIGN,
            Self::Verify => CKA_VERIFY,
            Self::Derive => CKA_DERIVE,
            Self::ValueLen => CKA_VALUE_LEN,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Token => "CKA_TOKEN",
            Self::Private => "CKA_PRIVATE",
            Self::Label => "CKA_LABEL",
            Self::Id => "CKA_ID",
            Self::Sensitive => "CKA_SENSITIVE",
            Self::Extractable => "CKA_EXTRACTABLE",
            Self::Modifiable => "CKA_MODIFIABLE",
            Self::Encrypt => "CKA_ENCRYPT",
            Self::Decrypt => "CKA_DECRYPT",
            Self::Wrap => "CKA_WRAP",
            Self::Unwrap => "CKA_UNWRAP",
            Self::Sign => "CKA_SIGN",
            Self::Verify => "CKA_VERIFY",
            Self::Derive => "CKA_DERIVE",
            Self::ValueLen => "CKA_VALUE_LEN",
        }
    }
}

impl Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed attribute with its encoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    kind: AttributeKind,
    value: Vec<u8>,
}

impl Attribute {
    #[must_use]
    pub const fn new(kind: AttributeKind, value: Vec<u8>) -> Self {
        Self { kind, value }
    }

    #[must_use]
    pub fn bool(kind: AttributeKind, value: bool) -> Self {
        let value: CK_BBOOL = if value { CK_TRUE } else { CK_FALSE };
        Self::new(kind, vec![value])
    }

    /// A `CK_ULONG` attribute, encoded in the platform's native byte order.
    #[must_use]
    pub fn ulong(kind: AttributeKind, value: CK_ULONG) -> Self {
        Self::new(kind, value.to_ne_bytes().to_vec())
    }

    #[must_use]
    pub fn bytes(kind: AttributeKind, value: impl Into<Vec<u8>>) -> Self {
        Self::new(kind, value.into())
    }

    #[must_use]
    pub const fn kind(&self) -> AttributeKind {
        self.kind
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Borrow the attribute as a raw `CK_ATTRIBUTE`.
    ///
    /// The returned structure points into `self` and must not outlive it.
    pub(crate) fn as_raw(&self) -> HResult<CK_ATTRIBUTE> {
        Ok(CK_ATTRIBUTE {
            type_: self.kind.attribute_type(),
            pValue: self.value.as_ptr().cast_mut().cast(),
            ulValueLen: CK_ULONG::try_from(self.value.len())?,
        })
    }
}

impl From<(AttributeKind, Vec<u8>)> for Attribute {
    fn from((kind, value): (AttributeKind, Vec<u8>)) -> Self {
        Self::new(kind, value)
    }
}

/// An ordered set of attributes in which each type appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeTemplate {
    attributes: Vec<Attribute>,
}

impl AttributeTemplate {
    /// Build a template, keeping the given order.
    ///
    /// Fails with [`HError::DuplicateAttribute`] when a type appears twice.
    pub fn build<I>(attributes: I) -> HResult<Self>
    where
        I: IntoIterator,
        I::Item: Into<Attribute>,
    {
        let mut template = Self::default();
        for attribute in attributes {
            template.push(attribute.into())?;
        }
        Ok(template)
    }

    pub(crate) fn push(&mut self, attribute: Attribute) -> HResult<()> {
        if self.contains(attribute.kind) {
            return Err(HError::DuplicateAttribute(attribute.kind));
        }
        self.attributes.push(attribute);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, kind: AttributeKind) -> bool {
        self.attributes.iter().any(|a| a.kind == kind)
    }

    #[must_use]
    pub fn get(&self, kind: AttributeKind) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub(crate) fn to_raw(&self) -> HResult<Vec<CK_ATTRIBUTE>> {
        self.attributes.iter().map(Attribute::as_raw).collect()
    }
}

impl<'a> IntoIterator for &'a AttributeTemplate {
    type IntoIter = std::slice::Iter<'a, Attribute>;
    type Item = &'a Attribute;

    fn into_iter(self) -> Self::IntoIter {
        self.attributes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_keeps_order() {
        let template = AttributeTemplate::build([
            Attribute::bool(AttributeKind::Encrypt, true),
            Attribute::ulong(AttributeKind::ValueLen, 32),
            Attribute::bool(AttributeKind::Decrypt, true),
        ])
        .unwrap();
        let kinds: Vec<_> = template.iter().map(Attribute::kind).collect();
        assert_eq!(
            kinds,
            vec![AttributeKind::Encrypt, AttributeKind::ValueLen, AttributeKind::Decrypt]
        );
        assert_eq!(template.len(), 3);
    }

    #[test]
    fn duplicate_type_is_rejected() {
        let err = AttributeTemplate::build([
            Attribute::bool(AttributeKind::Sign, true),
            Attribute::bool(AttributeKind::Sign, false),
        ])
        .unwrap_err();
        assert!(matches!(err, HError::DuplicateAttribute(AttributeKind::Sign)));
    }

    #[test]
    fn encodings() {
        assert_eq!(Attribute::bool(AttributeKind::Token, true).value(), &[CK_TRUE]);
        assert_eq!(Attribute::bool(AttributeKind::Token, false).value(), &[CK_FALSE]);
        let len = Attribute::ulong(AttributeKind::ValueLen, 24);
        assert_eq!(len.value(), &CK_ULONG::to_ne_bytes(24));
        let label = Attribute::from((AttributeKind::Label, b"abc".to_vec()));
        assert_eq!(label.value(), b"abc");
    }

    #[test]
    fn raw_view_points_into_the_template() {
        let template =
            AttributeTemplate::build([Attribute::bytes(AttributeKind::Id, vec![1_u8, 2, 3])])
                .unwrap();
        let raw = template.to_raw().unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].type_, CKA_ID);
        assert_eq!(raw[0].ulValueLen, 3);
        assert_eq!(
            raw[0].pValue.cast_const(),
            template.get(AttributeKind::Id).unwrap().value().as_ptr().cast()
        );
    }

    #[test]
    fn empty_template() {
        let template = AttributeTemplate::build(Vec::<Attribute>::new()).unwrap();
        assert!(template.is_empty());
        assert!(template.get(AttributeKind::Label).is_none());
    }
}
