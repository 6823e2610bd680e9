// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::{collections::BTreeMap, fmt};

use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_FALSE, CK_KEY_TYPE, CK_OBJECT_CLASS, CK_TRUE, CK_ULONG,
    CKA_ALWAYS_SENSITIVE, CKA_APPLICATION, CKA_CLASS, CKA_COEFFICIENT, CKA_DECRYPT, CKA_ENCRYPT,
    CKA_EXPONENT_1, CKA_EXPONENT_2, CKA_EXTRACTABLE, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_LOCAL,
    CKA_MODIFIABLE, CKA_MODULUS, CKA_MODULUS_BITS, CKA_NEVER_EXTRACTABLE, CKA_PRIME_1,
    CKA_PRIME_2, CKA_PRIVATE, CKA_PRIVATE_EXPONENT, CKA_PUBLIC_EXPONENT, CKA_SENSITIVE, CKA_SIGN,
    CKA_SUBJECT, CKA_TOKEN, CKA_UNWRAP, CKA_VALUE, CKA_VALUE_LEN, CKA_VERIFY, CKA_WRAP, CKK_AES,
    CKK_DES2, CKK_DES3, CKK_GENERIC_SECRET, CKK_RSA, CKO_CERTIFICATE, CKO_DATA, CKO_PRIVATE_KEY,
    CKO_PUBLIC_KEY, CKO_SECRET_KEY,
};
use strum_macros::{Display, EnumIter};
use tracing::trace;
use zeroize::Zeroize;

use crate::{TokenError, TokenResult};

#[derive(Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, EnumIter)]
pub enum AttributeType {
    AlwaysSensitive,
    Application,
    Class,
    Coefficient,
    Decrypt,
    Encrypt,
    Exponent1,
    Exponent2,
    Extractable,
    Id,
    KeyType,
    Label,
    Local,
    Modifiable,
    Modulus,
    ModulusBits,
    NeverExtractable,
    Prime1,
    Prime2,
    Private,
    PrivateExponent,
    PublicExponent,
    Sensitive,
    Sign,
    Subject,
    Token,
    Unwrap,
    Value,
    ValueLen,
    Verify,
    Wrap,
}

impl AttributeType {
    /// Attributes carrying secret key material.
    ///
    /// They are never revealed for a key that is sensitive or not extractable,
    /// and their bytes are zeroized when the owning set is dropped.
    #[must_use]
    pub const fn is_sensitive_material(self) -> bool {
        matches!(
            self,
            Self::Value
                | Self::PrivateExponent
                | Self::Prime1
                | Self::Prime2
                | Self::Exponent1
                | Self::Exponent2
                | Self::Coefficient
        )
    }

    #[must_use]
    pub const fn is_boolean(self) -> bool {
        matches!(
            self,
            Self::AlwaysSensitive
                | Self::Decrypt
                | Self::Encrypt
                | Self::Extractable
                | Self::Local
                | Self::Modifiable
                | Self::NeverExtractable
                | Self::Private
                | Self::Sensitive
                | Self::Sign
                | Self::Token
                | Self::Unwrap
                | Self::Verify
                | Self::Wrap
        )
    }

    /// Whether this attribute is meaningful for objects of `class`.
    #[must_use]
    pub const fn applies_to(self, class: ObjectClass) -> bool {
        match self {
            Self::Class | Self::Token | Self::Private | Self::Modifiable | Self::Label => true,
            Self::Application => matches!(class, ObjectClass::Data),
            Self::Value => matches!(
                class,
                ObjectClass::Data | ObjectClass::Certificate | ObjectClass::SecretKey
            ),
            Self::Id | Self::Subject => !matches!(class, ObjectClass::Data),
            Self::KeyType | Self::Local => class.is_key(),
            Self::Sensitive | Self::Extractable | Self::AlwaysSensitive | Self::NeverExtractable => {
                matches!(class, ObjectClass::SecretKey | ObjectClass::PrivateKey)
            }
            Self::Encrypt | Self::Verify | Self::Wrap => {
                matches!(class, ObjectClass::SecretKey | ObjectClass::PublicKey)
            }
            Self::Decrypt | Self::Sign | Self::Unwrap => {
                matches!(class, ObjectClass::SecretKey | ObjectClass::PrivateKey)
            }
            Self::ValueLen => matches!(class, ObjectClass::SecretKey),
            Self::Modulus | Self::PublicExponent => {
                matches!(class, ObjectClass::PublicKey | ObjectClass::PrivateKey)
            }
            Self::ModulusBits => matches!(class, ObjectClass::PublicKey),
            Self::PrivateExponent
            | Self::Prime1
            | Self::Prime2
            | Self::Exponent1
            | Self::Exponent2
            | Self::Coefficient => matches!(class, ObjectClass::PrivateKey),
        }
    }
}

impl TryFrom<CK_ATTRIBUTE_TYPE> for AttributeType {
    type Error = TokenError;

    fn try_from(type_: CK_ATTRIBUTE_TYPE) -> TokenResult<Self> {
        match type_ {
            CKA_ALWAYS_SENSITIVE => Ok(Self::AlwaysSensitive),
            CKA_APPLICATION => Ok(Self::Application),
            CKA_CLASS => Ok(Self::Class),
            CKA_COEFFICIENT => Ok(Self::Coefficient),
            CKA_DECRYPT => Ok(Self::Decrypt),
            CKA_ENCRYPT => Ok(Self::Encrypt),
            CKA_EXPONENT_1 => Ok(Self::Exponent1),
            CKA_EXPONENT_2 => Ok(Self::Exponent2),
            CKA_EXTRACTABLE => Ok(Self::Extractable),
            CKA_ID => Ok(Self::Id),
            CKA_KEY_TYPE => Ok(Self::KeyType),
            CKA_LABEL => Ok(Self::Label),
            CKA_LOCAL => Ok(Self::Local),
            CKA_MODIFIABLE => Ok(Self::Modifiable),
            CKA_MODULUS => Ok(Self::Modulus),
            CKA_MODULUS_BITS => Ok(Self::ModulusBits),
            CKA_NEVER_EXTRACTABLE => Ok(Self::NeverExtractable),
            CKA_PRIME_1 => Ok(Self::Prime1),
            CKA_PRIME_2 => Ok(Self::Prime2),
            CKA_PRIVATE => Ok(Self::Private),
            CKA_PRIVATE_EXPONENT => Ok(Self::PrivateExponent),
            CKA_PUBLIC_EXPONENT => Ok(Self::PublicExponent),
            CKA_SENSITIVE => Ok(Self::Sensitive),
            CKA_SIGN => Ok(Self::Sign),
            CKA_SUBJECT => Ok(Self::Subject),
            CKA_TOKEN => Ok(Self::Token),
            CKA_UNWRAP => Ok(Self::Unwrap),
            CKA_VALUE => Ok(Self::Value),
            CKA_VALUE_LEN => Ok(Self::ValueLen),
            CKA_VERIFY => Ok(Self::Verify),
            CKA_WRAP => Ok(Self::Wrap),
            _ => Err(TokenError::AttributeTypeInvalid(type_)),
        }
    }
}

impl From<AttributeType> for CK_ATTRIBUTE_TYPE {
    fn from(attribute_type: AttributeType) -> Self {
        match attribute_type {
            AttributeType::AlwaysSensitive => CKA_ALWAYS_SENSITIVE,
            AttributeType::Application => CKA_APPLICATION,
            AttributeType::Class => CKA_CLASS,
            AttributeType::Coefficient => CKA_COEFFICIENT,
            AttributeType::Decrypt => CKA_DECRYPT,
            AttributeType::Encrypt => CKA_ENCRYPT,
            AttributeType::Exponent1 => CKA_EXPONENT_1,
            AttributeType::Exponent2 => CKA_EXPONENT_2,
            AttributeType::Extractable => CKA_EXTRACTABLE,
            AttributeType::Id => CKA_ID,
            AttributeType::KeyType => CKA_KEY_TYPE,
            AttributeType::Label => CKA_LABEL,
            AttributeType::Local => CKA_LOCAL,
            AttributeType::Modifiable => CKA_MODIFIABLE,
            AttributeType::Modulus => CKA_MODULUS,
            AttributeType::ModulusBits => CKA_MODULUS_BITS,
            AttributeType::NeverExtractable => CKA_NEVER_EXTRACTABLE,
            AttributeType::Prime1 => CKA_PRIME_1,
            AttributeType::Prime2 => CKA_PRIME_2,
            AttributeType::Private => CKA_PRIVATE,
            AttributeType::PrivateExponent => CKA_PRIVATE_EXPONENT,
            AttributeType::PublicExponent => CKA_PUBLIC_EXPONENT,
            AttributeType::Sensitive => CKA_SENSITIVE,
            AttributeType::Sign => CKA_SIGN,
            AttributeType::Subject => CKA_SUBJECT,
            AttributeType::Token => CKA_TOKEN,
            AttributeType::Unwrap => CKA_UNWRAP,
            AttributeType::Value => CKA_VALUE,
            AttributeType::ValueLen => CKA_VALUE_LEN,
            AttributeType::Verify => CKA_VERIFY,
            AttributeType::Wrap => CKA_WRAP,
        }
    }
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ObjectClass {
    Data,
    Certificate,
    PublicKey,
    PrivateKey,
    SecretKey,
}

impl ObjectClass {
    #[must_use]
    pub const fn is_key(self) -> bool {
        matches!(self, Self::PublicKey | Self::PrivateKey | Self::SecretKey)
    }
}

impl TryFrom<CK_OBJECT_CLASS> for ObjectClass {
    type Error = TokenError;

    fn try_from(class: CK_OBJECT_CLASS) -> TokenResult<Self> {
        match class {
            CKO_DATA => Ok(Self::Data),
            CKO_CERTIFICATE => Ok(Self::Certificate),
            CKO_PUBLIC_KEY => Ok(Self::PublicKey),
            CKO_PRIVATE_KEY => Ok(Self::PrivateKey),
            CKO_SECRET_KEY => Ok(Self::SecretKey),
            _ => Err(TokenError::AttributeValueInvalid(
                AttributeType::Class,
                format!("unsupported object class {class:#x}"),
            )),
        }
    }
}

impl From<ObjectClass> for CK_OBJECT_CLASS {
    fn from(class: ObjectClass) -> Self {
        match class {
            ObjectClass::Data => CKO_DATA,
            ObjectClass::Certificate => CKO_CERTIFICATE,
            ObjectClass::PublicKey => CKO_PUBLIC_KEY,
            ObjectClass::PrivateKey => CKO_PRIVATE_KEY,
            ObjectClass::SecretKey => CKO_SECRET_KEY,
        }
    }
}

#[derive(Debug, Display, PartialEq, Eq, Clone, Copy, Hash)]
pub enum KeyType {
    Rsa,
    Des2,
    Des3,
    Aes,
    GenericSecret,
}

impl KeyType {
    #[must_use]
    pub const fn is_secret(self) -> bool {
        !matches!(self, Self::Rsa)
    }

    /// Check a raw secret key value has a length this key type accepts.
    pub fn check_value_len(self, len: usize) -> TokenResult<()> {
        let valid = match self {
            Self::Des2 => len == 16,
            Self::Des3 => len == 24,
            Self::Aes => matches!(len, 16 | 24 | 32),
            Self::GenericSecret => len > 0,
            Self::Rsa => false,
        };
        if valid {
            Ok(())
        } else {
            Err(TokenError::AttributeValueInvalid(
                AttributeType::Value,
                format!("{len} bytes is not a valid length for a {self} key"),
            ))
        }
    }
}

impl TryFrom<CK_KEY_TYPE> for KeyType {
    type Error = TokenError;

    fn try_from(key_type: CK_KEY_TYPE) -> TokenResult<Self> {
        match key_type {
            CKK_RSA => Ok(Self::Rsa),
            CKK_DES2 => Ok(Self::Des2),
            CKK_DES3 => Ok(Self::Des3),
            CKK_AES => Ok(Self::Aes),
            CKK_GENERIC_SECRET => Ok(Self::GenericSecret),
            _ => Err(TokenError::AttributeValueInvalid(
                AttributeType::KeyType,
                format!("unsupported key type {key_type:#x}"),
            )),
        }
    }
}

impl From<KeyType> for CK_KEY_TYPE {
    fn from(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Rsa => CKK_RSA,
            KeyType::Des2 => CKK_DES2,
            KeyType::Des3 => CKK_DES3,
            KeyType::Aes => CKK_AES,
            KeyType::GenericSecret => CKK_GENERIC_SECRET,
        }
    }
}

#[derive(PartialEq, Eq, Clone)]
pub enum Attribute {
    AlwaysSensitive(bool),
    Application(String),
    Class(ObjectClass),
    Coefficient(Vec<u8>),
    Decrypt(bool),
    Encrypt(bool),
    Exponent1(Vec<u8>),
    Exponent2(Vec<u8>),
    Extractable(bool),
    Id(Vec<u8>),
    KeyType(KeyType),
    Label(String),
    Local(bool),
    Modifiable(bool),
    Modulus(Vec<u8>),
    ModulusBits(CK_ULONG),
    NeverExtractable(bool),
    Prime1(Vec<u8>),
    Prime2(Vec<u8>),
    Private(bool),
    PrivateExponent(Vec<u8>),
    PublicExponent(Vec<u8>),
    Sensitive(bool),
    Sign(bool),
    Subject(Vec<u8>),
    Token(bool),
    Unwrap(bool),
    Value(Vec<u8>),
    ValueLen(CK_ULONG),
    Verify(bool),
    Wrap(bool),
}

impl Attribute {
    #[must_use]
    pub const fn attribute_type(&self) -> AttributeType {
        match self {
            Self::AlwaysSensitive(_) => AttributeType::AlwaysSensitive,
            Self::Application(_) => AttributeType::Application,
            Self::Class(_) => AttributeType::Class,
            Self::Coefficient(_) => AttributeType::Coefficient,
            Self::Decrypt(_) => AttributeType::Decrypt,
            Self::Encrypt(_) => AttributeType::Encrypt,
            Self::Exponent1(_) => AttributeType::Exponent1,
            Self::Exponent2(_) => AttributeType::Exponent2,
            Self::Extractable(_) => AttributeType::Extractable,
            Self::Id(_) => AttributeType::Id,
            Self::KeyType(_) => AttributeType::KeyType,
            Self::Label(_) => AttributeType::Label,
            Self::Local(_) => AttributeType::Local,
            Self::Modifiable(_) => AttributeType::Modifiable,
            Self::Modulus(_) => AttributeType::Modulus,
            Self::ModulusBits(_) => AttributeType::ModulusBits,
            Self::NeverExtractable(_) => AttributeType::NeverExtractable,
            Self::Prime1(_) => AttributeType::Prime1,
            Self::Prime2(_) => AttributeType::Prime2,
            Self::Private(_) => AttributeType::Private,
            Self::PrivateExponent(_) => AttributeType::PrivateExponent,
            Self::PublicExponent(_) => AttributeType::PublicExponent,
            Self::Sensitive(_) => AttributeType::Sensitive,
            Self::Sign(_) => AttributeType::Sign,
            Self::Subject(_) => AttributeType::Subject,
            Self::Token(_) => AttributeType::Token,
            Self::Unwrap(_) => AttributeType::Unwrap,
            Self::Value(_) => AttributeType::Value,
            Self::ValueLen(_) => AttributeType::ValueLen,
            Self::Verify(_) => AttributeType::Verify,
            Self::Wrap(_) => AttributeType::Wrap,
        }
    }

    /// Build a boolean attribute; `None` if `attribute_type` is not a boolean.
    #[must_use]
    pub const fn from_bool(attribute_type: AttributeType, value: bool) -> Option<Self> {
        Some(match attribute_type {
            AttributeType::AlwaysSensitive => Self::AlwaysSensitive(value),
            AttributeType::Decrypt => Self::Decrypt(value),
            AttributeType::Encrypt => Self::Encrypt(value),
            AttributeType::Extractable => Self::Extractable(value),
            AttributeType::Local => Self::Local(value),
            AttributeType::Modifiable => Self::Modifiable(value),
            AttributeType::NeverExtractable => Self::NeverExtractable(value),
            AttributeType::Private => Self::Private(value),
            AttributeType::Sensitive => Self::Sensitive(value),
            AttributeType::Sign => Self::Sign(value),
            AttributeType::Token => Self::Token(value),
            AttributeType::Unwrap => Self::Unwrap(value),
            AttributeType::Verify => Self::Verify(value),
            AttributeType::Wrap => Self::Wrap(value),
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::AlwaysSensitive(b)
            | Self::Decrypt(b)
            | Self::Encrypt(b)
            | Self::Extractable(b)
            | Self::Local(b)
            | Self::Modifiable(b)
            | Self::NeverExtractable(b)
            | Self::Private(b)
            | Self::Sensitive(b)
            | Self::Sign(b)
            | Self::Token(b)
            | Self::Unwrap(b)
            | Self::Verify(b)
            | Self::Wrap(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Coefficient(bytes)
            | Self::Exponent1(bytes)
            | Self::Exponent2(bytes)
            | Self::Id(bytes)
            | Self::Modulus(bytes)
            | Self::Prime1(bytes)
            | Self::Prime2(bytes)
            | Self::PrivateExponent(bytes)
            | Self::PublicExponent(bytes)
            | Self::Subject(bytes)
            | Self::Value(bytes) => Some(bytes.as_slice()),
            Self::Application(s) | Self::Label(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_ulong(&self) -> Option<CK_ULONG> {
        match self {
            Self::ModulusBits(v) | Self::ValueLen(v) => Some(*v),
            _ => None,
        }
    }

    /// The PKCS#11 wire encoding of the value.
    #[must_use]
    pub fn as_raw_value(&self) -> Vec<u8> {
        if let Some(b) = self.as_bool() {
            let raw: CK_BBOOL = if b { CK_TRUE } else { CK_FALSE };
            return vec![raw];
        }
        match self {
            Self::Class(class) => CK_OBJECT_CLASS::from(*class).to_ne_bytes().to_vec(),
            Self::KeyType(key_type) => CK_KEY_TYPE::from(*key_type).to_ne_bytes().to_vec(),
            Self::ModulusBits(v) | Self::ValueLen(v) => v.to_ne_bytes().to_vec(),
            _ => self.as_bytes().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }

    /// Decode an attribute from its PKCS#11 wire encoding.
    pub fn try_from_raw(attribute_type: AttributeType, raw: &[u8]) -> TokenResult<Self> {
        trace!("decoding attribute {attribute_type} from {} bytes", raw.len());
        let to_ulong = |raw: &[u8]| -> TokenResult<CK_ULONG> {
            let bytes: [u8; size_of::<CK_ULONG>()] = raw.try_into().map_err(|_| {
                TokenError::AttributeValueInvalid(
                    attribute_type,
                    format!("expected {} bytes, got {}", size_of::<CK_ULONG>(), raw.len()),
                )
            })?;
            Ok(CK_ULONG::from_ne_bytes(bytes))
        };
        let to_string = |raw: &[u8]| -> TokenResult<String> {
            String::from_utf8(raw.to_vec()).map_err(|e| {
                TokenError::AttributeValueInvalid(attribute_type, format!("not UTF-8: {e}"))
            })
        };
        if attribute_type.is_boolean() {
            let value = match raw {
                [b] => *b != CK_FALSE,
                _ => {
                    return Err(TokenError::AttributeValueInvalid(
                        attribute_type,
                        format!("a boolean is one byte, got {}", raw.len()),
                    ));
                }
            };
            return Self::from_bool(attribute_type, value).ok_or_else(|| {
                TokenError::AttributeValueInvalid(attribute_type, "not a boolean".to_owned())
            });
        }
        Ok(match attribute_type {
            AttributeType::Application => Self::Application(to_string(raw)?),
            AttributeType::Label => Self::Label(to_string(raw)?),
            AttributeType::Class => Self::Class(ObjectClass::try_from(to_ulong(raw)?)?),
            AttributeType::KeyType => Self::KeyType(KeyType::try_from(to_ulong(raw)?)?),
            AttributeType::ModulusBits => Self::ModulusBits(to_ulong(raw)?),
            AttributeType::ValueLen => Self::ValueLen(to_ulong(raw)?),
            AttributeType::Coefficient => Self::Coefficient(raw.to_vec()),
            AttributeType::Exponent1 => Self::Exponent1(raw.to_vec()),
            AttributeType::Exponent2 => Self::Exponent2(raw.to_vec()),
            AttributeType::Id => Self::Id(raw.to_vec()),
            AttributeType::Modulus => Self::Modulus(raw.to_vec()),
            AttributeType::Prime1 => Self::Prime1(raw.to_vec()),
            AttributeType::Prime2 => Self::Prime2(raw.to_vec()),
            AttributeType::PrivateExponent => Self::PrivateExponent(raw.to_vec()),
            AttributeType::PublicExponent => Self::PublicExponent(raw.to_vec()),
            AttributeType::Subject => Self::Subject(raw.to_vec()),
            AttributeType::Value => Self::Value(raw.to_vec()),
            _ => {
                return Err(TokenError::AttributeValueInvalid(
                    attribute_type,
                    "no raw decoding for this attribute".to_owned(),
                ));
            }
        })
    }

    fn zeroize_material(&mut self) {
        match self {
            Self::Coefficient(bytes)
            | Self::Exponent1(bytes)
            | Self::Exponent2(bytes)
            | Self::Prime1(bytes)
            | Self::Prime2(bytes)
            | Self::PrivateExponent(bytes)
            | Self::Value(bytes) => bytes.zeroize(),
            _ => {}
        }
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attribute_type = self.attribute_type();
        if attribute_type.is_sensitive_material() {
            let len = self.as_bytes().map_or(0, <[u8]>::len);
            return write!(f, "{attribute_type}(<{len} bytes redacted>)");
        }
        match self {
            Self::Class(class) => write!(f, "Class({class})"),
            Self::KeyType(key_type) => write!(f, "KeyType({key_type})"),
            Self::Application(s) | Self::Label(s) => write!(f, "{attribute_type}({s:?})"),
            Self::ModulusBits(v) | Self::ValueLen(v) => write!(f, "{attribute_type}({v})"),
            _ => match (self.as_bool(), self.as_bytes()) {
                (Some(b), _) => write!(f, "{attribute_type}({b})"),
                (None, Some(bytes)) => write!(f, "{attribute_type}({})", hex::encode(bytes)),
                (None, None) => write!(f, "{attribute_type}"),
            },
        }
    }
}

/// Typed attribute store, one value per attribute type.
///
/// Iteration follows the declaration order of [`AttributeType`]. Key material held
/// in the set is zeroized on drop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet(BTreeMap<AttributeType, Attribute>);

impl AttributeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, attribute_type: AttributeType) -> Option<&Attribute> {
        self.0.get(&attribute_type)
    }

    #[must_use]
    pub fn contains(&self, attribute_type: AttributeType) -> bool {
        self.0.contains_key(&attribute_type)
    }

    /// Value of a boolean attribute, `false` when absent.
    #[must_use]
    pub fn get_bool(&self, attribute_type: AttributeType) -> bool {
        self.get_bool_or(attribute_type, false)
    }

    #[must_use]
    pub fn get_bool_or(&self, attribute_type: AttributeType, default: bool) -> bool {
        self.get(attribute_type)
            .and_then(Attribute::as_bool)
            .unwrap_or(default)
    }

    #[must_use]
    pub fn get_bytes(&self, attribute_type: AttributeType) -> Option<&[u8]> {
        self.get(attribute_type).and_then(Attribute::as_bytes)
    }

    #[must_use]
    pub fn get_ulong(&self, attribute_type: AttributeType) -> Option<CK_ULONG> {
        self.get(attribute_type).and_then(Attribute::as_ulong)
    }

    #[must_use]
    pub fn class(&self) -> Option<ObjectClass> {
        match self.get(AttributeType::Class) {
            Some(Attribute::Class(class)) => Some(*class),
            _ => None,
        }
    }

    #[must_use]
    pub fn key_type(&self) -> Option<KeyType> {
        match self.get(AttributeType::KeyType) {
            Some(Attribute::KeyType(key_type)) => Some(*key_type),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.values()
    }

    /// Set an attribute, replacing any previous value of the same type.
    ///
    /// Once the set declares a CLASS, attributes which do not apply to that class
    /// are refused with [`TokenError::InvalidAttribute`]. CLASS and KEY_TYPE cannot be
    /// changed to a different value once present.
    pub fn set(&mut self, attribute: Attribute) -> TokenResult<()> {
        let attribute_type = attribute.attribute_type();
        if matches!(attribute_type, AttributeType::Class | AttributeType::KeyType) {
            if let Some(current) = self.get(attribute_type) {
                if *current != attribute {
                    return Err(TokenError::AttributeReadOnly(attribute_type));
                }
            }
        }
        let class = match &attribute {
            Attribute::Class(class) => Some(*class),
            _ => self.class(),
        };
        if let Some(class) = class {
            if !attribute_type.applies_to(class) {
                return Err(TokenError::InvalidAttribute(format!(
                    "{attribute_type} is not valid for a {class} object"
                )));
            }
            if let Attribute::Class(class) = attribute {
                self.validate_for(class)?;
            }
        }
        self.insert(attribute);
        Ok(())
    }

    /// Insert without applicability checks.
    pub(crate) fn insert(&mut self, attribute: Attribute) {
        if let Some(mut previous) = self.0.insert(attribute.attribute_type(), attribute) {
            previous.zeroize_material();
        }
    }

    /// Builder form of [`AttributeSet::insert`].
    #[must_use]
    pub fn with(mut self, attribute: Attribute) -> Self {
        self.insert(attribute);
        self
    }

    /// Check every attribute of the set applies to `class`.
    pub fn validate_for(&self, class: ObjectClass) -> TokenResult<()> {
        match self.0.keys().find(|t| !t.applies_to(class)) {
            Some(attribute_type) => Err(TokenError::InvalidAttribute(format!(
                "{attribute_type} is not valid for a {class} object"
            ))),
            None => Ok(()),
        }
    }

    /// True when every attribute of `query` is present here with an equal value.
    #[must_use]
    pub fn matches(&self, query: &Self) -> bool {
        query
            .0
            .iter()
            .all(|(attribute_type, expected)| self.0.get(attribute_type) == Some(expected))
    }

    /// A new set holding the attributes of `self` overridden by those of `other`.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for attribute in other.iter() {
            merged.insert(attribute.clone());
        }
        merged
    }
}

impl Drop for AttributeSet {
    fn drop(&mut self) {
        for attribute in self.0.values_mut() {
            attribute.zeroize_material();
        }
    }
}

impl From<Vec<Attribute>> for AttributeSet {
    fn from(attributes: Vec<Attribute>) -> Self {
        attributes.into_iter().collect()
    }
}

impl<const N: usize> From<[Attribute; N]> for AttributeSet {
    fn from(attributes: [Attribute; N]) -> Self {
        attributes.into_iter().collect()
    }
}

impl FromIterator<Attribute> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        let mut set = Self::new();
        for attribute in iter {
            set.insert(attribute);
        }
        set
    }
}

#[expect(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use cryptoki_sys::{CKK_DES2, CKO_SECRET_KEY};
    use strum::IntoEnumIterator;

    use super::*;

    fn des2_template() -> AttributeSet {
        AttributeSet::from([
            Attribute::Class(ObjectClass::SecretKey),
            Attribute::KeyType(KeyType::Des2),
            Attribute::Value(b"0123456789abcdef".to_vec()),
            Attribute::Encrypt(true),
            Attribute::Token(false),
        ])
    }

    #[test]
    fn raw_attribute_type_mapping() {
        for attribute_type in AttributeType::iter() {
            let raw = CK_ATTRIBUTE_TYPE::from(attribute_type);
            assert_eq!(AttributeType::try_from(raw).unwrap(), attribute_type);
        }
        let vendor_defined: CK_ATTRIBUTE_TYPE = 0x8000_0000;
        assert!(matches!(
            AttributeType::try_from(vendor_defined),
            Err(TokenError::AttributeTypeInvalid(0x8000_0000))
        ));
    }

    #[test]
    fn typed_accessors() {
        let set = des2_template();
        assert_eq!(set.class(), Some(ObjectClass::SecretKey));
        assert_eq!(set.key_type(), Some(KeyType::Des2));
        assert_eq!(set.get_bytes(AttributeType::Value), Some(&b"0123456789abcdef"[..]));
        assert!(set.get_bool(AttributeType::Encrypt));
        // absent booleans read as false
        assert!(!set.get_bool(AttributeType::Decrypt));
        assert!(set.get_bool_or(AttributeType::Extractable, true));
        assert_eq!(set.get_ulong(AttributeType::ValueLen), None);
    }

    #[test]
    fn set_refuses_attributes_foreign_to_the_class() {
        let mut set = des2_template();
        let err = set
            .set(Attribute::Modulus(vec![0xc3; 64]))
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidAttribute(_)));
        assert!(!set.contains(AttributeType::Modulus));

        // without a class, anything goes
        let mut query = AttributeSet::new();
        query.set(Attribute::Modulus(vec![1, 0, 1])).unwrap();
        query.set(Attribute::Value(vec![1])).unwrap();

        // a class is checked against what is already there
        assert!(matches!(
            query.set(Attribute::Class(ObjectClass::PublicKey)),
            Err(TokenError::InvalidAttribute(_))
        ));
    }

    #[test]
    fn class_and_key_type_do_not_change() {
        let mut set = des2_template();
        set.set(Attribute::Class(ObjectClass::SecretKey)).unwrap();
        assert!(matches!(
            set.set(Attribute::KeyType(KeyType::Aes)),
            Err(TokenError::AttributeReadOnly(AttributeType::KeyType))
        ));
        assert!(matches!(
            set.set(Attribute::Class(ObjectClass::Data)),
            Err(TokenError::AttributeReadOnly(AttributeType::Class))
        ));
    }

    #[test]
    fn partial_match_requires_equal_values() {
        let set = des2_template();
        assert!(set.matches(&AttributeSet::new()));
        assert!(set.matches(&AttributeSet::from([Attribute::Class(ObjectClass::SecretKey)])));
        assert!(set.matches(&AttributeSet::from([
            Attribute::KeyType(KeyType::Des2),
            Attribute::Encrypt(true),
        ])));
        assert!(!set.matches(&AttributeSet::from([Attribute::Encrypt(false)])));
        // an absent boolean does not match an explicit false
        assert!(!set.matches(&AttributeSet::from([Attribute::Decrypt(false)])));
    }

    #[test]
    fn merge_lets_the_other_set_win() {
        let defaults = AttributeSet::from([
            Attribute::Token(false),
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
        ]);
        let template = AttributeSet::from([Attribute::Sensitive(true), Attribute::Encrypt(true)]);
        let merged = defaults.merge(&template);
        assert_eq!(merged.len(), 4);
        assert!(merged.get_bool(AttributeType::Sensitive));
        assert!(merged.get_bool(AttributeType::Extractable));
        // the inputs are left untouched
        assert!(!defaults.get_bool(AttributeType::Sensitive));
        assert_eq!(template.len(), 2);
    }

    #[test]
    fn wire_encoding_keeps_types_and_lengths() {
        let modulus = [vec![0x00], vec![0xab; 95]].concat();
        let attribute = Attribute::Modulus(modulus.clone());
        let decoded =
            Attribute::try_from_raw(AttributeType::Modulus, &attribute.as_raw_value()).unwrap();
        assert_eq!(decoded.as_bytes().unwrap().len(), 96);
        assert_eq!(decoded, Attribute::Modulus(modulus));

        let class = Attribute::Class(ObjectClass::SecretKey).as_raw_value();
        assert_eq!(class, CKO_SECRET_KEY.to_ne_bytes().to_vec());
        assert_eq!(
            Attribute::try_from_raw(AttributeType::KeyType, &CKK_DES2.to_ne_bytes()).unwrap(),
            Attribute::KeyType(KeyType::Des2)
        );
        assert_eq!(Attribute::Sensitive(true).as_raw_value(), vec![CK_TRUE]);
        assert!(Attribute::try_from_raw(AttributeType::Sensitive, &[1, 0]).is_err());
    }

    #[test]
    fn debug_output_hides_key_material() {
        let rendered = format!("{:?}", des2_template());
        assert!(rendered.contains("Value(<16 bytes redacted>)"));
        assert!(!rendered.contains("0123456789abcdef"));
        assert!(!rendered.contains(&hex::encode(b"0123456789abcdef")));
    }
}
