// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::fmt;

use cryptoki_sys::{CK_OBJECT_HANDLE, CK_ULONG};
use tracing::{debug, warn};

use crate::{
    TokenError, TokenResult,
    core::attribute::{Attribute, AttributeSet, AttributeType, KeyType, ObjectClass},
    traits::{RsaPrivateKeyMaterial, RsaPublicKeyMaterial, SecretKeyMaterial, modulus_bits},
};

/// Opaque object handle; never zero, never reused while its slot lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHandle(CK_OBJECT_HANDLE);

impl ObjectHandle {
    pub(crate) const fn new(raw: CK_OBJECT_HANDLE) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> CK_OBJECT_HANDLE {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ObjectHandle> for CK_OBJECT_HANDLE {
    fn from(handle: ObjectHandle) -> Self {
        handle.0
    }
}

/// How an object came into existence; drives the LOCAL and ALWAYS_* attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectOrigin {
    Created,
    Generated,
    Unwrapped,
}

const USAGE_FLAGS: [AttributeType; 6] = [
    AttributeType::Encrypt,
    AttributeType::Decrypt,
    AttributeType::Sign,
    AttributeType::Verify,
    AttributeType::Wrap,
    AttributeType::Unwrap,
];

fn require(template: &AttributeSet, class: ObjectClass, attribute_type: AttributeType) -> TokenResult<()> {
    if template.contains(attribute_type) {
        Ok(())
    } else {
        Err(TokenError::TemplateIncomplete(format!(
            "{attribute_type} is required for a {class} object"
        )))
    }
}

fn check_material(template: &AttributeSet, class: ObjectClass, key_type: Option<KeyType>) -> TokenResult<()> {
    match class {
        ObjectClass::Data => {}
        ObjectClass::Certificate => require(template, class, AttributeType::Value)?,
        ObjectClass::SecretKey => {
            require(template, class, AttributeType::Value)?;
            if let (Some(key_type), Some(value)) = (key_type, template.get_bytes(AttributeType::Value)) {
                key_type.check_value_len(value.len())?;
            }
        }
        ObjectClass::PublicKey => {
            require(template, class, AttributeType::Modulus)?;
            require(template, class, AttributeType::PublicExponent)?;
        }
        ObjectClass::PrivateKey => {
            require(template, class, AttributeType::Modulus)?;
            require(template, class, AttributeType::PublicExponent)?;
            require(template, class, AttributeType::PrivateExponent)?;
        }
    }
    Ok(())
}

/// Validate a template and complete it with the default and derived attributes.
///
/// Material recovered by unwrapping or produced by a generator must already be in
/// the template. The template itself is left untouched.
pub(crate) fn build_attributes(template: &AttributeSet, origin: ObjectOrigin) -> TokenResult<AttributeSet> {
    let class = template
        .class()
        .ok_or_else(|| TokenError::TemplateIncomplete("CLASS is required".to_owned()))?;
    let key_type = template.key_type();
    if class.is_key() {
        match key_type {
            None => {
                return Err(TokenError::TemplateIncomplete(format!(
                    "KEY_TYPE is required for a {class} object"
                )));
            }
            Some(key_type) if key_type.is_secret() != (class == ObjectClass::SecretKey) => {
                return Err(TokenError::AttributeConflict(format!(
                    "a {class} cannot have key type {key_type}"
                )));
            }
            Some(_) => {}
        }
    } else if key_type.is_some() {
        return Err(TokenError::AttributeConflict(format!(
            "a {class} object has no key type"
        )));
    }
    template.validate_for(class)?;
    for derived in [AttributeType::AlwaysSensitive, AttributeType::NeverExtractable] {
        if template.contains(derived) {
            return Err(TokenError::AttributeReadOnly(derived));
        }
    }
    match (origin, template.get(AttributeType::Local)) {
        (ObjectOrigin::Generated, Some(Attribute::Local(false)))
        | (ObjectOrigin::Created | ObjectOrigin::Unwrapped, Some(Attribute::Local(true))) => {
            return Err(TokenError::AttributeConflict(format!(
                "LOCAL cannot be set by the caller for a {origin:?} object"
            )));
        }
        _ => {}
    }
    check_material(template, class, key_type)?;

    let mut defaults = AttributeSet::from([
        Attribute::Token(false),
        Attribute::Private(class == ObjectClass::PrivateKey),
        Attribute::Modifiable(true),
    ]);
    if class.is_key() {
        defaults.insert(Attribute::Local(origin == ObjectOrigin::Generated));
        for flag in USAGE_FLAGS.into_iter().filter(|f| f.applies_to(class)) {
            if let Some(attribute) = Attribute::from_bool(flag, false) {
                defaults.insert(attribute);
            }
        }
    }
    let holds_secret = matches!(class, ObjectClass::SecretKey | ObjectClass::PrivateKey);
    if holds_secret {
        defaults.insert(Attribute::Sensitive(false));
        defaults.insert(Attribute::Extractable(true));
    }
    let mut attributes = defaults.merge(template);

    if class == ObjectClass::SecretKey {
        let len = attributes
            .get_bytes(AttributeType::Value)
            .map_or(0, <[u8]>::len);
        let len = CK_ULONG::try_from(len)?;
        match attributes.get_ulong(AttributeType::ValueLen) {
            Some(declared) if declared != len => {
                return Err(TokenError::AttributeConflict(format!(
                    "VALUE_LEN is {declared} but the value is {len} bytes"
                )));
            }
            _ => attributes.insert(Attribute::ValueLen(len)),
        }
    }
    if class == ObjectClass::PublicKey {
        let bits = attributes
            .get_bytes(AttributeType::Modulus)
            .map_or(0, modulus_bits);
        let bits = CK_ULONG::try_from(bits)?;
        match attributes.get_ulong(AttributeType::ModulusBits) {
            Some(declared) if declared != bits => {
                return Err(TokenError::AttributeConflict(format!(
                    "MODULUS_BITS is {declared} but the modulus has {bits} bits"
                )));
            }
            _ => attributes.insert(Attribute::ModulusBits(bits)),
        }
    }
    if holds_secret {
        let generated = origin == ObjectOrigin::Generated;
        let sensitive = attributes.get_bool(AttributeType::Sensitive);
        let extractable = attributes.get_bool(AttributeType::Extractable);
        attributes.insert(Attribute::AlwaysSensitive(generated && sensitive));
        attributes.insert(Attribute::NeverExtractable(generated && !extractable));
    }
    Ok(attributes)
}

/// Apply a `C_SetAttributeValue` style change to a copy of `current`.
pub(crate) fn updated_attributes(current: &AttributeSet, attribute: Attribute) -> TokenResult<AttributeSet> {
    let attribute_type = attribute.attribute_type();
    if !current.get_bool_or(AttributeType::Modifiable, true) {
        warn!("refusing to change {attribute_type} of a non modifiable object");
        return Err(TokenError::AttributeReadOnly(attribute_type));
    }
    let fixed = matches!(
        attribute_type,
        AttributeType::Class
            | AttributeType::KeyType
            | AttributeType::Local
            | AttributeType::Token
            | AttributeType::Private
            | AttributeType::Modifiable
            | AttributeType::ValueLen
            | AttributeType::Modulus
            | AttributeType::ModulusBits
            | AttributeType::PublicExponent
            | AttributeType::AlwaysSensitive
            | AttributeType::NeverExtractable
    ) || attribute_type.is_sensitive_material();
    // SENSITIVE may only be raised and EXTRACTABLE only lowered
    let loosening = match attribute {
        Attribute::Sensitive(false) => current.get_bool(AttributeType::Sensitive),
        Attribute::Extractable(true) => !current.get_bool_or(AttributeType::Extractable, true),
        _ => false,
    };
    if fixed || loosening {
        return Err(TokenError::AttributeReadOnly(attribute_type));
    }
    let mut updated = current.clone();
    updated.set(attribute)?;
    Ok(updated)
}

pub(crate) fn rsa_public_key_attributes(material: &RsaPublicKeyMaterial) -> [Attribute; 2] {
    [
        Attribute::Modulus(material.modulus.clone()),
        Attribute::PublicExponent(material.public_exponent.clone()),
    ]
}

pub(crate) fn rsa_private_key_attributes(material: &RsaPrivateKeyMaterial) -> Vec<Attribute> {
    let mut attributes = vec![
        Attribute::Modulus(material.modulus.clone()),
        Attribute::PublicExponent(material.public_exponent.clone()),
        Attribute::PrivateExponent(material.private_exponent.clone()),
    ];
    let optional = [
        (material.prime_1.as_ref(), AttributeType::Prime1),
        (material.prime_2.as_ref(), AttributeType::Prime2),
        (material.exponent_1.as_ref(), AttributeType::Exponent1),
        (material.exponent_2.as_ref(), AttributeType::Exponent2),
        (material.coefficient.as_ref(), AttributeType::Coefficient),
    ];
    for (value, attribute_type) in optional {
        let Some(value) = value else { continue };
        let value = value.clone();
        attributes.push(match attribute_type {
            AttributeType::Prime1 => Attribute::Prime1(value),
            AttributeType::Prime2 => Attribute::Prime2(value),
            AttributeType::Exponent1 => Attribute::Exponent1(value),
            AttributeType::Exponent2 => Attribute::Exponent2(value),
            _ => Attribute::Coefficient(value),
        });
    }
    attributes
}

/// A key, certificate or data object living in a session or on the token.
#[derive(Debug)]
pub struct CryptoObject {
    handle: ObjectHandle,
    class: ObjectClass,
    key_type: Option<KeyType>,
    attributes: AttributeSet,
}

impl CryptoObject {
    pub(crate) fn new(handle: ObjectHandle, attributes: AttributeSet) -> TokenResult<Self> {
        let class = attributes
            .class()
            .ok_or_else(|| TokenError::TemplateIncomplete("CLASS is required".to_owned()))?;
        Ok(Self {
            handle,
            class,
            key_type: attributes.key_type(),
            attributes,
        })
    }

    #[must_use]
    pub const fn handle(&self) -> ObjectHandle {
        self.handle
    }

    #[must_use]
    pub const fn class(&self) -> ObjectClass {
        self.class
    }

    #[must_use]
    pub const fn key_type(&self) -> Option<KeyType> {
        self.key_type
    }

    #[must_use]
    pub fn is_token(&self) -> bool {
        self.attributes.get_bool(AttributeType::Token)
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        self.attributes.get_bool(AttributeType::Private)
    }

    /// Whether key material must stay inside the token.
    #[must_use]
    pub fn protects_material(&self) -> bool {
        matches!(self.class, ObjectClass::SecretKey | ObjectClass::PrivateKey)
            && (self.attributes.get_bool(AttributeType::Sensitive)
                || !self.attributes.get_bool_or(AttributeType::Extractable, true))
    }

    pub(crate) const fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// Search predicate; a query on protected key material never matches.
    pub(crate) fn matches(&self, query: &AttributeSet) -> bool {
        if self.protects_material()
            && query
                .iter()
                .any(|attribute| attribute.attribute_type().is_sensitive_material())
        {
            return false;
        }
        self.attributes.matches(query)
    }

    /// The public read path, subject to the PRIVATE and SENSITIVE policies.
    ///
    /// Returns `None` for an attribute this object does not carry; absent
    /// boolean attributes which apply to the class read as false.
    pub(crate) fn read_attribute(
        &self,
        attribute_type: AttributeType,
        authenticated: bool,
    ) -> TokenResult<Option<Attribute>> {
        if self.is_private() && !authenticated {
            return Err(TokenError::PermissionDenied(format!(
                "object {} is private: login required",
                self.handle
            )));
        }
        if attribute_type.is_sensitive_material() && self.protects_material() {
            debug!(
                "denying read of {attribute_type} on sensitive object {}",
                self.handle
            );
            return Err(TokenError::SensitiveAttributeDenied(attribute_type));
        }
        Ok(match self.attributes.get(attribute_type) {
            Some(attribute) => Some(attribute.clone()),
            None if attribute_type.applies_to(self.class) => {
                Attribute::from_bool(attribute_type, false)
            }
            None => None,
        })
    }

    fn bytes(&self, attribute_type: AttributeType) -> TokenResult<Vec<u8>> {
        self.attributes
            .get_bytes(attribute_type)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                TokenError::TemplateIncomplete(format!(
                    "object {} has no {attribute_type}",
                    self.handle
                ))
            })
    }

    /// Internal access to the raw value of a secret key, bypassing SENSITIVE.
    pub(crate) fn secret_material(&self) -> TokenResult<SecretKeyMaterial> {
        match (self.class, self.key_type) {
            (ObjectClass::SecretKey, Some(key_type)) => Ok(SecretKeyMaterial::new(
                key_type,
                self.bytes(AttributeType::Value)?,
            )),
            _ => Err(TokenError::KeyFunctionNotPermitted(format!(
                "object {} is not a secret key",
                self.handle
            ))),
        }
    }

    /// Public components of an RSA public or private key.
    pub(crate) fn rsa_public_material(&self) -> TokenResult<RsaPublicKeyMaterial> {
        if self.key_type != Some(KeyType::Rsa) {
            return Err(TokenError::KeyFunctionNotPermitted(format!(
                "object {} is not an RSA key",
                self.handle
            )));
        }
        Ok(RsaPublicKeyMaterial {
            modulus: self.bytes(AttributeType::Modulus)?,
            public_exponent: self.bytes(AttributeType::PublicExponent)?,
        })
    }

    pub(crate) fn rsa_private_material(&self) -> TokenResult<RsaPrivateKeyMaterial> {
        if self.class != ObjectClass::PrivateKey || self.key_type != Some(KeyType::Rsa) {
            return Err(TokenError::KeyFunctionNotPermitted(format!(
                "object {} is not an RSA private key",
                self.handle
            )));
        }
        let optional = |attribute_type| self.attributes.get_bytes(attribute_type).map(<[u8]>::to_vec);
        Ok(RsaPrivateKeyMaterial {
            modulus: self.bytes(AttributeType::Modulus)?,
            public_exponent: self.bytes(AttributeType::PublicExponent)?,
            private_exponent: self.bytes(AttributeType::PrivateExponent)?,
            prime_1: optional(AttributeType::Prime1),
            prime_2: optional(AttributeType::Prime2),
            exponent_1: optional(AttributeType::Exponent1),
            exponent_2: optional(AttributeType::Exponent2),
            coefficient: optional(AttributeType::Coefficient),
        })
    }
}
