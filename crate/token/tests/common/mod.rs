// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

//! Fixture shared by the integration tests: a logged in read-write session
//! holding an RSA key pair and a DES2 key.
#![allow(dead_code)]

use cosmian_soft_token::{
    Attribute, AttributeSet, AttributeType, KeyType, Mechanism, MechanismType, ObjectClass,
    ObjectHandle, Session, SessionFlags, Slot, TokenConfig, TokenError, TokenResult, UserType,
    logging::log_init,
};
use cryptoki_sys::CK_ULONG;

pub(crate) const DES2_KEY: &[u8; 16] = b"0123456789abcdef";
pub(crate) const RSA_BITS: CK_ULONG = 1024;

pub(crate) struct Fixture {
    pub slot: Slot,
    pub session: Session,
    pub public_key: ObjectHandle,
    pub private_key: ObjectHandle,
    pub des2_key: ObjectHandle,
}

pub(crate) fn rw_flags() -> SessionFlags {
    SessionFlags::SERIAL_SESSION | SessionFlags::RW_SESSION
}

pub(crate) fn des2_template(value: &[u8]) -> AttributeSet {
    AttributeSet::from([
        Attribute::Class(ObjectClass::SecretKey),
        Attribute::KeyType(KeyType::Des2),
        Attribute::Value(value.to_vec()),
        Attribute::Label("des2 test key".to_owned()),
        Attribute::Encrypt(true),
        Attribute::Decrypt(true),
        Attribute::Wrap(true),
        Attribute::Unwrap(true),
    ])
}

pub(crate) fn rsa_templates(bits: CK_ULONG) -> (AttributeSet, AttributeSet) {
    let public = AttributeSet::from([
        Attribute::ModulusBits(bits),
        Attribute::Encrypt(true),
        Attribute::Verify(true),
        Attribute::Wrap(true),
    ]);
    let private = AttributeSet::from([
        Attribute::Sensitive(true),
        Attribute::Decrypt(true),
        Attribute::Sign(true),
        Attribute::Unwrap(true),
    ]);
    (public, private)
}

pub(crate) fn fixture() -> TokenResult<Fixture> {
    log_init("info,cosmian_soft_token=debug");
    let slot = Slot::with_openssl(TokenConfig::default())?;
    let mut session = slot.open_session(rw_flags())?;
    session.login(UserType::User, "")?;

    let (public_template, private_template) = rsa_templates(RSA_BITS);
    let (public_key, private_key) = session.generate_key_pair(
        &Mechanism::new(MechanismType::RsaPkcsKeyPairGen),
        &public_template,
        &private_template,
    )?;
    let des2_key = session.create_object(&des2_template(DES2_KEY))?;
    Ok(Fixture {
        slot,
        session,
        public_key,
        private_key,
        des2_key,
    })
}

/// Raw value of a byte string attribute.
pub(crate) fn bytes_attribute(
    session: &Session,
    handle: ObjectHandle,
    attribute_type: AttributeType,
) -> TokenResult<Vec<u8>> {
    session
        .get_attribute(handle, attribute_type)?
        .and_then(|attribute| attribute.as_bytes().map(<[u8]>::to_vec))
        .ok_or_else(|| TokenError::Default(format!("object {handle} has no {attribute_type}")))
}

pub(crate) fn bool_attribute(
    session: &Session,
    handle: ObjectHandle,
    attribute_type: AttributeType,
) -> TokenResult<bool> {
    session
        .get_attribute(handle, attribute_type)?
        .and_then(|attribute| attribute.as_bool())
        .ok_or_else(|| TokenError::Default(format!("object {handle} has no {attribute_type}")))
}

/// Key check value: the encryption of a zero block under DES3_ECB.
pub(crate) fn kcv(session: &mut Session, key: ObjectHandle) -> TokenResult<Vec<u8>> {
    session.encrypt(&Mechanism::new(MechanismType::Des3Ecb), key, &[0_u8; 8])
}
