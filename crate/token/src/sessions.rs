// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::{collections::BTreeMap, sync::Arc};

use cryptoki_sys::CK_SESSION_HANDLE;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use crate::{
    TokenError, TokenResult, TokenResultHelper,
    core::{
        attribute::{Attribute, AttributeSet, AttributeType, KeyType, ObjectClass},
        mechanism::{Capability, KeyUsage, Mechanism, MechanismType, check_key_compatibility, resolve},
        object::{
            CryptoObject, ObjectHandle, ObjectOrigin, build_attributes, rsa_private_key_attributes,
            rsa_public_key_attributes, updated_attributes,
        },
    },
    operation::{OperationKey, OperationKind, Payload, StreamingOperation},
    slots::{LoginState, SessionFlags, SessionState, SlotInner, UserType},
    token_ensure,
};

const DEFAULT_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// Attributes carrying key material: the caller may not provide them when the
/// token produces the material itself.
const MATERIAL_ATTRIBUTES: [AttributeType; 8] = [
    AttributeType::Value,
    AttributeType::Modulus,
    AttributeType::PrivateExponent,
    AttributeType::Prime1,
    AttributeType::Prime2,
    AttributeType::Exponent1,
    AttributeType::Exponent2,
    AttributeType::Coefficient,
];

/// `C_GetSessionInfo` data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot_id: u64,
    pub state: SessionState,
    pub flags: SessionFlags,
}

fn refuse_material(template: &AttributeSet, what: &str) -> TokenResult<()> {
    match MATERIAL_ATTRIBUTES.iter().find(|t| template.contains(**t)) {
        Some(attribute_type) => Err(TokenError::AttributeConflict(format!(
            "{attribute_type} cannot be provided in the template of {what}"
        ))),
        None => Ok(()),
    }
}

fn expect_class(template: &AttributeSet, class: ObjectClass) -> TokenResult<()> {
    match template.class() {
        Some(declared) if declared != class => Err(TokenError::AttributeConflict(format!(
            "the template declares a {declared} where a {class} is produced"
        ))),
        _ => Ok(()),
    }
}

fn expect_key_type(template: &AttributeSet, key_type: KeyType) -> TokenResult<()> {
    match template.key_type() {
        Some(declared) if declared != key_type => Err(TokenError::AttributeConflict(format!(
            "the template declares a {declared} key where a {key_type} key is produced"
        ))),
        _ => Ok(()),
    }
}

fn operation_key(object: &CryptoObject) -> TokenResult<OperationKey> {
    Ok(match object.class() {
        ObjectClass::SecretKey => OperationKey::Secret(object.secret_material()?),
        ObjectClass::PublicKey => OperationKey::RsaPublic(object.rsa_public_material()?),
        ObjectClass::PrivateKey => OperationKey::RsaPrivate(object.rsa_private_material()?),
        class => {
            return Err(TokenError::KeyFunctionNotPermitted(format!(
                "object {} is a {class}, not a key",
                object.handle()
            )));
        }
    })
}

/// A session on the token of a slot.
///
/// Session objects (TOKEN=false) belong to the session and are destroyed with
/// it. At most one streaming operation and one find context are active at a time.
pub struct Session {
    handle: CK_SESSION_HANDLE,
    slot: Arc<SlotInner>,
    flags: SessionFlags,
    login: LoginState,
    objects: BTreeMap<ObjectHandle, Arc<CryptoObject>>,
    operation: StreamingOperation,
    /// Handles found by `find_objects_init` not yet returned by `find_objects_next`.
    find_ctx: Option<Vec<ObjectHandle>>,
}

impl Session {
    pub(crate) fn new(handle: CK_SESSION_HANDLE, slot: Arc<SlotInner>, flags: SessionFlags) -> Self {
        let operation = StreamingOperation::new(Arc::clone(&slot.backend));
        Self {
            handle,
            slot,
            flags,
            login: LoginState::NotLoggedIn,
            objects: BTreeMap::new(),
            operation,
            find_ctx: None,
        }
    }

    #[must_use]
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    #[must_use]
    pub const fn login_state(&self) -> LoginState {
        self.login
    }

    fn is_read_write(&self) -> bool {
        self.flags.contains(SessionFlags::RW_SESSION)
    }

    /// Whether PRIVATE objects are accessible; only the normal user gets to them.
    fn user_authenticated(&self) -> bool {
        self.login == LoginState::User
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            slot_id: self.slot.config.slot_id,
            state: SessionState::new(self.is_read_write(), self.login),
            flags: self.flags,
        }
    }

    /// The kind and mechanism of the streaming operation in progress.
    #[must_use]
    pub fn active_operation(&self) -> Option<(OperationKind, MechanismType)> {
        self.operation.active()
    }

    //
    // Authentication
    //

    pub fn login(&mut self, user_type: UserType, pin: &str) -> TokenResult<()> {
        if self.login != LoginState::NotLoggedIn {
            return Err(TokenError::UserAlreadyLoggedIn);
        }
        if user_type == UserType::SecurityOfficer && !self.is_read_write() {
            warn!("session {}: SO login refused on a read-only session", self.handle);
            return Err(TokenError::SessionReadOnly);
        }
        let expected = match user_type {
            UserType::User => &self.slot.config.user_pin,
            UserType::SecurityOfficer => &self.slot.config.so_pin,
        };
        let pin_ok =
            expected.len() == pin.len() && ::openssl::memcmp::eq(expected.as_bytes(), pin.as_bytes());
        if !pin_ok {
            warn!("session {}: incorrect PIN for {user_type}", self.handle);
            return Err(TokenError::PinIncorrect);
        }
        self.login = match user_type {
            UserType::User => LoginState::User,
            UserType::SecurityOfficer => LoginState::SecurityOfficer,
        };
        info!("session {}: {user_type} logged in", self.handle);
        Ok(())
    }

    pub fn logout(&mut self) -> TokenResult<()> {
        if self.login == LoginState::NotLoggedIn {
            return Err(TokenError::PermissionDenied(
                "logout: no user is logged in".to_owned(),
            ));
        }
        self.operation.abort();
        self.find_ctx = None;
        info!("session {}: {} logged out", self.handle, self.login);
        self.login = LoginState::NotLoggedIn;
        Ok(())
    }

    //
    // Objects
    //

    /// Look an object up by handle, session objects first.
    fn object(&self, handle: ObjectHandle) -> TokenResult<Arc<CryptoObject>> {
        if let Some(object) = self.objects.get(&handle) {
            return Ok(Arc::clone(object));
        }
        self.slot
            .token_objects
            .read()?
            .get(handle)
            .ok_or(TokenError::InvalidHandle(handle))
    }

    /// An object the session may operate with: PRIVATE ones need a user login.
    fn accessible_object(&self, handle: ObjectHandle) -> TokenResult<Arc<CryptoObject>> {
        let object = self.object(handle)?;
        if object.is_private() && !self.user_authenticated() {
            return Err(TokenError::PermissionDenied(format!(
                "object {handle} is private: login required"
            )));
        }
        Ok(object)
    }

    fn check_writable(&self, attributes: &AttributeSet) -> TokenResult<()> {
        if attributes.get_bool(AttributeType::Token) && !self.is_read_write() {
            return Err(TokenError::SessionReadOnly);
        }
        if attributes.get_bool(AttributeType::Private) && !self.user_authenticated() {
            return Err(TokenError::PermissionDenied(
                "creating a private object requires a user login".to_owned(),
            ));
        }
        Ok(())
    }

    /// Store a fully built object; `check_writable` must have passed.
    fn insert_object(&mut self, attributes: AttributeSet) -> TokenResult<ObjectHandle> {
        let handle = self.slot.next_object_handle();
        let object = Arc::new(CryptoObject::new(handle, attributes)?);
        debug!(
            "session {}: new {} object {handle}, token: {}",
            self.handle,
            object.class(),
            object.is_token()
        );
        if object.is_token() {
            self.slot.token_objects.write()?.insert(object);
        } else {
            self.objects.insert(handle, object);
        }
        Ok(handle)
    }

    pub fn create_object(&mut self, template: &AttributeSet) -> TokenResult<ObjectHandle> {
        let attributes = build_attributes(template, ObjectOrigin::Created)?;
        self.check_writable(&attributes)?;
        self.insert_object(attributes)
    }

    pub fn destroy_object(&mut self, handle: ObjectHandle) -> TokenResult<()> {
        if let Some(object) = self.objects.get(&handle) {
            if object.is_private() && !self.user_authenticated() {
                return Err(TokenError::PermissionDenied(format!(
                    "object {handle} is private: login required"
                )));
            }
            self.objects.remove(&handle);
            debug!("session {}: destroyed session object {handle}", self.handle);
            return Ok(());
        }
        let object = self.accessible_object(handle)?;
        if !self.is_read_write() {
            return Err(TokenError::SessionReadOnly);
        }
        self.slot
            .token_objects
            .write()?
            .remove(object.handle())
            .ok_or(TokenError::InvalidHandle(handle))?;
        debug!("session {}: destroyed token object {handle}", self.handle);
        Ok(())
    }

    /// Handles of the visible objects matching `query`, in handle order.
    pub fn find_objects(&self, query: &AttributeSet) -> TokenResult<Vec<ObjectHandle>> {
        let authenticated = self.user_authenticated();
        let mut handles: Vec<ObjectHandle> = self
            .objects
            .values()
            .filter(|object| authenticated || !object.is_private())
            .filter(|object| object.matches(query))
            .map(|object| object.handle())
            .collect();
        handles.extend(self.slot.token_objects.read()?.find(query, authenticated));
        handles.sort_unstable();
        trace!("session {}: find {query:?} -> {handles:?}", self.handle);
        Ok(handles)
    }

    pub fn find_objects_init(&mut self, query: &AttributeSet) -> TokenResult<()> {
        if self.find_ctx.is_some() {
            return Err(TokenError::OperationInProgress(
                "a find operation is already active".to_owned(),
            ));
        }
        self.find_ctx = Some(self.find_objects(query)?);
        Ok(())
    }

    /// Return up to `max` of the remaining handles.
    pub fn find_objects_next(&mut self, max: usize) -> TokenResult<Vec<ObjectHandle>> {
        let found = self.find_ctx.as_mut().ok_or_else(|| {
            TokenError::OperationNotInitialized("no find operation is active".to_owned())
        })?;
        let count = max.min(found.len());
        Ok(found.drain(..count).collect())
    }

    pub fn find_objects_final(&mut self) -> TokenResult<()> {
        self.find_ctx
            .take()
            .map(|_| ())
            .ok_or_else(|| TokenError::OperationNotInitialized("no find operation is active".to_owned()))
    }

    /// Read one attribute; `None` when the object does not carry it.
    pub fn get_attribute(
        &self,
        handle: ObjectHandle,
        attribute_type: AttributeType,
    ) -> TokenResult<Option<Attribute>> {
        self.object(handle)?
            .read_attribute(attribute_type, self.user_authenticated())
    }

    pub fn set_attribute(&mut self, handle: ObjectHandle, attribute: Attribute) -> TokenResult<()> {
        let object = self.accessible_object(handle)?;
        if object.is_token() && !self.is_read_write() {
            return Err(TokenError::SessionReadOnly);
        }
        let attribute_type = attribute.attribute_type();
        let attributes = updated_attributes(object.attributes(), attribute)?;
        let updated = Arc::new(CryptoObject::new(handle, attributes)?);
        if updated.is_token() {
            if !self.slot.token_objects.write()?.replace(updated) {
                return Err(TokenError::InvalidHandle(handle));
            }
        } else {
            self.objects.insert(handle, updated);
        }
        debug!("session {}: object {handle}: {attribute_type} updated", self.handle);
        Ok(())
    }

    //
    // Cryptographic operations
    //

    /// Resolve the mechanism and run the key policy checks for `usage`.
    fn prepare(
        &self,
        mechanism: &Mechanism,
        usage: KeyUsage,
        key: ObjectHandle,
    ) -> TokenResult<(Capability, OperationKey)> {
        let capability = resolve(mechanism)?;
        let key = self.accessible_object(key)?;
        check_key_compatibility(&capability, usage, &key)?;
        Ok((capability, operation_key(&key)?))
    }

    fn init(
        &mut self,
        kind: OperationKind,
        usage: KeyUsage,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> TokenResult<()> {
        let (capability, key) = self.prepare(mechanism, usage, key)?;
        self.operation
            .init(kind, mechanism.mechanism_type, &capability, key)
    }

    fn one_shot(
        &mut self,
        kind: OperationKind,
        usage: KeyUsage,
        mechanism: &Mechanism,
        key: ObjectHandle,
        payload: &Payload<'_>,
    ) -> TokenResult<Vec<u8>> {
        let (capability, key) = self.prepare(mechanism, usage, key)?;
        self.operation
            .one_shot(kind, mechanism.mechanism_type, &capability, key, payload)
    }

    pub fn encrypt_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.init(OperationKind::Encrypt, KeyUsage::Encrypt, mechanism, key)
    }

    pub fn encrypt_update(&mut self, data: &[u8]) -> TokenResult<Vec<u8>> {
        self.operation.update(OperationKind::Encrypt, data)
    }

    pub fn encrypt_final(&mut self) -> TokenResult<Vec<u8>> {
        self.operation.finish(OperationKind::Encrypt)
    }

    pub fn encrypt<'a>(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        payload: impl Into<Payload<'a>>,
    ) -> TokenResult<Vec<u8>> {
        let payload = payload.into();
        self.one_shot(OperationKind::Encrypt, KeyUsage::Encrypt, mechanism, key, &payload)
    }

    pub fn decrypt_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.init(OperationKind::Decrypt, KeyUsage::Decrypt, mechanism, key)
    }

    pub fn decrypt_update(&mut self, data: &[u8]) -> TokenResult<Vec<u8>> {
        self.operation.update(OperationKind::Decrypt, data)
    }

    pub fn decrypt_final(&mut self) -> TokenResult<Vec<u8>> {
        self.operation.finish(OperationKind::Decrypt)
    }

    pub fn decrypt<'a>(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        payload: impl Into<Payload<'a>>,
    ) -> TokenResult<Vec<u8>> {
        let payload = payload.into();
        self.one_shot(OperationKind::Decrypt, KeyUsage::Decrypt, mechanism, key, &payload)
    }

    pub fn sign_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.init(OperationKind::Sign, KeyUsage::Sign, mechanism, key)
    }

    pub fn sign_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.operation.update(OperationKind::Sign, data).map(|_| ())
    }

    pub fn sign_final(&mut self) -> TokenResult<Vec<u8>> {
        self.operation.finish(OperationKind::Sign)
    }

    pub fn sign<'a>(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        payload: impl Into<Payload<'a>>,
    ) -> TokenResult<Vec<u8>> {
        let payload = payload.into();
        self.one_shot(OperationKind::Sign, KeyUsage::Sign, mechanism, key, &payload)
    }

    pub fn verify_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.init(OperationKind::Verify, KeyUsage::Verify, mechanism, key)
    }

    pub fn verify_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.operation.update(OperationKind::Verify, data).map(|_| ())
    }

    /// `Ok(false)` when the signature does not match the data.
    pub fn verify_final(&mut self, signature: &[u8]) -> TokenResult<bool> {
        self.operation.finish_verify(signature)
    }

    pub fn verify<'a>(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        signature: &[u8],
        payload: impl Into<Payload<'a>>,
    ) -> TokenResult<bool> {
        let payload = payload.into();
        let (capability, key) = self.prepare(mechanism, KeyUsage::Verify, key)?;
        self.operation.one_shot_verify(
            mechanism.mechanism_type,
            &capability,
            key,
            &payload,
            signature,
        )
    }

    pub fn digest_init(&mut self, mechanism: &Mechanism) -> TokenResult<()> {
        let capability = resolve(mechanism)?;
        self.operation.init(
            OperationKind::Digest,
            mechanism.mechanism_type,
            &capability,
            OperationKey::None,
        )
    }

    pub fn digest_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.operation.update(OperationKind::Digest, data).map(|_| ())
    }

    /// Continue the active digest with the value of a secret key.
    ///
    /// The value never leaves the token, so SENSITIVE keys qualify.
    pub fn digest_key(&mut self, key: ObjectHandle) -> TokenResult<()> {
        if !matches!(self.operation.active(), Some((OperationKind::Digest, _))) {
            return Err(TokenError::OperationNotInitialized(
                "no digest operation is active".to_owned(),
            ));
        }
        let material = self.accessible_object(key).and_then(|object| {
            if object.class() == ObjectClass::SecretKey {
                object.secret_material()
            } else {
                Err(TokenError::KeyFunctionNotPermitted(format!(
                    "only secret keys can be digested, object {key} is a {}",
                    object.class()
                )))
            }
        });
        match material {
            Ok(material) => self.operation.digest_key(&material),
            Err(e) => {
                self.operation.abort();
                Err(e)
            }
        }
    }

    pub fn digest_final(&mut self) -> TokenResult<Vec<u8>> {
        self.operation.finish(OperationKind::Digest)
    }

    pub fn digest<'a>(
        &mut self,
        mechanism: &Mechanism,
        payload: impl Into<Payload<'a>>,
    ) -> TokenResult<Vec<u8>> {
        let payload = payload.into();
        let capability = resolve(mechanism)?;
        self.operation.one_shot(
            OperationKind::Digest,
            mechanism.mechanism_type,
            &capability,
            OperationKey::None,
            &payload,
        )
    }

    //
    // Key management
    //

    /// Encrypt the material of `key` under `wrapping_key`.
    ///
    /// Secret keys wrap their VALUE, RSA private keys their PKCS#8 encoding. The
    /// session streaming operation is left untouched.
    pub fn wrap_key(
        &self,
        mechanism: &Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> TokenResult<Vec<u8>> {
        let (capability, wrapping) = self.prepare(mechanism, KeyUsage::Wrap, wrapping_key)?;
        let target = self.accessible_object(key)?;
        if !target.attributes().get_bool_or(AttributeType::Extractable, true) {
            warn!("session {}: key {key} is not extractable", self.handle);
            return Err(TokenError::KeyNotExtractable(key));
        }
        let material: Zeroizing<Vec<u8>> = match target.class() {
            ObjectClass::SecretKey => Zeroizing::new(target.secret_material()?.value().to_vec()),
            ObjectClass::PrivateKey => self
                .slot
                .backend
                .encode_rsa_private_key(&target.rsa_private_material()?)?,
            class => {
                return Err(TokenError::KeyFunctionNotPermitted(format!(
                    "a {class} cannot be wrapped"
                )));
            }
        };
        let wrapped = StreamingOperation::new(Arc::clone(&self.slot.backend))
            .one_shot(
                OperationKind::Encrypt,
                mechanism.mechanism_type,
                &capability,
                wrapping,
                &Payload::Single(&material),
            )
            .with_context(|| format!("wrapping key {key} with {}", mechanism.mechanism_type))?;
        debug!(
            "session {}: key {key} wrapped under {wrapping_key}: {} bytes",
            self.handle,
            wrapped.len()
        );
        Ok(wrapped)
    }

    /// Decrypt `wrapped` under `unwrapping_key` and create a key from it.
    pub fn unwrap_key(
        &mut self,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &AttributeSet,
    ) -> TokenResult<ObjectHandle> {
        let class = template.class().ok_or_else(|| {
            TokenError::TemplateIncomplete("CLASS is required to unwrap a key".to_owned())
        })?;
        if !matches!(class, ObjectClass::SecretKey | ObjectClass::PrivateKey) {
            return Err(TokenError::AttributeValueInvalid(
                AttributeType::Class,
                format!("a {class} cannot be unwrapped"),
            ));
        }
        let key_type = template.key_type().ok_or_else(|| {
            TokenError::TemplateIncomplete(format!("KEY_TYPE is required to unwrap a {class}"))
        })?;
        refuse_material(template, "an unwrapped key")?;

        let (capability, unwrapping) = self.prepare(mechanism, KeyUsage::Unwrap, unwrapping_key)?;
        let plaintext = Zeroizing::new(
            StreamingOperation::new(Arc::clone(&self.slot.backend))
                .one_shot(
                    OperationKind::Decrypt,
                    mechanism.mechanism_type,
                    &capability,
                    unwrapping,
                    &Payload::Single(wrapped),
                )
                .with_context(|| {
                    format!("unwrapping with key {unwrapping_key} and {}", mechanism.mechanism_type)
                })?,
        );
        let mut recovered = template.clone();
        if class == ObjectClass::SecretKey {
            recovered.insert(Attribute::Value(plaintext.to_vec()));
        } else {
            if key_type != KeyType::Rsa {
                return Err(TokenError::AttributeConflict(format!(
                    "a private key of type {key_type} cannot be unwrapped"
                )));
            }
            let material = self.slot.backend.decode_rsa_private_key(&plaintext)?;
            for attribute in rsa_private_key_attributes(&material) {
                recovered.insert(attribute);
            }
        }
        let attributes = build_attributes(&recovered, ObjectOrigin::Unwrapped)?;
        self.check_writable(&attributes)?;
        self.insert_object(attributes)
    }

    pub fn generate_key(
        &mut self,
        mechanism: &Mechanism,
        template: &AttributeSet,
    ) -> TokenResult<ObjectHandle> {
        let Capability::KeyGeneration(key_type) = resolve(mechanism)? else {
            return Err(TokenError::MechanismInvalid(format!(
                "{} is not a key generation mechanism",
                mechanism.mechanism_type
            )));
        };
        expect_class(template, ObjectClass::SecretKey)?;
        expect_key_type(template, key_type)?;
        refuse_material(template, "a generated key")?;
        let len = match key_type {
            KeyType::Des2 => 16,
            KeyType::Des3 => 24,
            _ => {
                let declared = template.get_ulong(AttributeType::ValueLen).ok_or_else(|| {
                    TokenError::TemplateIncomplete(format!(
                        "VALUE_LEN is required to generate a {key_type} key"
                    ))
                })?;
                let len = usize::try_from(declared)?;
                token_ensure!(
                    key_type.check_value_len(len).is_ok(),
                    TokenError::KeySizeRange(format!(
                        "{len} bytes is not a valid {key_type} key length"
                    ))
                );
                len
            }
        };
        let material = self.slot.backend.generate_random_key(key_type, len)?;
        let template = template
            .clone()
            .with(Attribute::Class(ObjectClass::SecretKey))
            .with(Attribute::KeyType(key_type))
            .with(Attribute::Value(material.value().to_vec()));
        let attributes = build_attributes(&template, ObjectOrigin::Generated)?;
        self.check_writable(&attributes)?;
        let handle = self.insert_object(attributes)?;
        info!(
            "session {}: generated {key_type} key {handle} with {}",
            self.handle, mechanism.mechanism_type
        );
        Ok(handle)
    }

    /// Generate an RSA key pair, returning the public then the private handle.
    pub fn generate_key_pair(
        &mut self,
        mechanism: &Mechanism,
        public_template: &AttributeSet,
        private_template: &AttributeSet,
    ) -> TokenResult<(ObjectHandle, ObjectHandle)> {
        let Capability::KeyPairGeneration(key_type) = resolve(mechanism)? else {
            return Err(TokenError::MechanismInvalid(format!(
                "{} is not a key pair generation mechanism",
                mechanism.mechanism_type
            )));
        };
        expect_class(public_template, ObjectClass::PublicKey)?;
        expect_class(private_template, ObjectClass::PrivateKey)?;
        expect_key_type(public_template, key_type)?;
        expect_key_type(private_template, key_type)?;
        refuse_material(public_template, "a generated public key")?;
        refuse_material(private_template, "a generated private key")?;
        if private_template.contains(AttributeType::PublicExponent) {
            return Err(TokenError::AttributeConflict(
                "PUBLIC_EXPONENT belongs to the public key template".to_owned(),
            ));
        }

        let bits = public_template
            .get_ulong(AttributeType::ModulusBits)
            .ok_or_else(|| {
                TokenError::TemplateIncomplete(
                    "MODULUS_BITS is required to generate an RSA key pair".to_owned(),
                )
            })?;
        let bits = usize::try_from(bits)?;
        let config = &self.slot.config;
        token_ensure!(
            (config.min_rsa_modulus_bits..=config.max_rsa_modulus_bits).contains(&bits),
            TokenError::KeySizeRange(format!(
                "RSA modulus of {bits} bits is outside {}..={}",
                config.min_rsa_modulus_bits, config.max_rsa_modulus_bits
            ))
        );
        let exponent = public_template
            .get_bytes(AttributeType::PublicExponent)
            .unwrap_or(&DEFAULT_PUBLIC_EXPONENT)
            .to_vec();

        let (public, private) = self.slot.backend.generate_rsa_keypair(bits, &exponent)?;
        let mut public_attributes = public_template
            .clone()
            .with(Attribute::Class(ObjectClass::PublicKey))
            .with(Attribute::KeyType(key_type));
        for attribute in rsa_public_key_attributes(&public) {
            public_attributes.insert(attribute);
        }
        let mut private_attributes = private_template
            .clone()
            .with(Attribute::Class(ObjectClass::PrivateKey))
            .with(Attribute::KeyType(key_type));
        for attribute in rsa_private_key_attributes(&private) {
            private_attributes.insert(attribute);
        }
        let public_attributes = build_attributes(&public_attributes, ObjectOrigin::Generated)?;
        let private_attributes = build_attributes(&private_attributes, ObjectOrigin::Generated)?;
        self.check_writable(&public_attributes)?;
        self.check_writable(&private_attributes)?;

        let public_handle = self.insert_object(public_attributes)?;
        let private_handle = match self.insert_object(private_attributes) {
            Ok(handle) => handle,
            Err(e) => {
                // keep the pair all-or-nothing
                self.destroy_object(public_handle)?;
                return Err(e);
            }
        };
        info!(
            "session {}: generated {bits} bits RSA key pair {public_handle}/{private_handle}",
            self.handle
        );
        Ok((public_handle, private_handle))
    }

    pub fn generate_random(&self, len: usize) -> TokenResult<Vec<u8>> {
        Ok(self.slot.backend.random_bytes(len)?.to_vec())
    }

    /// Close the session; see the `Drop` implementation.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.operation.abort();
        self.find_ctx = None;
        let destroyed = self.objects.len();
        self.objects.clear();
        self.slot.release_session();
        info!(
            "session {} closed: {destroyed} session objects destroyed",
            self.handle
        );
    }
}
