// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::{fmt, slice, sync::Arc};

use strum_macros::Display;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::{
    TokenError, TokenResult,
    core::mechanism::{Capability, MechanismType},
    token_bail,
    traits::{
        CipherContext, CipherDirection, CryptoBackend, DigestContext, DigestType,
        RsaPrivateKeyMaterial, RsaPublicKeyMaterial, SecretKeyMaterial,
    },
};

/// PKCS#1 v1.5 overhead: an input may be at most `k - 11` bytes.
const PKCS1_PADDING_OVERHEAD: usize = 11;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Digest,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Active,
    Finalized,
}

/// Key material handed to an operation at init time.
pub(crate) enum OperationKey {
    None,
    Secret(SecretKeyMaterial),
    RsaPublic(RsaPublicKeyMaterial),
    RsaPrivate(RsaPrivateKeyMaterial),
}

impl fmt::Debug for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Secret(key) => write!(f, "Secret({key:?})"),
            Self::RsaPublic(_) => f.write_str("RsaPublic"),
            Self::RsaPrivate(key) => write!(f, "RsaPrivate({key:?})"),
        }
    }
}

enum Engine {
    Cipher(Box<dyn CipherContext>),
    RsaEncrypt {
        key: RsaPublicKeyMaterial,
        buffer: Zeroizing<Vec<u8>>,
    },
    RsaDecrypt {
        key: RsaPrivateKeyMaterial,
        buffer: Zeroizing<Vec<u8>>,
    },
    Sign {
        digest: Option<DigestType>,
        key: RsaPrivateKeyMaterial,
        payload: Zeroizing<Vec<u8>>,
    },
    Verify {
        digest: Option<DigestType>,
        key: RsaPublicKeyMaterial,
        payload: Zeroizing<Vec<u8>>,
    },
    Digest(Box<dyn DigestContext>),
}

impl Engine {
    const fn name(&self) -> &'static str {
        match self {
            Self::Cipher(_) => "cipher",
            Self::RsaEncrypt { .. } => "rsa encrypt",
            Self::RsaDecrypt { .. } => "rsa decrypt",
            Self::Sign { .. } => "sign",
            Self::Verify { .. } => "verify",
            Self::Digest(_) => "digest",
        }
    }
}

fn pkcs1_max_input(modulus_len: usize) -> usize {
    modulus_len.saturating_sub(PKCS1_PADDING_OVERHEAD)
}

/// Either one contiguous buffer or a sequence of writes; both produce the same
/// result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    Single(&'a [u8]),
    Chunks(Vec<&'a [u8]>),
}

impl<'a> Payload<'a> {
    #[must_use]
    pub fn as_chunks(&self) -> &[&'a [u8]] {
        match self {
            Self::Single(data) => slice::from_ref(data),
            Self::Chunks(chunks) => chunks,
        }
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self::Single(data)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Payload<'a> {
    fn from(data: &'a [u8; N]) -> Self {
        Self::Single(data)
    }
}

impl<'a> From<&'a Vec<u8>> for Payload<'a> {
    fn from(data: &'a Vec<u8>) -> Self {
        Self::Single(data)
    }
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(data: &'a str) -> Self {
        Self::Single(data.as_bytes())
    }
}

impl<'a> From<Vec<&'a [u8]>> for Payload<'a> {
    fn from(chunks: Vec<&'a [u8]>) -> Self {
        Self::Chunks(chunks)
    }
}

impl<'a, const N: usize> From<[&'a [u8]; N]> for Payload<'a> {
    fn from(chunks: [&'a [u8]; N]) -> Self {
        Self::Chunks(chunks.to_vec())
    }
}

/// At most one multi-part operation, owned by a session.
///
/// Any error raised while the operation is active terminates it: the state goes
/// back to [`OperationState::Idle`] and buffered data is wiped.
pub struct StreamingOperation {
    backend: Arc<dyn CryptoBackend>,
    state: OperationState,
    kind: Option<OperationKind>,
    mechanism: Option<MechanismType>,
    engine: Option<Engine>,
}

impl fmt::Debug for StreamingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingOperation")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("mechanism", &self.mechanism)
            .field("engine", &self.engine.as_ref().map(Engine::name))
            .finish_non_exhaustive()
    }
}

impl StreamingOperation {
    #[must_use]
    pub fn new(backend: Arc<dyn CryptoBackend>) -> Self {
        Self {
            backend,
            state: OperationState::Idle,
            kind: None,
            mechanism: None,
            engine: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> OperationState {
        self.state
    }

    /// The kind and mechanism of the active operation, if any.
    #[must_use]
    pub fn active(&self) -> Option<(OperationKind, MechanismType)> {
        if self.state != OperationState::Active {
            return None;
        }
        self.kind.zip(self.mechanism)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == OperationState::Active
    }

    pub(crate) fn init(
        &mut self,
        kind: OperationKind,
        mechanism: MechanismType,
        capability: &Capability,
        key: OperationKey,
    ) -> TokenResult<()> {
        if let Some((active_kind, active_mechanism)) = self.active() {
            return Err(TokenError::OperationInProgress(format!(
                "a {active_kind} operation with {active_mechanism} is active"
            )));
        }
        let engine = match (kind, capability, key) {
            (OperationKind::Encrypt, Capability::BlockCipher(spec), OperationKey::Secret(key)) => {
                Engine::Cipher(self.backend.symmetric_cipher(
                    spec,
                    &key,
                    CipherDirection::Encrypt,
                )?)
            }
            (OperationKind::Decrypt, Capability::BlockCipher(spec), OperationKey::Secret(key)) => {
                Engine::Cipher(self.backend.symmetric_cipher(
                    spec,
                    &key,
                    CipherDirection::Decrypt,
                )?)
            }
            (
                OperationKind::Encrypt,
                Capability::Rsa { digest: None },
                OperationKey::RsaPublic(key),
            ) => Engine::RsaEncrypt {
                key,
                buffer: Zeroizing::new(Vec::new()),
            },
            (
                OperationKind::Decrypt,
                Capability::Rsa { digest: None },
                OperationKey::RsaPrivate(key),
            ) => Engine::RsaDecrypt {
                key,
                buffer: Zeroizing::new(Vec::new()),
            },
            (OperationKind::Sign, Capability::Rsa { digest }, OperationKey::RsaPrivate(key)) => {
                Engine::Sign {
                    digest: *digest,
                    key,
                    payload: Zeroizing::new(Vec::new()),
                }
            }
            (OperationKind::Verify, Capability::Rsa { digest }, OperationKey::RsaPublic(key)) => {
                Engine::Verify {
                    digest: *digest,
                    key,
                    payload: Zeroizing::new(Vec::new()),
                }
            }
            (OperationKind::Digest, Capability::Digest(algorithm), OperationKey::None) => {
                Engine::Digest(self.backend.digest(*algorithm)?)
            }
            (kind, capability, key) => {
                return Err(TokenError::MechanismInvalid(format!(
                    "{mechanism} ({capability:?}) cannot run a {kind} operation with key {key:?}"
                )));
            }
        };
        debug!("{kind} operation initialized with {mechanism}");
        self.state = OperationState::Active;
        self.kind = Some(kind);
        self.mechanism = Some(mechanism);
        self.engine = Some(engine);
        Ok(())
    }

    fn ensure_active(&self, kind: OperationKind) -> TokenResult<()> {
        if self.state == OperationState::Active && self.kind == Some(kind) {
            Ok(())
        } else {
            Err(TokenError::OperationNotInitialized(format!(
                "no {kind} operation is active"
            )))
        }
    }

    /// Feed a chunk; only block ciphers produce output before the final call.
    pub fn update(&mut self, kind: OperationKind, chunk: &[u8]) -> TokenResult<Vec<u8>> {
        self.ensure_active(kind)?;
        let result = match self.engine.as_mut() {
            Some(Engine::Cipher(cipher)) => cipher.update(chunk),
            Some(
                Engine::RsaEncrypt { buffer, .. }
                | Engine::RsaDecrypt { buffer, .. }
                | Engine::Sign {
                    payload: buffer, ..
                }
                | Engine::Verify {
                    payload: buffer, ..
                },
            ) => {
                buffer.extend_from_slice(chunk);
                Ok(Vec::new())
            }
            Some(Engine::Digest(digest)) => digest.update(chunk).map(|()| Vec::new()),
            None => Err(TokenError::OperationNotInitialized(format!(
                "the {kind} operation has no engine"
            ))),
        };
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// Fold the raw value of a secret key into the running digest.
    pub(crate) fn digest_key(&mut self, key: &SecretKeyMaterial) -> TokenResult<()> {
        self.update(OperationKind::Digest, key.value()).map(|_| ())
    }

    fn take(&mut self, kind: OperationKind) -> TokenResult<Engine> {
        self.ensure_active(kind)?;
        self.state = OperationState::Idle;
        self.kind = None;
        self.engine
            .take()
            .ok_or_else(|| TokenError::OperationNotInitialized(format!("no {kind} engine")))
    }

    fn complete(&self, engine: Engine) -> TokenResult<Vec<u8>> {
        match engine {
            Engine::Cipher(mut cipher) => cipher.finalize(),
            Engine::RsaEncrypt { key, buffer } => {
                let max = pkcs1_max_input(key.modulus_len());
                if buffer.len() > max {
                    token_bail!(TokenError::DataLengthInvalid(format!(
                        "{} bytes exceed the {max} bytes an RSA PKCS#1 block can carry",
                        buffer.len()
                    )));
                }
                self.backend.rsa_encrypt(&key, &buffer)
            }
            Engine::RsaDecrypt { key, buffer } => {
                let k = key.modulus_len();
                if buffer.len() != k {
                    token_bail!(TokenError::DataLengthInvalid(format!(
                        "an RSA ciphertext is {k} bytes, got {}",
                        buffer.len()
                    )));
                }
                Ok(self.backend.rsa_decrypt(&key, &buffer)?.to_vec())
            }
            Engine::Sign {
                digest,
                key,
                payload,
            } => {
                let max = pkcs1_max_input(key.modulus_len());
                if digest.is_none() && payload.len() > max {
                    token_bail!(TokenError::DataLengthInvalid(format!(
                        "{} bytes exceed the {max} bytes a raw RSA PKCS#1 signature can carry",
                        payload.len()
                    )));
                }
                self.backend.sign(digest, &key, &payload)
            }
            Engine::Digest(mut digest) => digest.finalize(),
            Engine::Verify { .. } => Err(TokenError::OperationNotInitialized(
                "a verify operation completes with a signature".to_owned(),
            )),
        }
    }

    /// Flush the operation: `Active -> Finalized`.
    pub fn finish(&mut self, kind: OperationKind) -> TokenResult<Vec<u8>> {
        let engine = self.take(kind)?;
        let output = self.complete(engine)?;
        trace!("{kind} operation finalized: {} bytes out", output.len());
        self.state = OperationState::Finalized;
        Ok(output)
    }

    /// Complete a verify operation. A mismatch is `Ok(false)`; a signature
    /// which is not exactly the modulus length is an error.
    pub fn finish_verify(&mut self, signature: &[u8]) -> TokenResult<bool> {
        let Engine::Verify {
            digest,
            key,
            payload,
        } = self.take(OperationKind::Verify)?
        else {
            return Err(TokenError::OperationNotInitialized(
                "the active operation is not a verify".to_owned(),
            ));
        };
        let expected = key.modulus_len();
        if signature.len() != expected {
            return Err(TokenError::SignatureLengthInvalid {
                expected,
                actual: signature.len(),
            });
        }
        let max = pkcs1_max_input(expected);
        if digest.is_none() && payload.len() > max {
            token_bail!(TokenError::DataLengthInvalid(format!(
                "{} bytes exceed the {max} bytes a raw RSA PKCS#1 signature can carry",
                payload.len()
            )));
        }
        let valid = self.backend.verify(digest, &key, &payload, signature)?;
        debug!("verify operation finalized: valid={valid}");
        self.state = OperationState::Finalized;
        Ok(valid)
    }

    /// Drop the active operation, if any, wiping buffered data.
    pub fn abort(&mut self) {
        if let Some(kind) = self.kind.take() {
            let engine = self.engine.as_ref().map_or("no engine", Engine::name);
            debug!("aborting {kind} operation ({engine})");
        }
        self.engine = None;
        self.state = OperationState::Idle;
    }

    pub(crate) fn one_shot(
        &mut self,
        kind: OperationKind,
        mechanism: MechanismType,
        capability: &Capability,
        key: OperationKey,
        payload: &Payload<'_>,
    ) -> TokenResult<Vec<u8>> {
        self.init(kind, mechanism, capability, key)?;
        let mut output = Vec::new();
        for chunk in payload.as_chunks() {
            output.extend(self.update(kind, chunk)?);
        }
        output.extend(self.finish(kind)?);
        Ok(output)
    }

    pub(crate) fn one_shot_verify(
        &mut self,
        mechanism: MechanismType,
        capability: &Capability,
        key: OperationKey,
        payload: &Payload<'_>,
        signature: &[u8],
    ) -> TokenResult<bool> {
        self.init(OperationKind::Verify, mechanism, capability, key)?;
        for chunk in payload.as_chunks() {
            self.update(OperationKind::Verify, chunk)?;
        }
        self.finish_verify(signature)
    }
}
