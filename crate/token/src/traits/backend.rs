// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    TokenResult,
    core::attribute::KeyType,
    traits::{CipherDirection, DigestType, SymmetricSpec},
};

/// Raw value of a secret key, as handed to the backend.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKeyMaterial {
    #[zeroize(skip)]
    key_type: KeyType,
    value: Vec<u8>,
}

impl SecretKeyMaterial {
    #[must_use]
    pub const fn new(key_type: KeyType, value: Vec<u8>) -> Self {
        Self { key_type, value }
    }

    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

impl fmt::Debug for SecretKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKeyMaterial")
            .field("key_type", &self.key_type)
            .field("len", &self.value.len())
            .finish_non_exhaustive()
    }
}

/// Big endian RSA public components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKeyMaterial {
    pub modulus: Vec<u8>,
    pub public_exponent: Vec<u8>,
}

impl RsaPublicKeyMaterial {
    /// Size in bytes of the modulus, leading zero bytes excluded.
    #[must_use]
    pub fn modulus_len(&self) -> usize {
        modulus_bits(&self.modulus).div_ceil(8)
    }
}

/// Big endian RSA private components; the CRT values are optional.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RsaPrivateKeyMaterial {
    pub modulus: Vec<u8>,
    pub public_exponent: Vec<u8>,
    pub private_exponent: Vec<u8>,
    pub prime_1: Option<Vec<u8>>,
    pub prime_2: Option<Vec<u8>>,
    pub exponent_1: Option<Vec<u8>>,
    pub exponent_2: Option<Vec<u8>>,
    pub coefficient: Option<Vec<u8>>,
}

impl RsaPrivateKeyMaterial {
    #[must_use]
    pub fn modulus_len(&self) -> usize {
        modulus_bits(&self.modulus).div_ceil(8)
    }

    #[must_use]
    pub fn public_key(&self) -> RsaPublicKeyMaterial {
        RsaPublicKeyMaterial {
            modulus: self.modulus.clone(),
            public_exponent: self.public_exponent.clone(),
        }
    }
}

impl fmt::Debug for RsaPrivateKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaPrivateKeyMaterial")
            .field("modulus_bits", &modulus_bits(&self.modulus))
            .finish_non_exhaustive()
    }
}

/// Number of significant bits of a big endian unsigned integer.
#[must_use]
pub fn modulus_bits(modulus: &[u8]) -> usize {
    modulus
        .iter()
        .position(|b| *b != 0)
        .map_or(0, |first| {
            let leading = modulus[first].leading_zeros() as usize;
            (modulus.len() - first) * 8 - leading
        })
}

/// Incremental block cipher context.
pub trait CipherContext: Send {
    /// Feed `input`, returning the output available so far.
    fn update(&mut self, input: &[u8]) -> TokenResult<Vec<u8>>;
    /// Flush the remaining output; the context cannot be used afterwards.
    fn finalize(&mut self) -> TokenResult<Vec<u8>>;
}

/// Incremental hash context.
pub trait DigestContext: Send {
    fn update(&mut self, data: &[u8]) -> TokenResult<()>;
    fn finalize(&mut self) -> TokenResult<Vec<u8>>;
}

/// Cryptographic primitives consumed by the token.
///
/// Implementations receive key material in the clear and hold no state across calls:
/// object storage, access policy and operation sequencing all live in the token itself.
pub trait CryptoBackend: Send + Sync + fmt::Debug {
    /// RSA PKCS#1 v1.5 encryption.
    fn rsa_encrypt(&self, key: &RsaPublicKeyMaterial, data: &[u8]) -> TokenResult<Vec<u8>>;

    /// RSA PKCS#1 v1.5 decryption.
    fn rsa_decrypt(
        &self,
        key: &RsaPrivateKeyMaterial,
        data: &[u8],
    ) -> TokenResult<Zeroizing<Vec<u8>>>;

    fn symmetric_cipher(
        &self,
        spec: &SymmetricSpec,
        key: &SecretKeyMaterial,
        direction: CipherDirection,
    ) -> TokenResult<Box<dyn CipherContext>>;

    /// RSA PKCS#1 v1.5 signature; with no digest, `data` is signed as is.
    fn sign(
        &self,
        digest: Option<DigestType>,
        key: &RsaPrivateKeyMaterial,
        data: &[u8],
    ) -> TokenResult<Vec<u8>>;

    /// `Ok(false)` when the signature does not match.
    fn verify(
        &self,
        digest: Option<DigestType>,
        key: &RsaPublicKeyMaterial,
        data: &[u8],
        signature: &[u8],
    ) -> TokenResult<bool>;

    fn digest(&self, algorithm: DigestType) -> TokenResult<Box<dyn DigestContext>>;

    fn hash(&self, algorithm: DigestType, data: &[u8]) -> TokenResult<Vec<u8>> {
        let mut context = self.digest(algorithm)?;
        context.update(data)?;
        context.finalize()
    }

    fn random_bytes(&self, len: usize) -> TokenResult<Zeroizing<Vec<u8>>>;

    /// A fresh secret key of `len` bytes; DES keys come out with odd parity.
    fn generate_random_key(&self, key_type: KeyType, len: usize)
    -> TokenResult<SecretKeyMaterial>;

    fn generate_rsa_keypair(
        &self,
        bits: usize,
        public_exponent: &[u8],
    ) -> TokenResult<(RsaPublicKeyMaterial, RsaPrivateKeyMaterial)>;

    /// PKCS#8 DER encoding of a private key.
    fn encode_rsa_private_key(&self, key: &RsaPrivateKeyMaterial)
    -> TokenResult<Zeroizing<Vec<u8>>>;

    fn decode_rsa_private_key(&self, der: &[u8]) -> TokenResult<RsaPrivateKeyMaterial>;
}

#[cfg(test)]
mod tests {
    use super::modulus_bits;

    #[test]
    fn significant_bits() {
        assert_eq!(modulus_bits(&[]), 0);
        assert_eq!(modulus_bits(&[0, 0]), 0);
        assert_eq!(modulus_bits(&[0x01, 0x00, 0x01]), 17);
        assert_eq!(modulus_bits(&[0x00, 0x80, 0x00]), 16);
        assert_eq!(modulus_bits(&[0xff; 128]), 1024);
    }
}
