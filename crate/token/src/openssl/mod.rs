// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

//! [`CryptoBackend`] implementation over OpenSSL.

mod hashing;
mod rsa;
mod symmetric;

pub use hashing::digest_type_to_openssl;
use tracing::trace;
use zeroize::Zeroizing;

use crate::{
    TokenResult,
    core::attribute::KeyType,
    openssl::{hashing::OpensslDigest, symmetric::OpensslCipher},
    traits::{
        CipherContext, CipherDirection, CryptoBackend, DigestContext, DigestType,
        RsaPrivateKeyMaterial, RsaPublicKeyMaterial, SecretKeyMaterial, SymmetricSpec,
    },
};

#[derive(Debug, Default, Clone, Copy)]
pub struct OpensslBackend;

impl CryptoBackend for OpensslBackend {
    fn rsa_encrypt(&self, key: &RsaPublicKeyMaterial, data: &[u8]) -> TokenResult<Vec<u8>> {
        rsa::encrypt(key, data)
    }

    fn rsa_decrypt(
        &self,
        key: &RsaPrivateKeyMaterial,
        data: &[u8],
    ) -> TokenResult<Zeroizing<Vec<u8>>> {
        rsa::decrypt(key, data)
    }

    fn symmetric_cipher(
        &self,
        spec: &SymmetricSpec,
        key: &SecretKeyMaterial,
        direction: CipherDirection,
    ) -> TokenResult<Box<dyn CipherContext>> {
        Ok(Box::new(OpensslCipher::new(spec, key, direction)?))
    }

    fn sign(
        &self,
        digest: Option<DigestType>,
        key: &RsaPrivateKeyMaterial,
        data: &[u8],
    ) -> TokenResult<Vec<u8>> {
        rsa::sign(digest, key, data)
    }

    fn verify(
        &self,
        digest: Option<DigestType>,
        key: &RsaPublicKeyMaterial,
        data: &[u8],
        signature: &[u8],
    ) -> TokenResult<bool> {
        rsa::verify(digest, key, data, signature)
    }

    fn digest(&self, algorithm: DigestType) -> TokenResult<Box<dyn DigestContext>> {
        Ok(Box::new(OpensslDigest::new(algorithm)?))
    }

    fn random_bytes(&self, len: usize) -> TokenResult<Zeroizing<Vec<u8>>> {
        let mut buffer = Zeroizing::new(vec![0; len]);
        ::openssl::rand::rand_bytes(&mut buffer)?;
        Ok(buffer)
    }

    fn generate_random_key(
        &self,
        key_type: KeyType,
        len: usize,
    ) -> TokenResult<SecretKeyMaterial> {
        key_type.check_value_len(len)?;
        let mut value = self.random_bytes(len)?;
        if matches!(key_type, KeyType::Des2 | KeyType::Des3) {
            symmetric::set_des_parity(&mut value);
        }
        trace!("generated a {len} bytes {key_type} key");
        Ok(SecretKeyMaterial::new(key_type, value.to_vec()))
    }

    fn generate_rsa_keypair(
        &self,
        bits: usize,
        public_exponent: &[u8],
    ) -> TokenResult<(RsaPublicKeyMaterial, RsaPrivateKeyMaterial)> {
        trace!("generating a {bits} bits RSA key pair");
        rsa::generate_keypair(bits, public_exponent)
    }

    fn encode_rsa_private_key(
        &self,
        key: &RsaPrivateKeyMaterial,
    ) -> TokenResult<Zeroizing<Vec<u8>>> {
        rsa::to_pkcs8(key)
    }

    fn decode_rsa_private_key(&self, der: &[u8]) -> TokenResult<RsaPrivateKeyMaterial> {
        rsa::from_pkcs8(der)
    }
}

#[expect(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokenError;

    #[test]
    fn random_keys() {
        let backend = OpensslBackend;
        let des3 = backend.generate_random_key(KeyType::Des3, 24).unwrap();
        assert_eq!(des3.value().len(), 24);
        assert!(des3.value().iter().all(|b| b.count_ones() % 2 == 1));
        let aes = backend.generate_random_key(KeyType::Aes, 32).unwrap();
        assert_eq!(aes.value().len(), 32);
        assert!(matches!(
            backend.generate_random_key(KeyType::Des2, 24),
            Err(TokenError::AttributeValueInvalid(..))
        ));
        assert_ne!(
            backend.random_bytes(32).unwrap(),
            backend.random_bytes(32).unwrap()
        );
    }

    #[test]
    fn hash_known_answer() {
        let digest = OpensslBackend
            .hash(DigestType::Sha256, b"secret text")
            .unwrap();
        assert_eq!(
            hex::encode(digest),
            "486a2d2abec341f9a9513329e29ea386e98b2a280d38d12a0b4a53c92ad8b26b"
        );
    }
}
