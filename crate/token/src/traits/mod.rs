// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use strum_macros::Display;

mod backend;
pub use backend::{
    CipherContext, CryptoBackend, DigestContext, RsaPrivateKeyMaterial, RsaPublicKeyMaterial,
    SecretKeyMaterial, modulus_bits,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestType {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestType {
    #[must_use]
    pub const fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockCipher {
    /// Triple DES; two-key (DES2) values are expanded to K1 K2 K1.
    Des3,
    Aes,
}

impl BlockCipher {
    #[must_use]
    pub const fn block_len(&self) -> usize {
        match self {
            Self::Des3 => 8,
            Self::Aes => 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherMode {
    Ecb,
    Cbc { iv: Vec<u8> },
}

/// Everything a backend needs to instantiate a block cipher, key aside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymmetricSpec {
    pub cipher: BlockCipher,
    pub mode: CipherMode,
    /// PKCS#7 padding
    pub padding: bool,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    Encrypt,
    Decrypt,
}
