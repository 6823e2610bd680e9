// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use bitflags::bitflags;
use cryptoki_sys::{
    CK_FLAGS, CK_MECHANISM_TYPE, CKF_DECRYPT, CKF_DIGEST, CKF_ENCRYPT, CKF_GENERATE,
    CKF_GENERATE_KEY_PAIR, CKF_SIGN, CKF_UNWRAP, CKF_VERIFY, CKF_WRAP, CKM_AES_CBC,
    CKM_AES_CBC_PAD, CKM_AES_ECB, CKM_AES_KEY_GEN, CKM_DES2_KEY_GEN, CKM_DES3_CBC,
    CKM_DES3_CBC_PAD, CKM_DES3_ECB, CKM_DES3_KEY_GEN, CKM_RSA_PKCS, CKM_RSA_PKCS_KEY_PAIR_GEN,
    CKM_SHA_1, CKM_SHA1_RSA_PKCS, CKM_SHA224, CKM_SHA224_RSA_PKCS, CKM_SHA256,
    CKM_SHA256_RSA_PKCS, CKM_SHA384, CKM_SHA384_RSA_PKCS, CKM_SHA512, CKM_SHA512_RSA_PKCS,
};
use strum_macros::{Display, EnumIter};
use tracing::{debug, error};

use crate::{
    TokenError, TokenResult,
    core::{
        attribute::{AttributeType, KeyType, ObjectClass},
        object::CryptoObject,
    },
    traits::{BlockCipher, CipherMode, DigestType, SymmetricSpec},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum MechanismType {
    RsaPkcs,
    Sha1RsaPkcs,
    Sha224RsaPkcs,
    Sha256RsaPkcs,
    Sha384RsaPkcs,
    Sha512RsaPkcs,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Des3Ecb,
    Des3Cbc,
    Des3CbcPad,
    AesEcb,
    AesCbc,
    AesCbcPad,
    Des2KeyGen,
    Des3KeyGen,
    AesKeyGen,
    RsaPkcsKeyPairGen,
}

impl TryFrom<CK_MECHANISM_TYPE> for MechanismType {
    type Error = TokenError;

    fn try_from(mechanism: CK_MECHANISM_TYPE) -> TokenResult<Self> {
        match mechanism {
            CKM_RSA_PKCS => Ok(Self::RsaPkcs),
            CKM_SHA1_RSA_PKCS => Ok(Self::Sha1RsaPkcs),
            CKM_SHA224_RSA_PKCS => Ok(Self::Sha224RsaPkcs),
            CKM_SHA256_RSA_PKCS => Ok(Self::Sha256RsaPkcs),
            CKM_SHA384_RSA_PKCS => Ok(Self::Sha384RsaPkcs),
            CKM_SHA512_RSA_PKCS => Ok(Self::Sha512RsaPkcs),
            CKM_SHA_1 => Ok(Self::Sha1),
            CKM_SHA224 => Ok(Self::Sha224),
            CKM_SHA256 => Ok(Self::Sha256),
            CKM_SHA384 => Ok(Self::Sha384),
            CKM_SHA512 => Ok(Self::Sha512),
            CKM_DES3_ECB => Ok(Self::Des3Ecb),
            CKM_DES3_CBC => Ok(Self::Des3Cbc),
            CKM_DES3_CBC_PAD => Ok(Self::Des3CbcPad),
            CKM_AES_ECB => Ok(Self::AesEcb),
            CKM_AES_CBC => Ok(Self::AesCbc),
            CKM_AES_CBC_PAD => Ok(Self::AesCbcPad),
            CKM_DES2_KEY_GEN => Ok(Self::Des2KeyGen),
            CKM_DES3_KEY_GEN => Ok(Self::Des3KeyGen),
            CKM_AES_KEY_GEN => Ok(Self::AesKeyGen),
            CKM_RSA_PKCS_KEY_PAIR_GEN => Ok(Self::RsaPkcsKeyPairGen),
            _ => {
                error!("unsupported mechanism: {mechanism:#x}");
                Err(TokenError::MechanismTypeInvalid(mechanism))
            }
        }
    }
}

impl From<MechanismType> for CK_MECHANISM_TYPE {
    fn from(mechanism: MechanismType) -> Self {
        match mechanism {
            MechanismType::RsaPkcs => CKM_RSA_PKCS,
            MechanismType::Sha1RsaPkcs => CKM_SHA1_RSA_PKCS,
            MechanismType::Sha224RsaPkcs => CKM_SHA224_RSA_PKCS,
            MechanismType::Sha256RsaPkcs => CKM_SHA256_RSA_PKCS,
            MechanismType::Sha384RsaPkcs => CKM_SHA384_RSA_PKCS,
            MechanismType::Sha512RsaPkcs => CKM_SHA512_RSA_PKCS,
            MechanismType::Sha1 => CKM_SHA_1,
            MechanismType::Sha224 => CKM_SHA224,
            MechanismType::Sha256 => CKM_SHA256,
            MechanismType::Sha384 => CKM_SHA384,
            MechanismType::Sha512 => CKM_SHA512,
            MechanismType::Des3Ecb => CKM_DES3_ECB,
            MechanismType::Des3Cbc => CKM_DES3_CBC,
            MechanismType::Des3CbcPad => CKM_DES3_CBC_PAD,
            MechanismType::AesEcb => CKM_AES_ECB,
            MechanismType::AesCbc => CKM_AES_CBC,
            MechanismType::AesCbcPad => CKM_AES_CBC_PAD,
            MechanismType::Des2KeyGen => CKM_DES2_KEY_GEN,
            MechanismType::Des3KeyGen => CKM_DES3_KEY_GEN,
            MechanismType::AesKeyGen => CKM_AES_KEY_GEN,
            MechanismType::RsaPkcsKeyPairGen => CKM_RSA_PKCS_KEY_PAIR_GEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismParameter {
    Iv(Vec<u8>),
}

/// A mechanism identifier with its optional parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub mechanism_type: MechanismType,
    pub parameter: Option<MechanismParameter>,
}

impl Mechanism {
    #[must_use]
    pub const fn new(mechanism_type: MechanismType) -> Self {
        Self {
            mechanism_type,
            parameter: None,
        }
    }

    #[must_use]
    pub fn with_iv(mechanism_type: MechanismType, iv: &[u8]) -> Self {
        Self {
            mechanism_type,
            parameter: Some(MechanismParameter::Iv(iv.to_vec())),
        }
    }
}

impl From<MechanismType> for Mechanism {
    fn from(mechanism_type: MechanismType) -> Self {
        Self::new(mechanism_type)
    }
}

/// What a key is about to be used for.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Wrap,
    Unwrap,
}

impl KeyUsage {
    /// The boolean attribute that must be true on the key.
    #[must_use]
    pub const fn flag(self) -> AttributeType {
        match self {
            Self::Encrypt => AttributeType::Encrypt,
            Self::Decrypt => AttributeType::Decrypt,
            Self::Sign => AttributeType::Sign,
            Self::Verify => AttributeType::Verify,
            Self::Wrap => AttributeType::Wrap,
            Self::Unwrap => AttributeType::Unwrap,
        }
    }

    /// Usages performed with the public half of an asymmetric pair.
    #[must_use]
    pub const fn is_public(self) -> bool {
        matches!(self, Self::Encrypt | Self::Verify | Self::Wrap)
    }
}

/// A backend capability a mechanism resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// RSA PKCS#1 v1.5, hashing the data first when a digest is set.
    Rsa { digest: Option<DigestType> },
    BlockCipher(SymmetricSpec),
    Digest(DigestType),
    KeyGeneration(KeyType),
    KeyPairGeneration(KeyType),
}

impl Capability {
    #[must_use]
    pub const fn supports(&self, usage: KeyUsage) -> bool {
        match self {
            Self::Rsa { digest: None } | Self::BlockCipher(_) => true,
            Self::Rsa { digest: Some(_) } => matches!(usage, KeyUsage::Sign | KeyUsage::Verify),
            Self::Digest(_) | Self::KeyGeneration(_) | Self::KeyPairGeneration(_) => false,
        }
    }

    /// Class and key types a key must have to serve `usage` under this capability.
    #[must_use]
    pub const fn key_requirement(&self, usage: KeyUsage) -> Option<(ObjectClass, &'static [KeyType])> {
        match self {
            Self::Rsa { .. } => {
                let class = if usage.is_public() {
                    ObjectClass::PublicKey
                } else {
                    ObjectClass::PrivateKey
                };
                Some((class, &[KeyType::Rsa]))
            }
            Self::BlockCipher(SymmetricSpec {
                cipher: BlockCipher::Des3,
                ..
            }) => Some((ObjectClass::SecretKey, &[KeyType::Des2, KeyType::Des3])),
            Self::BlockCipher(SymmetricSpec {
                cipher: BlockCipher::Aes,
                ..
            }) => Some((ObjectClass::SecretKey, &[KeyType::Aes])),
            Self::Digest(_) | Self::KeyGeneration(_) | Self::KeyPairGeneration(_) => None,
        }
    }
}

fn block_cipher(
    mechanism: &Mechanism,
    cipher: BlockCipher,
    cbc: bool,
    padding: bool,
) -> TokenResult<Capability> {
    let mode = if cbc {
        match &mechanism.parameter {
            Some(MechanismParameter::Iv(iv)) if iv.len() == cipher.block_len() => {
                CipherMode::Cbc { iv: iv.clone() }
            }
            Some(MechanismParameter::Iv(iv)) => {
                return Err(TokenError::MechanismParameterMismatch(format!(
                    "{} requires a {} bytes IV, got {} bytes",
                    mechanism.mechanism_type,
                    cipher.block_len(),
                    iv.len()
                )));
            }
            None => {
                return Err(TokenError::MechanismParameterMismatch(format!(
                    "{} requires an IV",
                    mechanism.mechanism_type
                )));
            }
        }
    } else {
        CipherMode::Ecb
    };
    Ok(Capability::BlockCipher(SymmetricSpec {
        cipher,
        mode,
        padding,
    }))
}

/// Map a mechanism to the backend capability it names, checking its parameter.
pub fn resolve(mechanism: &Mechanism) -> TokenResult<Capability> {
    let mechanism_type = mechanism.mechanism_type;
    let takes_iv = matches!(
        mechanism_type,
        MechanismType::Des3Cbc
            | MechanismType::Des3CbcPad
            | MechanismType::AesCbc
            | MechanismType::AesCbcPad
    );
    if !takes_iv && mechanism.parameter.is_some() {
        return Err(TokenError::MechanismParameterMismatch(format!(
            "{mechanism_type} takes no parameter"
        )));
    }
    let capability = match mechanism_type {
        MechanismType::RsaPkcs => Capability::Rsa { digest: None },
        MechanismType::Sha1RsaPkcs => Capability::Rsa {
            digest: Some(DigestType::Sha1),
        },
        MechanismType::Sha224RsaPkcs => Capability::Rsa {
            digest: Some(DigestType::Sha224),
        },
        MechanismType::Sha256RsaPkcs => Capability::Rsa {
            digest: Some(DigestType::Sha256),
        },
        MechanismType::Sha384RsaPkcs => Capability::Rsa {
            digest: Some(DigestType::Sha384),
        },
        MechanismType::Sha512RsaPkcs => Capability::Rsa {
            digest: Some(DigestType::Sha512),
        },
        MechanismType::Sha1 => Capability::Digest(DigestType::Sha1),
        MechanismType::Sha224 => Capability::Digest(DigestType::Sha224),
        MechanismType::Sha256 => Capability::Digest(DigestType::Sha256),
        MechanismType::Sha384 => Capability::Digest(DigestType::Sha384),
        MechanismType::Sha512 => Capability::Digest(DigestType::Sha512),
        MechanismType::Des3Ecb => block_cipher(mechanism, BlockCipher::Des3, false, false)?,
        MechanismType::Des3Cbc => block_cipher(mechanism, BlockCipher::Des3, true, false)?,
        MechanismType::Des3CbcPad => block_cipher(mechanism, BlockCipher::Des3, true, true)?,
        MechanismType::AesEcb => block_cipher(mechanism, BlockCipher::Aes, false, false)?,
        MechanismType::AesCbc => block_cipher(mechanism, BlockCipher::Aes, true, false)?,
        MechanismType::AesCbcPad => block_cipher(mechanism, BlockCipher::Aes, true, true)?,
        MechanismType::Des2KeyGen => Capability::KeyGeneration(KeyType::Des2),
        MechanismType::Des3KeyGen => Capability::KeyGeneration(KeyType::Des3),
        MechanismType::AesKeyGen => Capability::KeyGeneration(KeyType::Aes),
        MechanismType::RsaPkcsKeyPairGen => Capability::KeyPairGeneration(KeyType::Rsa),
    };
    debug!("resolve: {mechanism_type} -> {capability:?}");
    Ok(capability)
}

/// Gate run before any data reaches the backend: the mechanism must support
/// `usage`, the key must be of a fitting class and type, and its usage flag set.
pub fn check_key_compatibility(
    capability: &Capability,
    usage: KeyUsage,
    key: &CryptoObject,
) -> TokenResult<()> {
    if !capability.supports(usage) {
        return Err(TokenError::MechanismInvalid(format!(
            "{capability:?} cannot be used to {usage}"
        )));
    }
    let Some((class, key_types)) = capability.key_requirement(usage) else {
        return Err(TokenError::MechanismInvalid(format!(
            "{capability:?} does not operate on keys"
        )));
    };
    let handle = key.handle();
    if key.class() != class || !key.key_type().is_some_and(|kt| key_types.contains(&kt)) {
        return Err(TokenError::KeyFunctionNotPermitted(format!(
            "key {handle} ({} {:?}) cannot {usage} with {capability:?}",
            key.class(),
            key.key_type()
        )));
    }
    if !key.attributes().get_bool(usage.flag()) {
        return Err(TokenError::KeyFunctionNotPermitted(format!(
            "key {handle} does not allow {usage}: {} is not set",
            usage.flag()
        )));
    }
    Ok(())
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MechanismFlags: CK_FLAGS {
        const ENCRYPT = CKF_ENCRYPT;
        const DECRYPT = CKF_DECRYPT;
        const DIGEST = CKF_DIGEST;
        const SIGN = CKF_SIGN;
        const VERIFY = CKF_VERIFY;
        const GENERATE = CKF_GENERATE;
        const GENERATE_KEY_PAIR = CKF_GENERATE_KEY_PAIR;
        const WRAP = CKF_WRAP;
        const UNWRAP = CKF_UNWRAP;
    }
}

/// `C_GetMechanismInfo` data; key sizes are in bits for RSA and bytes otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechanismInfo {
    pub min_key_size: usize,
    pub max_key_size: usize,
    pub flags: MechanismFlags,
}

impl MechanismType {
    #[must_use]
    pub const fn is_rsa(self) -> bool {
        matches!(
            self,
            Self::RsaPkcs
                | Self::Sha1RsaPkcs
                | Self::Sha224RsaPkcs
                | Self::Sha256RsaPkcs
                | Self::Sha384RsaPkcs
                | Self::Sha512RsaPkcs
                | Self::RsaPkcsKeyPairGen
        )
    }

    /// Static description; RSA key sizes are bounded by the token configuration.
    #[must_use]
    pub const fn info(self, min_rsa_bits: usize, max_rsa_bits: usize) -> MechanismInfo {
        let cipher = MechanismFlags::ENCRYPT
            .union(MechanismFlags::DECRYPT)
            .union(MechanismFlags::WRAP)
            .union(MechanismFlags::UNWRAP);
        let (min_key_size, max_key_size, flags) = match self {
            Self::RsaPkcs => (
                min_rsa_bits,
                max_rsa_bits,
                cipher
                    .union(MechanismFlags::SIGN)
                    .union(MechanismFlags::VERIFY),
            ),
            Self::Sha1RsaPkcs
            | Self::Sha224RsaPkcs
            | Self::Sha256RsaPkcs
            | Self::Sha384RsaPkcs
            | Self::Sha512RsaPkcs => (
                min_rsa_bits,
                max_rsa_bits,
                MechanismFlags::SIGN.union(MechanismFlags::VERIFY),
            ),
            Self::RsaPkcsKeyPairGen => {
                (min_rsa_bits, max_rsa_bits, MechanismFlags::GENERATE_KEY_PAIR)
            }
            Self::Sha1 | Self::Sha224 | Self::Sha256 | Self::Sha384 | Self::Sha512 => {
                (0, 0, MechanismFlags::DIGEST)
            }
            Self::Des3Ecb | Self::Des3Cbc | Self::Des3CbcPad => (16, 24, cipher),
            Self::AesEcb | Self::AesCbc | Self::AesCbcPad => (16, 32, cipher),
            Self::Des2KeyGen => (16, 16, MechanismFlags::GENERATE),
            Self::Des3KeyGen => (24, 24, MechanismFlags::GENERATE),
            Self::AesKeyGen => (16, 32, MechanismFlags::GENERATE),
        };
        MechanismInfo {
            min_key_size,
            max_key_size,
            flags,
        }
    }
}
