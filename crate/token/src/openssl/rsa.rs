// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use openssl::{
    bn::BigNum,
    memcmp,
    pkey::{PKey, Private, Public},
    pkey_ctx::PkeyCtx,
    rsa::{Padding, Rsa, RsaPrivateKeyBuilder},
    sign::{Signer, Verifier},
};
use tracing::trace;
use zeroize::Zeroizing;

use crate::{
    TokenError, TokenResult,
    openssl::hashing::digest_type_to_openssl,
    traits::{DigestType, RsaPrivateKeyMaterial, RsaPublicKeyMaterial},
};

fn public_key(key: &RsaPublicKeyMaterial) -> TokenResult<PKey<Public>> {
    let rsa = Rsa::from_public_components(
        BigNum::from_slice(&key.modulus)?,
        BigNum::from_slice(&key.public_exponent)?,
    )?;
    Ok(PKey::from_rsa(rsa)?)
}

fn private_rsa(key: &RsaPrivateKeyMaterial) -> TokenResult<Rsa<Private>> {
    let n = BigNum::from_slice(&key.modulus)?;
    let e = BigNum::from_slice(&key.public_exponent)?;
    let d = BigNum::from_slice(&key.private_exponent)?;
    let rsa = match (
        &key.prime_1,
        &key.prime_2,
        &key.exponent_1,
        &key.exponent_2,
        &key.coefficient,
    ) {
        (Some(p), Some(q), Some(dp), Some(dq), Some(qi)) => Rsa::from_private_components(
            n,
            e,
            d,
            BigNum::from_slice(p)?,
            BigNum::from_slice(q)?,
            BigNum::from_slice(dp)?,
            BigNum::from_slice(dq)?,
            BigNum::from_slice(qi)?,
        )?,
        _ => {
            trace!("building an RSA private key without CRT parameters");
            RsaPrivateKeyBuilder::new(n, e, d)?.build()
        }
    };
    Ok(rsa)
}

fn private_key(key: &RsaPrivateKeyMaterial) -> TokenResult<PKey<Private>> {
    Ok(PKey::from_rsa(private_rsa(key)?)?)
}

fn material(rsa: &Rsa<Private>) -> RsaPrivateKeyMaterial {
    RsaPrivateKeyMaterial {
        modulus: rsa.n().to_vec(),
        public_exponent: rsa.e().to_vec(),
        private_exponent: rsa.d().to_vec(),
        prime_1: rsa.p().map(|v| v.to_vec()),
        prime_2: rsa.q().map(|v| v.to_vec()),
        exponent_1: rsa.dmp1().map(|v| v.to_vec()),
        exponent_2: rsa.dmq1().map(|v| v.to_vec()),
        coefficient: rsa.iqmp().map(|v| v.to_vec()),
    }
}

pub(crate) fn encrypt(key: &RsaPublicKeyMaterial, data: &[u8]) -> TokenResult<Vec<u8>> {
    let pkey = public_key(key)?;
    let mut ctx = PkeyCtx::new(&pkey)?;
    ctx.encrypt_init()?;
    ctx.set_rsa_padding(Padding::PKCS1)?;
    let mut ciphertext = Vec::new();
    ctx.encrypt_to_vec(data, &mut ciphertext)?;
    Ok(ciphertext)
}

pub(crate) fn decrypt(key: &RsaPrivateKeyMaterial, data: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
    let pkey = private_key(key)?;
    let mut ctx = PkeyCtx::new(&pkey)?;
    ctx.decrypt_init()?;
    ctx.set_rsa_padding(Padding::PKCS1)?;
    let mut plaintext = Zeroizing::new(Vec::new());
    ctx.decrypt_to_vec(data, &mut plaintext)?;
    Ok(plaintext)
}

pub(crate) fn sign(
    digest: Option<DigestType>,
    key: &RsaPrivateKeyMaterial,
    data: &[u8],
) -> TokenResult<Vec<u8>> {
    let pkey = private_key(key)?;
    if let Some(digest) = digest {
        let mut signer = Signer::new(digest_type_to_openssl(digest), &pkey)?;
        signer.set_rsa_padding(Padding::PKCS1)?;
        signer.update(data)?;
        return Ok(signer.sign_to_vec()?);
    }
    // raw PKCS#1 v1.5 block type 1 over the data as given
    let mut ctx = PkeyCtx::new(&pkey)?;
    ctx.sign_init()?;
    ctx.set_rsa_padding(Padding::PKCS1)?;
    let mut signature = Vec::new();
    ctx.sign_to_vec(data, &mut signature)?;
    Ok(signature)
}

pub(crate) fn verify(
    digest: Option<DigestType>,
    key: &RsaPublicKeyMaterial,
    data: &[u8],
    signature: &[u8],
) -> TokenResult<bool> {
    // a padding failure is a mismatch, not an error
    match digest {
        Some(digest) => {
            let pkey = public_key(key)?;
            let mut verifier = Verifier::new(digest_type_to_openssl(digest), &pkey)?;
            verifier.set_rsa_padding(Padding::PKCS1)?;
            verifier.update(data)?;
            Ok(verifier.verify(signature).unwrap_or(false))
        }
        None => {
            let rsa = Rsa::from_public_components(
                BigNum::from_slice(&key.modulus)?,
                BigNum::from_slice(&key.public_exponent)?,
            )?;
            let mut recovered = vec![0; usize::try_from(rsa.size())?];
            let Ok(len) = rsa.public_decrypt(signature, &mut recovered, Padding::PKCS1) else {
                return Ok(false);
            };
            Ok(len == data.len() && memcmp::eq(&recovered[..len], data))
        }
    }
}

pub(crate) fn generate_keypair(
    bits: usize,
    public_exponent: &[u8],
) -> TokenResult<(RsaPublicKeyMaterial, RsaPrivateKeyMaterial)> {
    let exponent = BigNum::from_slice(public_exponent)?;
    let rsa = Rsa::generate_with_e(u32::try_from(bits)?, &exponent)?;
    let private = material(&rsa);
    Ok((private.public_key(), private))
}

pub(crate) fn to_pkcs8(key: &RsaPrivateKeyMaterial) -> TokenResult<Zeroizing<Vec<u8>>> {
    Ok(Zeroizing::new(private_key(key)?.private_key_to_pkcs8()?))
}

pub(crate) fn from_pkcs8(der: &[u8]) -> TokenResult<RsaPrivateKeyMaterial> {
    let pkey = PKey::private_key_from_pkcs8(der)?;
    let rsa = pkey
        .rsa()
        .map_err(|e| TokenError::BackendFailure(format!("not an RSA private key: {e}")))?;
    Ok(material(&rsa))
}
