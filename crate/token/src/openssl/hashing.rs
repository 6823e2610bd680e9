// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use openssl::hash::{Hasher, MessageDigest};

use crate::{
    TokenResult,
    traits::{DigestContext, DigestType},
};

#[must_use]
pub fn digest_type_to_openssl(digest: DigestType) -> MessageDigest {
    match digest {
        DigestType::Sha1 => MessageDigest::sha1(),
        DigestType::Sha224 => MessageDigest::sha224(),
        DigestType::Sha256 => MessageDigest::sha256(),
        DigestType::Sha384 => MessageDigest::sha384(),
        DigestType::Sha512 => MessageDigest::sha512(),
    }
}

pub(crate) struct OpensslDigest(Hasher);

impl OpensslDigest {
    pub(crate) fn new(digest: DigestType) -> TokenResult<Self> {
        Ok(Self(Hasher::new(digest_type_to_openssl(digest))?))
    }
}

impl DigestContext for OpensslDigest {
    fn update(&mut self, data: &[u8]) -> TokenResult<()> {
        Ok(self.0.update(data)?)
    }

    fn finalize(&mut self) -> TokenResult<Vec<u8>> {
        Ok(self.0.finish()?.to_vec())
    }
}
