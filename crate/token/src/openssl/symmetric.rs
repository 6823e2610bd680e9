// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use openssl::symm::{Cipher, Crypter, Mode};
use zeroize::Zeroizing;

use crate::{
    TokenError, TokenResult,
    core::attribute::KeyType,
    traits::{BlockCipher, CipherContext, CipherDirection, CipherMode, SecretKeyMaterial, SymmetricSpec},
};

fn openssl_cipher(spec: &SymmetricSpec, key_len: usize) -> TokenResult<Cipher> {
    let cbc = matches!(spec.mode, CipherMode::Cbc { .. });
    Ok(match (spec.cipher, key_len, cbc) {
        (BlockCipher::Des3, 24, false) => Cipher::des_ede3(),
        (BlockCipher::Des3, 24, true) => Cipher::des_ede3_cbc(),
        (BlockCipher::Aes, 16, false) => Cipher::aes_128_ecb(),
        (BlockCipher::Aes, 16, true) => Cipher::aes_128_cbc(),
        (BlockCipher::Aes, 24, false) => Cipher::aes_192_ecb(),
        (BlockCipher::Aes, 24, true) => Cipher::aes_192_cbc(),
        (BlockCipher::Aes, 32, false) => Cipher::aes_256_ecb(),
        (BlockCipher::Aes, 32, true) => Cipher::aes_256_cbc(),
        (cipher, len, _) => {
            return Err(TokenError::KeySizeRange(format!(
                "{len} bytes is not a valid {cipher} key length"
            )));
        }
    })
}

/// DES-EDE3 key bytes: two-key values are expanded to K1 K2 K1.
fn des3_key(key: &SecretKeyMaterial) -> Zeroizing<Vec<u8>> {
    let value = key.value();
    let mut expanded = Zeroizing::new(value.to_vec());
    if key.key_type() == KeyType::Des2 && value.len() == 16 {
        expanded.extend_from_slice(&value[..8]);
    }
    expanded
}

/// Force odd parity on every byte of a DES key.
pub(crate) fn set_des_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        let high = *byte & 0xfe;
        *byte = if high.count_ones() % 2 == 0 { high | 1 } else { high };
    }
}

pub(crate) struct OpensslCipher {
    crypter: Crypter,
    direction: CipherDirection,
    block_size: usize,
    padding: bool,
    processed: usize,
}

impl OpensslCipher {
    pub(crate) fn new(
        spec: &SymmetricSpec,
        key: &SecretKeyMaterial,
        direction: CipherDirection,
    ) -> TokenResult<Self> {
        let key_bytes = match spec.cipher {
            BlockCipher::Des3 => des3_key(key),
            BlockCipher::Aes => Zeroizing::new(key.value().to_vec()),
        };
        let cipher = openssl_cipher(spec, key_bytes.len())?;
        let iv = match &spec.mode {
            CipherMode::Ecb => None,
            CipherMode::Cbc { iv } => Some(iv.as_slice()),
        };
        let mode = match direction {
            CipherDirection::Encrypt => Mode::Encrypt,
            CipherDirection::Decrypt => Mode::Decrypt,
        };
        let mut crypter = Crypter::new(cipher, mode, &key_bytes, iv)?;
        crypter.pad(spec.padding);
        Ok(Self {
            crypter,
            direction,
            block_size: cipher.block_size(),
            padding: spec.padding,
            processed: 0,
        })
    }
}

impl CipherContext for OpensslCipher {
    fn update(&mut self, input: &[u8]) -> TokenResult<Vec<u8>> {
        let mut output = vec![0; input.len() + self.block_size];
        let len = self.crypter.update(input, &mut output)?;
        output.truncate(len);
        self.processed += input.len();
        Ok(output)
    }

    fn finalize(&mut self) -> TokenResult<Vec<u8>> {
        let must_align = !self.padding || self.direction == CipherDirection::Decrypt;
        if must_align && self.processed % self.block_size != 0 {
            return Err(TokenError::DataLengthInvalid(format!(
                "{} bytes is not a multiple of the {} bytes block",
                self.processed, self.block_size
            )));
        }
        let mut output = vec![0; self.block_size];
        let len = self.crypter.finalize(&mut output)?;
        output.truncate(len);
        Ok(output)
    }
}

#[expect(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn des2() -> SecretKeyMaterial {
        SecretKeyMaterial::new(KeyType::Des2, b"0123456789abcdef".to_vec())
    }

    fn ecb() -> SymmetricSpec {
        SymmetricSpec {
            cipher: BlockCipher::Des3,
            mode: CipherMode::Ecb,
            padding: false,
        }
    }

    #[test]
    fn des2_key_check_value() {
        let mut cipher = OpensslCipher::new(&ecb(), &des2(), CipherDirection::Encrypt).unwrap();
        let mut kcv = cipher.update(&[0; 8]).unwrap();
        kcv.extend(cipher.finalize().unwrap());
        assert_eq!(hex::encode(kcv), "761fd098576a0e80");
    }

    #[test]
    fn unaligned_input_without_padding() {
        let mut cipher = OpensslCipher::new(&ecb(), &des2(), CipherDirection::Encrypt).unwrap();
        assert!(cipher.update(&[0; 5]).unwrap().is_empty());
        assert!(matches!(
            cipher.finalize(),
            Err(TokenError::DataLengthInvalid(_))
        ));
    }

    #[test]
    fn cbc_pad_round_trip_across_chunks() {
        let spec = SymmetricSpec {
            cipher: BlockCipher::Aes,
            mode: CipherMode::Cbc { iv: vec![3; 16] },
            padding: true,
        };
        let key = SecretKeyMaterial::new(KeyType::Aes, vec![0x42; 32]);
        let plaintext = b"a message which spans more than two AES blocks";

        let mut encrypt = OpensslCipher::new(&spec, &key, CipherDirection::Encrypt).unwrap();
        let mut ciphertext = encrypt.update(&plaintext[..7]).unwrap();
        ciphertext.extend(encrypt.update(&plaintext[7..]).unwrap());
        ciphertext.extend(encrypt.finalize().unwrap());
        assert_eq!(ciphertext.len(), 48);

        let mut decrypt = OpensslCipher::new(&spec, &key, CipherDirection::Decrypt).unwrap();
        let mut recovered = Vec::new();
        for chunk in ciphertext.chunks(5) {
            recovered.extend(decrypt.update(chunk).unwrap());
        }
        recovered.extend(decrypt.finalize().unwrap());
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn parity_is_odd() {
        let mut key = [0x00, 0x01, 0xfe, 0xff, 0x20];
        set_des_parity(&mut key);
        assert_eq!(key, [0x01, 0x01, 0xfe, 0xfe, 0x20]);
        assert!(key.iter().all(|b| b.count_ones() % 2 == 1));
    }
}
