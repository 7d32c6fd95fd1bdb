// Copyright (C) Microsoft Corporation. All rights reserved.

//! OpenSSL block cipher products (AES, DES and triple DES).

use openssl::symm::Cipher;
use openssl::symm::Crypter;
use openssl::symm::Mode;

use super::*;

const AES_KEY_SIZES: &[usize] = &[16, 24, 32];
const DES_KEY_SIZES: &[usize] = &[8];
const DES3_KEY_SIZES: &[usize] = &[16, 24];

/// AES in ECB, CBC and CTR modes.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsslAes;

/// Single DES in ECB and CBC modes.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsslDes;

/// Two and three key triple DES in ECB and CBC modes.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsslDes3;

impl OsslAes {
    fn cipher(mode: SymMode, key_len: usize) -> FactoryResult<Cipher> {
        let cipher = match (mode, key_len) {
            (SymMode::Ecb, 16) => Cipher::aes_128_ecb(),
            (SymMode::Ecb, 24) => Cipher::aes_192_ecb(),
            (SymMode::Ecb, 32) => Cipher::aes_256_ecb(),
            (SymMode::Cbc, 16) => Cipher::aes_128_cbc(),
            (SymMode::Cbc, 24) => Cipher::aes_192_cbc(),
            (SymMode::Cbc, 32) => Cipher::aes_256_cbc(),
            (SymMode::Ctr, 16) => Cipher::aes_128_ctr(),
            (SymMode::Ctr, 24) => Cipher::aes_192_ctr(),
            (SymMode::Ctr, 32) => Cipher::aes_256_ctr(),
            _ => Err(FactoryError::InvalidParameter(format!(
                "invalid AES key size {key_len}"
            )))?,
        };
        Ok(cipher)
    }
}

impl OsslDes {
    fn cipher(mode: SymMode, key_len: usize) -> FactoryResult<Cipher> {
        if key_len != 8 {
            Err(FactoryError::InvalidParameter(format!(
                "invalid DES key size {key_len}"
            )))?;
        }
        match mode {
            SymMode::Ecb => Ok(Cipher::des_ecb()),
            SymMode::Cbc => Ok(Cipher::des_cbc()),
            SymMode::Ctr => Err(unsupported_mode(SymAlgo::Des, mode)),
        }
    }
}

impl OsslDes3 {
    fn cipher(mode: SymMode, key_len: usize) -> FactoryResult<Cipher> {
        if !DES3_KEY_SIZES.contains(&key_len) {
            Err(FactoryError::InvalidParameter(format!(
                "invalid 3DES key size {key_len}"
            )))?;
        }
        match mode {
            SymMode::Ecb => Ok(Cipher::des_ede3()),
            SymMode::Cbc => Ok(Cipher::des_ede3_cbc()),
            SymMode::Ctr => Err(unsupported_mode(SymAlgo::Des3, mode)),
        }
    }

    /// Expands a two key (K1, K2) bundle to K1 K2 K1.
    fn expand_key(key: &[u8]) -> Vec<u8> {
        let mut expanded = key.to_vec();
        if key.len() == 16 {
            expanded.extend_from_slice(&key[..8]);
        }
        expanded
    }
}

fn unsupported_mode(kind: SymAlgo, mode: SymMode) -> FactoryError {
    FactoryError::InvalidParameter(format!("{kind} does not support {mode:?} mode"))
}

fn run_cipher(
    cipher: Cipher,
    direction: Mode,
    key: &[u8],
    iv: Option<&[u8]>,
    data: &[u8],
    padding: bool,
) -> FactoryResult<Vec<u8>> {
    match (cipher.iv_len(), iv) {
        (Some(len), Some(iv)) if iv.len() != len => Err(FactoryError::InvalidParameter(format!(
            "IV must be {len} bytes, got {}",
            iv.len()
        )))?,
        (Some(_), None) => Err(FactoryError::InvalidParameter("IV required".into()))?,
        _ => {}
    }
    let iv = cipher.iv_len().and(iv);

    let mut crypter = Crypter::new(cipher, direction, key, iv)?;
    crypter.pad(padding);

    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut len = crypter.update(data, &mut out)?;
    len += crypter.finalize(&mut out[len..])?;
    out.truncate(len);
    Ok(out)
}

impl SymmetricAlgorithm for OsslAes {
    fn kind(&self) -> SymAlgo {
        SymAlgo::Aes
    }

    fn block_size(&self) -> usize {
        16
    }

    fn key_sizes(&self) -> &'static [usize] {
        AES_KEY_SIZES
    }

    fn encrypt(
        &self,
        mode: SymMode,
        key: &[u8],
        iv: Option<&[u8]>,
        data: &[u8],
        padding: bool,
    ) -> FactoryResult<Vec<u8>> {
        let cipher = Self::cipher(mode, key.len())?;
        run_cipher(cipher, Mode::Encrypt, key, iv, data, padding)
    }

    fn decrypt(
        &self,
        mode: SymMode,
        key: &[u8],
        iv: Option<&[u8]>,
        data: &[u8],
        padding: bool,
    ) -> FactoryResult<Vec<u8>> {
        let cipher = Self::cipher(mode, key.len())?;
        run_cipher(cipher, Mode::Decrypt, key, iv, data, padding)
    }
}

impl SymmetricAlgorithm for OsslDes {
    fn kind(&self) -> SymAlgo {
        SymAlgo::Des
    }

    fn block_size(&self) -> usize {
        8
    }

    fn key_sizes(&self) -> &'static [usize] {
        DES_KEY_SIZES
    }

    fn encrypt(
        &self,
        mode: SymMode,
        key: &[u8],
        iv: Option<&[u8]>,
        data: &[u8],
        padding: bool,
    ) -> FactoryResult<Vec<u8>> {
        let cipher = Self::cipher(mode, key.len())?;
        run_cipher(cipher, Mode::Encrypt, key, iv, data, padding)
    }

    fn decrypt(
        &self,
        mode: SymMode,
        key: &[u8],
        iv: Option<&[u8]>,
        data: &[u8],
        padding: bool,
    ) -> FactoryResult<Vec<u8>> {
        let cipher = Self::cipher(mode, key.len())?;
        run_cipher(cipher, Mode::Decrypt, key, iv, data, padding)
    }
}

impl SymmetricAlgorithm for OsslDes3 {
    fn kind(&self) -> SymAlgo {
        SymAlgo::Des3
    }

    fn block_size(&self) -> usize {
        8
    }

    fn key_sizes(&self) -> &'static [usize] {
        DES3_KEY_SIZES
    }

    fn encrypt(
        &self,
        mode: SymMode,
        key: &[u8],
        iv: Option<&[u8]>,
        data: &[u8],
        padding: bool,
    ) -> FactoryResult<Vec<u8>> {
        let cipher = Self::cipher(mode, key.len())?;
        let key = Self::expand_key(key);
        run_cipher(cipher, Mode::Encrypt, &key, iv, data, padding)
    }

    fn decrypt(
        &self,
        mode: SymMode,
        key: &[u8],
        iv: Option<&[u8]>,
        data: &[u8],
        padding: bool,
    ) -> FactoryResult<Vec<u8>> {
        let cipher = Self::cipher(mode, key.len())?;
        let key = Self::expand_key(key);
        run_cipher(cipher, Mode::Decrypt, &key, iv, data, padding)
    }
}
