// Copyright (C) Microsoft Corporation. All rights reserved.

//! OpenSSL MAC products (HMAC and CMAC).

use std::sync::Arc;

use openssl::sign::Signer;
use openssl::symm::Cipher;

use super::hash::builtin_digest;
use super::hash::DigestSource;
use super::*;
use crate::engine::AltSuiteEngine;

/// HMAC over an OpenSSL message digest.
pub struct OsslHmac {
    kind: MacAlgo,
    digest: DigestSource,
}

impl OsslHmac {
    /// Creates an HMAC over a builtin hash.
    pub fn new(kind: MacAlgo) -> FactoryResult<Self> {
        let md = kind
            .hmac_hash()
            .and_then(builtin_digest)
            .ok_or_else(|| FactoryError::UnsupportedKind(kind.to_string()))?;
        Ok(Self {
            kind,
            digest: DigestSource::builtin(md),
        })
    }

    /// Creates an HMAC over the alternate suite engine's digest.
    pub fn gost(engine: &Arc<AltSuiteEngine>) -> Self {
        Self {
            kind: MacAlgo::HmacGost,
            digest: DigestSource::engine(engine),
        }
    }
}

impl MacAlgorithm for OsslHmac {
    fn kind(&self) -> MacAlgo {
        self.kind
    }

    fn mac_size(&self) -> usize {
        self.digest.size()
    }

    fn sign(&self, key: &[u8], data: &[u8], output: Option<&mut [u8]>) -> FactoryResult<usize> {
        let Some(output) = output else {
            return Ok(self.mac_size());
        };
        if key.is_empty() {
            Err(FactoryError::InvalidParameter("empty HMAC key".into()))?;
        }

        let (md, _engine) = self.digest.acquire()?;
        let key = openssl::pkey::PKey::hmac(key)?;
        let mut signer = Signer::new(md, &key)?;
        signer.update(data)?;
        let tag = signer.sign_to_vec()?;
        copy_output(Some(output), &tag)
    }
}

/// CMAC over a block cipher.
#[derive(Debug, Clone, Copy)]
pub struct OsslCmac {
    kind: MacAlgo,
}

impl OsslCmac {
    /// Creates a CMAC over DES/3DES or AES.
    pub fn new(kind: MacAlgo) -> FactoryResult<Self> {
        match kind {
            MacAlgo::CmacDes | MacAlgo::CmacAes => Ok(Self { kind }),
            _ => Err(FactoryError::UnsupportedKind(kind.to_string())),
        }
    }

    fn cipher(&self, key_len: usize) -> FactoryResult<Cipher> {
        let cipher = match (self.kind, key_len) {
            (MacAlgo::CmacAes, 16) => Cipher::aes_128_cbc(),
            (MacAlgo::CmacAes, 24) => Cipher::aes_192_cbc(),
            (MacAlgo::CmacAes, 32) => Cipher::aes_256_cbc(),
            (MacAlgo::CmacDes, 8) => Cipher::des_cbc(),
            (MacAlgo::CmacDes, 16 | 24) => Cipher::des_ede3_cbc(),
            _ => Err(FactoryError::InvalidParameter(format!(
                "invalid {} key size {key_len}",
                self.kind
            )))?,
        };
        Ok(cipher)
    }
}

impl MacAlgorithm for OsslCmac {
    fn kind(&self) -> MacAlgo {
        self.kind
    }

    fn mac_size(&self) -> usize {
        match self.kind {
            MacAlgo::CmacAes => 16,
            _ => 8,
        }
    }

    fn sign(&self, key: &[u8], data: &[u8], output: Option<&mut [u8]>) -> FactoryResult<usize> {
        let Some(output) = output else {
            return Ok(self.mac_size());
        };

        let cipher = self.cipher(key.len())?;
        let mut key = key.to_vec();
        if self.kind == MacAlgo::CmacDes && key.len() == 16 {
            key.extend_from_within(..8);
        }
        let key = openssl::pkey::PKey::cmac(&cipher, &key)?;
        let mut signer = Signer::new_without_digest(&key)?;
        signer.update(data)?;
        let tag = signer.sign_to_vec()?;
        copy_output(Some(output), &tag)
    }
}
