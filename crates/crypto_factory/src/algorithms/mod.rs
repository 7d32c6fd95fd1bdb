// Copyright (C) Microsoft Corporation. All rights reserved.

//! Algorithm products manufactured by the factory.
//!
//! Each family is exposed through an object-safe trait so dispatch can hand
//! out boxed products. All implementations are thin wrappers over the
//! `openssl` crate; the GOST products additionally hold the alternate suite
//! engine alive for as long as they exist.

mod asymmetric;
mod hash;
mod mac;
mod rng;
mod symmetric;

pub use asymmetric::*;
pub use hash::*;
pub use mac::*;
use openssl::pkey::PKey;
use openssl::pkey::PKeyRef;
use openssl::pkey::Private;
use openssl::pkey::Public;
pub use rng::*;
pub use symmetric::*;

use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::kinds::AsymAlgo;
use crate::kinds::HashAlgo;
use crate::kinds::MacAlgo;
use crate::kinds::SymAlgo;

/// Block cipher modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymMode {
    /// Electronic codebook
    Ecb,
    /// Cipher block chaining
    Cbc,
    /// Counter mode (AES only)
    Ctr,
}

/// Symmetric cipher product.
pub trait SymmetricAlgorithm: Send {
    /// Algorithm kind.
    fn kind(&self) -> SymAlgo;

    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Accepted key lengths in bytes.
    fn key_sizes(&self) -> &'static [usize];

    /// Encrypts `data` in one shot.
    ///
    /// `iv` is required by every mode except ECB. `padding` selects PKCS#7
    /// padding for the block modes and is ignored by CTR.
    fn encrypt(
        &self,
        mode: SymMode,
        key: &[u8],
        iv: Option<&[u8]>,
        data: &[u8],
        padding: bool,
    ) -> FactoryResult<Vec<u8>>;

    /// Decrypts `data` in one shot.
    fn decrypt(
        &self,
        mode: SymMode,
        key: &[u8],
        iv: Option<&[u8]>,
        data: &[u8],
        padding: bool,
    ) -> FactoryResult<Vec<u8>>;
}

/// Key generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyGenParams {
    /// Scheme default (2048-bit moduli, P-256, Ed25519)
    #[default]
    Default,
    /// Modulus or prime size in bits
    Bits(u32),
    /// Named curve
    Curve(openssl::nid::Nid),
}

/// Asymmetric scheme product.
///
/// Operations a scheme does not support report [`FactoryError::InvalidParameter`].
pub trait AsymmetricAlgorithm: Send {
    /// Algorithm kind.
    fn kind(&self) -> AsymAlgo;

    /// Generates a key pair.
    fn generate_key_pair(&self, params: &KeyGenParams) -> FactoryResult<PKey<Private>>;

    /// Signs `data` with the scheme's default digest.
    fn sign(&self, key: &PKeyRef<Private>, data: &[u8]) -> FactoryResult<Vec<u8>> {
        let _ = (key, data);
        Err(not_supported(self.kind(), "signing"))
    }

    /// Verifies a signature over `data`.
    fn verify(&self, key: &PKeyRef<Public>, data: &[u8], signature: &[u8]) -> FactoryResult<bool> {
        let _ = (key, data, signature);
        Err(not_supported(self.kind(), "verification"))
    }

    /// Derives a shared secret with `peer`.
    fn derive(&self, key: &PKeyRef<Private>, peer: &PKeyRef<Public>) -> FactoryResult<Vec<u8>> {
        let _ = (key, peer);
        Err(not_supported(self.kind(), "key derivation"))
    }
}

/// Hash product with one-shot and streaming interfaces.
pub trait HashAlgorithm: Send {
    /// Algorithm kind.
    fn kind(&self) -> HashAlgo;

    /// Digest size in bytes.
    fn size(&self) -> usize;

    /// Computes the digest of `data`.
    ///
    /// With `output` set to `None` only the required size is returned.
    fn hash(&mut self, data: &[u8], output: Option<&mut [u8]>) -> FactoryResult<usize>;

    /// Starts a streaming computation, discarding any previous one.
    fn hash_init(&mut self) -> FactoryResult<()>;

    /// Feeds data into the streaming computation.
    fn hash_update(&mut self, data: &[u8]) -> FactoryResult<()>;

    /// Completes the streaming computation.
    fn hash_final(&mut self, output: Option<&mut [u8]>) -> FactoryResult<usize>;

    /// One-shot digest returned as a vector.
    fn hash_vec(&mut self, data: &[u8]) -> FactoryResult<Vec<u8>> {
        let mut digest = vec![0u8; self.size()];
        let len = self.hash(data, Some(&mut digest))?;
        digest.truncate(len);
        Ok(digest)
    }
}

/// Message authentication code product.
pub trait MacAlgorithm: Send {
    /// Algorithm kind.
    fn kind(&self) -> MacAlgo;

    /// Tag size in bytes.
    fn mac_size(&self) -> usize;

    /// Computes the tag of `data` under `key`.
    ///
    /// With `output` set to `None` only the required size is returned.
    fn sign(&self, key: &[u8], data: &[u8], output: Option<&mut [u8]>) -> FactoryResult<usize>;

    /// Checks `tag` in constant time.
    fn verify(&self, key: &[u8], data: &[u8], tag: &[u8]) -> FactoryResult<bool> {
        let mut expected = vec![0u8; self.mac_size()];
        let len = self.sign(key, data, Some(&mut expected))?;
        Ok(tag.len() == len && openssl::memcmp::eq(&expected[..len], tag))
    }

    /// Tag returned as a vector.
    fn sign_vec(&self, key: &[u8], data: &[u8]) -> FactoryResult<Vec<u8>> {
        let mut tag = vec![0u8; self.mac_size()];
        let len = self.sign(key, data, Some(&mut tag))?;
        tag.truncate(len);
        Ok(tag)
    }
}

/// Random generator product.
pub trait Rng: Send + Sync {
    /// Fills `output` with random bytes.
    fn generate(&self, output: &mut [u8]) -> FactoryResult<()>;

    /// Returns `len` random bytes.
    fn generate_vec(&self, len: usize) -> FactoryResult<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.generate(&mut bytes)?;
        Ok(bytes)
    }
}

/// Public half of `key`, for verification and peer derivation.
pub fn public_key(key: &PKeyRef<Private>) -> FactoryResult<PKey<Public>> {
    let der = key.public_key_to_der()?;
    Ok(PKey::public_key_from_der(&der)?)
}

fn not_supported(kind: AsymAlgo, operation: &str) -> FactoryError {
    FactoryError::InvalidParameter(format!("{kind} does not support {operation}"))
}

fn copy_output(output: Option<&mut [u8]>, result: &[u8]) -> FactoryResult<usize> {
    if let Some(output) = output {
        if output.len() < result.len() {
            Err(FactoryError::InvalidParameter(format!(
                "output buffer too small: {} < {}",
                output.len(),
                result.len()
            )))?;
        }
        output[..result.len()].copy_from_slice(result);
    }
    Ok(result.len())
}
