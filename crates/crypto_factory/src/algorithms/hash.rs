// Copyright (C) Microsoft Corporation. All rights reserved.

//! OpenSSL hash products.

use std::sync::Arc;
use std::sync::Weak;

use openssl::hash::Hasher;
use openssl::hash::MessageDigest;

use super::*;
use crate::engine::AltSuiteEngine;

/// Maps a hash kind to its builtin OpenSSL digest.
///
/// Returns `None` for kinds that need an engine or are unknown.
pub(crate) fn builtin_digest(kind: HashAlgo) -> Option<MessageDigest> {
    match kind {
        HashAlgo::Md5 => Some(MessageDigest::md5()),
        HashAlgo::Sha1 => Some(MessageDigest::sha1()),
        HashAlgo::Sha224 => Some(MessageDigest::sha224()),
        HashAlgo::Sha256 => Some(MessageDigest::sha256()),
        HashAlgo::Sha384 => Some(MessageDigest::sha384()),
        HashAlgo::Sha512 => Some(MessageDigest::sha512()),
        HashAlgo::Gost | HashAlgo::Unknown => None,
    }
}

/// A message digest, builtin or provided by the alternate suite engine.
///
/// Engine digests only reference the engine weakly. Once the factory that
/// owns it is reset, [`DigestSource::acquire`] fails with
/// [`FactoryError::InstanceReset`].
#[derive(Clone)]
pub(crate) struct DigestSource {
    md: MessageDigest,
    size: usize,
    engine: Option<Weak<AltSuiteEngine>>,
}

impl DigestSource {
    pub(crate) fn builtin(md: MessageDigest) -> Self {
        Self {
            md,
            size: md.size(),
            engine: None,
        }
    }

    pub(crate) fn engine(engine: &Arc<AltSuiteEngine>) -> Self {
        let md = engine.digest();
        Self {
            md,
            size: md.size(),
            engine: Some(Arc::downgrade(engine)),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Returns the digest and, for engine digests, a strong reference that
    /// keeps the engine up for the duration of one operation.
    pub(crate) fn acquire(&self) -> FactoryResult<(MessageDigest, Option<Arc<AltSuiteEngine>>)> {
        let Some(engine) = &self.engine else {
            return Ok((self.md, None));
        };
        let engine = engine.upgrade().ok_or(FactoryError::InstanceReset)?;
        Ok((self.md, Some(engine)))
    }
}

/// Hash backed by an OpenSSL message digest.
pub struct OsslHash {
    kind: HashAlgo,
    digest: DigestSource,
    hasher: Option<Hasher>,
}

impl OsslHash {
    /// Creates a hash of a builtin kind.
    pub fn new(kind: HashAlgo) -> FactoryResult<Self> {
        let md =
            builtin_digest(kind).ok_or_else(|| FactoryError::UnsupportedKind(kind.to_string()))?;
        Ok(Self {
            kind,
            digest: DigestSource::builtin(md),
            hasher: None,
        })
    }

    /// Creates a GOST R 34.11-94 hash from the alternate suite engine.
    ///
    /// The product stops working once the engine is released.
    pub fn gost(engine: &Arc<AltSuiteEngine>) -> Self {
        Self {
            kind: HashAlgo::Gost,
            digest: DigestSource::engine(engine),
            hasher: None,
        }
    }
}

impl HashAlgorithm for OsslHash {
    fn kind(&self) -> HashAlgo {
        self.kind
    }

    fn size(&self) -> usize {
        self.digest.size()
    }

    fn hash(&mut self, data: &[u8], output: Option<&mut [u8]>) -> FactoryResult<usize> {
        let Some(output) = output else {
            return Ok(self.size());
        };
        let (md, _engine) = self.digest.acquire()?;
        let digest = openssl::hash::hash(md, data)?;
        copy_output(Some(output), &digest)
    }

    fn hash_init(&mut self) -> FactoryResult<()> {
        let (md, _engine) = self.digest.acquire()?;
        self.hasher = Some(Hasher::new(md)?);
        Ok(())
    }

    fn hash_update(&mut self, data: &[u8]) -> FactoryResult<()> {
        let _engine = self.digest.acquire().map_err(|e| {
            self.hasher = None;
            e
        })?;
        let hasher = self
            .hasher
            .as_mut()
            .ok_or(FactoryError::InvalidState("hash not initialized"))?;
        hasher.update(data)?;
        Ok(())
    }

    fn hash_final(&mut self, output: Option<&mut [u8]>) -> FactoryResult<usize> {
        let Some(output) = output else {
            return Ok(self.size());
        };
        let mut hasher = self
            .hasher
            .take()
            .ok_or(FactoryError::InvalidState("hash not initialized"))?;
        let _engine = self.digest.acquire()?;
        let digest = hasher.finish()?;
        copy_output(Some(output), &digest)
    }
}
