// Copyright (C) Microsoft Corporation. All rights reserved.

//! OpenSSL random generator.

use std::sync::Arc;
use std::sync::Weak;

use super::*;

const HEALTH_CHECK_LEN: usize = 32;

/// Generator over `RAND_bytes`.
///
/// Draws from whatever RAND method is the library default, which is the
/// hardware engine when one was attached.
#[derive(Debug)]
pub struct OsslRng {
    _private: (),
}

impl OsslRng {
    /// Creates the generator after checking that it can produce output.
    pub fn new() -> FactoryResult<Self> {
        let mut sample = [0u8; HEALTH_CHECK_LEN];
        openssl::rand::rand_bytes(&mut sample).map_err(|e| {
            tracing::error!("random generator health check failed: {e}");
            FactoryError::RngUnavailable
        })?;
        if sample.iter().all(|b| *b == 0) {
            tracing::error!("random generator produced an all-zero block");
            Err(FactoryError::RngUnavailable)?;
        }

        Ok(Self { _private: () })
    }

    /// Boxed constructor used as the factory's default generator source.
    pub fn boxed() -> FactoryResult<Box<dyn Rng>> {
        Ok(Box::new(Self::new()?))
    }
}

impl Rng for OsslRng {
    fn generate(&self, output: &mut [u8]) -> FactoryResult<()> {
        openssl::rand::rand_bytes(output)?;
        Ok(())
    }
}

/// Caller's handle to the factory's generator.
///
/// Fails with [`FactoryError::RngUnavailable`] once the factory that owns
/// the generator has been reset.
pub struct SharedRng {
    inner: Weak<dyn Rng>,
}

impl SharedRng {
    pub(crate) fn new(rng: &Arc<dyn Rng>) -> Self {
        Self {
            inner: Arc::downgrade(rng),
        }
    }
}

impl Rng for SharedRng {
    fn generate(&self, output: &mut [u8]) -> FactoryResult<()> {
        let rng = self.inner.upgrade().ok_or(FactoryError::RngUnavailable)?;
        rng.generate(output)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_generate() {
        let rng = OsslRng::new().expect("rng");
        let a = rng.generate_vec(32).expect("random");
        let b = rng.generate_vec(32).expect("random");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);

        assert!(rng.generate_vec(0).expect("empty").is_empty());
    }

    #[test]
    fn test_shared_rng_follows_owner() {
        let owner: Arc<dyn Rng> = Arc::new(OsslRng::new().expect("rng"));
        let shared = SharedRng::new(&owner);
        assert_eq!(shared.generate_vec(8).expect("random").len(), 8);

        drop(owner);
        assert!(matches!(
            shared.generate_vec(8),
            Err(FactoryError::RngUnavailable)
        ));
    }
}
