// Copyright (C) Microsoft Corporation. All rights reserved.

//! OpenSSL asymmetric scheme products.
//!
//! # Supported Schemes
//!
//! - **RSA**: PKCS#1 v1.5 signatures over SHA-256
//! - **DSA**: signatures over SHA-256
//! - **DH**: finite field key agreement (RFC 5114 2048-bit group by default)
//! - **ECDH / ECDSA**: NIST curves, P-256 by default (feature `ecc`)
//! - **EdDSA**: Ed25519 by default, Ed448 on request (feature `eddsa`)
//! - **GOST**: GOST R 34.10-2001 through the alternate suite engine
//!
//! Keys are plain `openssl` `PKey` values; a verification key is obtained
//! from a private key with [`public_key`](super::public_key).

use std::sync::Arc;
use std::sync::Weak;

use openssl::derive::Deriver;
use openssl::dh::Dh;
use openssl::dsa::Dsa;
use openssl::hash::MessageDigest;
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::sign::Verifier;

use super::*;
use crate::engine::AltSuiteEngine;
use crate::engine::NID_ID_GOSTR3410_2001;

const DEFAULT_MODULUS_BITS: u32 = 2048;

fn modulus_bits(kind: AsymAlgo, params: &KeyGenParams) -> FactoryResult<u32> {
    match params {
        KeyGenParams::Default => Ok(DEFAULT_MODULUS_BITS),
        KeyGenParams::Bits(bits) => Ok(*bits),
        KeyGenParams::Curve(_) => Err(FactoryError::InvalidParameter(format!(
            "{kind} keys are not curve based"
        ))),
    }
}

fn sign_digest(md: MessageDigest, key: &PKeyRef<Private>, data: &[u8]) -> FactoryResult<Vec<u8>> {
    let mut signer = Signer::new(md, key)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

fn verify_digest(
    md: MessageDigest,
    key: &PKeyRef<Public>,
    data: &[u8],
    signature: &[u8],
) -> FactoryResult<bool> {
    let mut verifier = Verifier::new(md, key)?;
    verifier.update(data)?;
    Ok(verifier.verify(signature)?)
}

fn derive_secret(key: &PKeyRef<Private>, peer: &PKeyRef<Public>) -> FactoryResult<Vec<u8>> {
    let mut deriver = Deriver::new(key)?;
    deriver.set_peer(peer)?;
    Ok(deriver.derive_to_vec()?)
}

/// RSA key generation and PKCS#1 v1.5 signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsslRsa;

impl AsymmetricAlgorithm for OsslRsa {
    fn kind(&self) -> AsymAlgo {
        AsymAlgo::Rsa
    }

    fn generate_key_pair(&self, params: &KeyGenParams) -> FactoryResult<PKey<Private>> {
        let rsa = Rsa::generate(modulus_bits(self.kind(), params)?)?;
        Ok(PKey::from_rsa(rsa)?)
    }

    fn sign(&self, key: &PKeyRef<Private>, data: &[u8]) -> FactoryResult<Vec<u8>> {
        sign_digest(MessageDigest::sha256(), key, data)
    }

    fn verify(&self, key: &PKeyRef<Public>, data: &[u8], signature: &[u8]) -> FactoryResult<bool> {
        verify_digest(MessageDigest::sha256(), key, data, signature)
    }
}

/// DSA key generation and signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsslDsa;

impl AsymmetricAlgorithm for OsslDsa {
    fn kind(&self) -> AsymAlgo {
        AsymAlgo::Dsa
    }

    fn generate_key_pair(&self, params: &KeyGenParams) -> FactoryResult<PKey<Private>> {
        let dsa = Dsa::generate(modulus_bits(self.kind(), params)?)?;
        Ok(PKey::from_dsa(dsa)?)
    }

    fn sign(&self, key: &PKeyRef<Private>, data: &[u8]) -> FactoryResult<Vec<u8>> {
        sign_digest(MessageDigest::sha256(), key, data)
    }

    fn verify(&self, key: &PKeyRef<Public>, data: &[u8], signature: &[u8]) -> FactoryResult<bool> {
        verify_digest(MessageDigest::sha256(), key, data, signature)
    }
}

/// Finite field Diffie-Hellman.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsslDh;

impl AsymmetricAlgorithm for OsslDh {
    fn kind(&self) -> AsymAlgo {
        AsymAlgo::Dh
    }

    fn generate_key_pair(&self, params: &KeyGenParams) -> FactoryResult<PKey<Private>> {
        let group = match params {
            KeyGenParams::Default => Dh::get_2048_256()?,
            _ => Dh::generate_params(modulus_bits(self.kind(), params)?, 2)?,
        };
        Ok(PKey::from_dh(group.generate_key()?)?)
    }

    fn derive(&self, key: &PKeyRef<Private>, peer: &PKeyRef<Public>) -> FactoryResult<Vec<u8>> {
        derive_secret(key, peer)
    }
}

#[cfg(feature = "ecc")]
fn generate_ec_key(kind: AsymAlgo, params: &KeyGenParams) -> FactoryResult<PKey<Private>> {
    use openssl::ec::EcGroup;
    use openssl::ec::EcKey;
    use openssl::nid::Nid;

    let nid = match params {
        KeyGenParams::Default => Nid::X9_62_PRIME256V1,
        KeyGenParams::Curve(nid) => *nid,
        KeyGenParams::Bits(_) => Err(FactoryError::InvalidParameter(format!(
            "{kind} keys need a named curve"
        )))?,
    };
    let group = EcGroup::from_curve_name(nid)?;
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

/// Elliptic curve Diffie-Hellman.
#[cfg(feature = "ecc")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OsslEcdh;

#[cfg(feature = "ecc")]
impl AsymmetricAlgorithm for OsslEcdh {
    fn kind(&self) -> AsymAlgo {
        AsymAlgo::Ecdh
    }

    fn generate_key_pair(&self, params: &KeyGenParams) -> FactoryResult<PKey<Private>> {
        generate_ec_key(self.kind(), params)
    }

    fn derive(&self, key: &PKeyRef<Private>, peer: &PKeyRef<Public>) -> FactoryResult<Vec<u8>> {
        derive_secret(key, peer)
    }
}

/// Elliptic curve DSA over SHA-256.
#[cfg(feature = "ecc")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OsslEcdsa;

#[cfg(feature = "ecc")]
impl AsymmetricAlgorithm for OsslEcdsa {
    fn kind(&self) -> AsymAlgo {
        AsymAlgo::Ecdsa
    }

    fn generate_key_pair(&self, params: &KeyGenParams) -> FactoryResult<PKey<Private>> {
        generate_ec_key(self.kind(), params)
    }

    fn sign(&self, key: &PKeyRef<Private>, data: &[u8]) -> FactoryResult<Vec<u8>> {
        sign_digest(MessageDigest::sha256(), key, data)
    }

    fn verify(&self, key: &PKeyRef<Public>, data: &[u8], signature: &[u8]) -> FactoryResult<bool> {
        verify_digest(MessageDigest::sha256(), key, data, signature)
    }
}

/// Edwards curve signatures (pure EdDSA, no prehash).
#[cfg(feature = "eddsa")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OsslEddsa;

#[cfg(feature = "eddsa")]
impl AsymmetricAlgorithm for OsslEddsa {
    fn kind(&self) -> AsymAlgo {
        AsymAlgo::EdDsa
    }

    fn generate_key_pair(&self, params: &KeyGenParams) -> FactoryResult<PKey<Private>> {
        use openssl::nid::Nid;

        let key = match params {
            KeyGenParams::Default => PKey::generate_ed25519()?,
            KeyGenParams::Curve(nid) if *nid == Nid::from_raw(openssl_sys::NID_ED25519) => {
                PKey::generate_ed25519()?
            }
            KeyGenParams::Curve(nid) if *nid == Nid::from_raw(openssl_sys::NID_ED448) => {
                PKey::generate_ed448()?
            }
            _ => Err(FactoryError::InvalidParameter(
                "EdDSA supports Ed25519 and Ed448 only".into(),
            ))?,
        };
        Ok(key)
    }

    fn sign(&self, key: &PKeyRef<Private>, data: &[u8]) -> FactoryResult<Vec<u8>> {
        let mut signer = Signer::new_without_digest(key)?;
        Ok(signer.sign_oneshot_to_vec(data)?)
    }

    fn verify(&self, key: &PKeyRef<Public>, data: &[u8], signature: &[u8]) -> FactoryResult<bool> {
        let mut verifier = Verifier::new_without_digest(key)?;
        Ok(verifier.verify_oneshot(signature, data)?)
    }
}

/// GOST R 34.10-2001 signatures over GOST R 34.11-94.
///
/// The engine is referenced weakly; after the factory is reset every
/// operation fails with [`FactoryError::InstanceReset`].
pub struct OsslGost {
    engine: Weak<AltSuiteEngine>,
}

impl OsslGost {
    /// Creates the product on top of a live engine.
    pub fn new(engine: &Arc<AltSuiteEngine>) -> Self {
        Self {
            engine: Arc::downgrade(engine),
        }
    }

    fn engine(&self) -> FactoryResult<Arc<AltSuiteEngine>> {
        self.engine.upgrade().ok_or(FactoryError::InstanceReset)
    }
}

impl AsymmetricAlgorithm for OsslGost {
    fn kind(&self) -> AsymAlgo {
        AsymAlgo::Gost
    }

    fn generate_key_pair(&self, params: &KeyGenParams) -> FactoryResult<PKey<Private>> {
        if *params != KeyGenParams::Default {
            Err(FactoryError::InvalidParameter(
                "GOST keys use the CryptoPro-A parameter set".into(),
            ))?;
        }
        self.engine()?
            .generate_key(NID_ID_GOSTR3410_2001, &[(c"paramset", c"A")])
    }

    fn sign(&self, key: &PKeyRef<Private>, data: &[u8]) -> FactoryResult<Vec<u8>> {
        let engine = self.engine()?;
        sign_digest(engine.digest(), key, data)
    }

    fn verify(&self, key: &PKeyRef<Public>, data: &[u8], signature: &[u8]) -> FactoryResult<bool> {
        let engine = self.engine()?;
        verify_digest(engine.digest(), key, data, signature)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_rsa_sign_verify() {
        let rsa = OsslRsa;
        let key = rsa.generate_key_pair(&KeyGenParams::Default).expect("keygen");
        let public = public_key(&key).expect("public");

        let signature = rsa.sign(&key, b"message").expect("sign");
        assert_eq!(signature.len(), 256);
        assert!(rsa.verify(&public, b"message", &signature).expect("verify"));
        assert!(!rsa.verify(&public, b"massage", &signature).expect("verify"));
    }

    #[test]
    fn test_verify_with_wrong_key_type_is_an_error() {
        let dh = OsslDh.generate_key_pair(&KeyGenParams::Default).expect("dh");
        let dh_public = public_key(&dh).expect("public");
        let result = OsslRsa.verify(&dh_public, b"message", &[0u8; 256]);
        assert!(matches!(result, Err(FactoryError::OpenSsl(_))));
    }

    #[test]
    fn test_unsupported_operations() {
        let rsa = OsslRsa;
        let key = rsa
            .generate_key_pair(&KeyGenParams::Bits(1024))
            .expect("keygen");
        let public = public_key(&key).expect("public");
        assert!(matches!(
            rsa.derive(&key, &public),
            Err(FactoryError::InvalidParameter(_))
        ));
        assert!(OsslDh.sign(&key, b"data").is_err());
    }

    #[cfg(feature = "ecc")]
    #[test]
    fn test_ecdh_agreement() {
        let ecdh = OsslEcdh;
        let alice = ecdh.generate_key_pair(&KeyGenParams::Default).expect("alice");
        let bob = ecdh.generate_key_pair(&KeyGenParams::Default).expect("bob");

        let ab = ecdh
            .derive(&alice, &public_key(&bob).expect("bob public"))
            .expect("derive");
        let ba = ecdh
            .derive(&bob, &public_key(&alice).expect("alice public"))
            .expect("derive");
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 32);
    }

    #[cfg(feature = "ecc")]
    #[test]
    fn test_ecdsa_rejects_bits() {
        assert!(OsslEcdsa
            .generate_key_pair(&KeyGenParams::Bits(256))
            .is_err());
    }

    #[cfg(feature = "eddsa")]
    #[test]
    fn test_eddsa_sign_verify() {
        let eddsa = OsslEddsa;
        let key = eddsa.generate_key_pair(&KeyGenParams::Default).expect("keygen");
        let public = public_key(&key).expect("public");

        let signature = eddsa.sign(&key, b"message").expect("sign");
        assert_eq!(signature.len(), 64);
        assert!(eddsa.verify(&public, b"message", &signature).expect("verify"));
        assert!(!eddsa.verify(&public, b"other", &signature).expect("verify"));
    }

    #[cfg(feature = "eddsa")]
    #[test]
    fn test_ed448_sign_verify() {
        use openssl::nid::Nid;

        let eddsa = OsslEddsa;
        let params = KeyGenParams::Curve(Nid::from_raw(openssl_sys::NID_ED448));
        let key = eddsa.generate_key_pair(&params).expect("keygen");
        assert_eq!(key.id(), openssl::pkey::Id::ED448);
        let public = public_key(&key).expect("public");

        let signature = eddsa.sign(&key, b"message").expect("sign");
        assert_eq!(signature.len(), 114);
        assert!(eddsa.verify(&public, b"message", &signature).expect("verify"));
        assert!(!eddsa.verify(&public, b"other", &signature).expect("verify"));

        let ed25519 = KeyGenParams::Curve(Nid::from_raw(openssl_sys::NID_ED25519));
        let key = eddsa.generate_key_pair(&ed25519).expect("keygen");
        assert_eq!(key.id(), openssl::pkey::Id::ED25519);
        assert!(eddsa
            .generate_key_pair(&KeyGenParams::Curve(Nid::X9_62_PRIME256V1))
            .is_err());
    }
}
