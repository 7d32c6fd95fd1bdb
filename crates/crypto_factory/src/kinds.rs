// Copyright (C) Microsoft Corporation. All rights reserved.

//! Algorithm kind tags accepted by the factory's dispatch functions.

use std::fmt;

/// Symmetric cipher families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymAlgo {
    /// Not a valid selection
    Unknown,
    /// AES-128/192/256
    Aes,
    /// Single DES
    Des,
    /// Two and three key triple DES
    Des3,
}

/// Asymmetric schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsymAlgo {
    /// Not a valid selection
    Unknown,
    /// RSA PKCS#1 v1.5
    Rsa,
    /// DSA
    Dsa,
    /// Finite field Diffie-Hellman
    Dh,
    /// Elliptic curve Diffie-Hellman
    Ecdh,
    /// Elliptic curve DSA
    Ecdsa,
    /// GOST R 34.10-2001
    Gost,
    /// Edwards curve DSA
    EdDsa,
}

/// Hash functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    /// Not a valid selection
    Unknown,
    /// MD5
    Md5,
    /// SHA-1
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
    /// GOST R 34.11-94
    Gost,
}

/// Message authentication codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgo {
    /// Not a valid selection
    Unknown,
    /// HMAC-MD5
    HmacMd5,
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA224
    HmacSha224,
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA384
    HmacSha384,
    /// HMAC-SHA512
    HmacSha512,
    /// HMAC over GOST R 34.11-94
    HmacGost,
    /// CMAC over (triple) DES
    CmacDes,
    /// CMAC over AES
    CmacAes,
}

/// Named random generator instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RngImpl {
    /// Not a valid selection
    Unknown,
    /// The process-wide generator
    #[default]
    Default,
}

impl MacAlgo {
    /// Hash underlying an HMAC kind.
    pub fn hmac_hash(self) -> Option<HashAlgo> {
        match self {
            MacAlgo::HmacMd5 => Some(HashAlgo::Md5),
            MacAlgo::HmacSha1 => Some(HashAlgo::Sha1),
            MacAlgo::HmacSha224 => Some(HashAlgo::Sha224),
            MacAlgo::HmacSha256 => Some(HashAlgo::Sha256),
            MacAlgo::HmacSha384 => Some(HashAlgo::Sha384),
            MacAlgo::HmacSha512 => Some(HashAlgo::Sha512),
            MacAlgo::HmacGost => Some(HashAlgo::Gost),
            MacAlgo::Unknown | MacAlgo::CmacDes | MacAlgo::CmacAes => None,
        }
    }
}

impl fmt::Display for SymAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SymAlgo::Unknown => "Unknown",
            SymAlgo::Aes => "AES",
            SymAlgo::Des => "DES",
            SymAlgo::Des3 => "3DES",
        })
    }
}

impl fmt::Display for AsymAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AsymAlgo::Unknown => "Unknown",
            AsymAlgo::Rsa => "RSA",
            AsymAlgo::Dsa => "DSA",
            AsymAlgo::Dh => "DH",
            AsymAlgo::Ecdh => "ECDH",
            AsymAlgo::Ecdsa => "ECDSA",
            AsymAlgo::Gost => "GOST",
            AsymAlgo::EdDsa => "EDDSA",
        })
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlgo::Unknown => "Unknown",
            HashAlgo::Md5 => "MD5",
            HashAlgo::Sha1 => "SHA1",
            HashAlgo::Sha224 => "SHA224",
            HashAlgo::Sha256 => "SHA256",
            HashAlgo::Sha384 => "SHA384",
            HashAlgo::Sha512 => "SHA512",
            HashAlgo::Gost => "GOST",
        })
    }
}

impl fmt::Display for MacAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MacAlgo::Unknown => "Unknown",
            MacAlgo::HmacMd5 => "HMAC-MD5",
            MacAlgo::HmacSha1 => "HMAC-SHA1",
            MacAlgo::HmacSha224 => "HMAC-SHA224",
            MacAlgo::HmacSha256 => "HMAC-SHA256",
            MacAlgo::HmacSha384 => "HMAC-SHA384",
            MacAlgo::HmacSha512 => "HMAC-SHA512",
            MacAlgo::HmacGost => "HMAC-GOST",
            MacAlgo::CmacDes => "CMAC-DES",
            MacAlgo::CmacAes => "CMAC-AES",
        })
    }
}

impl fmt::Display for RngImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RngImpl::Unknown => "Unknown",
            RngImpl::Default => "Default",
        })
    }
}
