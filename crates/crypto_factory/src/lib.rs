// Copyright (C) Microsoft Corporation. All rights reserved.

//! OpenSSL backed crypto factory with TPM transport bring-up.
//!
//! The factory is a process-wide singleton that manufactures algorithm
//! products and owns the native subsystems they depend on:
//!
//! - **Lock bridge**: serves libcrypto's legacy locking callback from a pool
//!   of reader/writer locks
//! - **TCTI loader**: loads a TPM transport plugin and initializes its context
//! - **Command context**: binds a `tss2-sys` context to the transport
//! - **Engines**: the `rdrand` RAND engine and an alternate cipher suite
//! - **Dispatch**: symmetric, asymmetric, hash, MAC and RNG products
//!
//! Every subsystem other than the random generator is optional and degrades
//! to "absent" when it cannot be brought up.

pub mod algorithms;
pub mod buffer;
pub mod compliance;
pub mod config;
pub mod engine;
pub mod error;
pub mod factory;
pub mod kinds;
pub mod lock_bridge;
pub mod log;
pub mod native;
pub mod sys_context;
pub mod tcti;

pub use config::FactoryConfig;
pub use error::ErrorClass;
pub use error::FactoryError;
pub use error::FactoryResult;
pub use factory::Backends;
pub use factory::CryptoFactory;
pub use factory::FactoryOptions;
pub use kinds::*;

#[cfg(test)]
pub(crate) static TEST_SERIAL: parking_lot::Mutex<()> = parking_lot::const_mutex(());
