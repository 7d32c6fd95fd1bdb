// Copyright (C) Microsoft Corporation. All rights reserved.

//! Crypto factory error module

use openssl::error::ErrorStack;
use thiserror::Error;

/// TSS2 return code as reported by transport plugins and the command library.
pub type Tss2Rc = u32;

/// Factory result
pub type FactoryResult<T> = Result<T, FactoryError>;

/// Broad failure classes used to decide how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lock pool sizing or ABI problems; fatal to the affected subsystem only.
    Configuration,

    /// Transport plugin could not be located, resolved or initialized.
    PluginLoad,

    /// Optional engine unavailable; never surfaced to dispatch callers.
    Engine,

    /// Algorithm kind not implemented by this build or runtime.
    UnsupportedKind,

    /// The core random generator could not be instantiated.
    FatalConstruction,

    /// Failure reported by the underlying cryptographic library.
    Crypto,

    /// Caller passed invalid input or used a product out of order.
    InvalidUsage,
}

/// Crypto factory error
#[derive(Error, Debug, Clone)]
pub enum FactoryError {
    /// The library asked for an unusable number of locks
    #[error("invalid lock pool size {0}")]
    LockPoolSize(i64),

    /// Lock pool allocation failed
    #[error("could not allocate {0} locks")]
    LockPoolAllocation(usize),

    /// A transport is already loaded in this process
    #[error("a TCTI transport is already loaded")]
    TransportAlreadyLoaded,

    /// Neither the verbatim name nor the conventional file name could be opened
    #[error("could not open TCTI library \"{0}\"")]
    TransportNotFound(String),

    /// The well-known info entry point is missing
    #[error("symbol \"{symbol}\" not found in library \"{path}\"")]
    TransportSymbolMissing {
        /// Symbol name
        symbol: String,
        /// Library name as requested
        path: String,
    },

    /// The plugin's info structure is unusable
    #[error("TCTI library \"{0}\" returned an invalid info structure")]
    TransportInvalidInfo(String),

    /// The size query (first initializer call) failed
    #[error("TCTI init setup routine failed for library \"{path}\": {rc:#x}")]
    TransportInitSize {
        /// Library name as requested
        path: String,
        /// Status returned by the plugin
        rc: Tss2Rc,
    },

    /// The real initialization (second initializer call) failed
    #[error("TCTI init allocation routine failed for library \"{path}\": {rc:#x}")]
    TransportInit {
        /// Library name as requested
        path: String,
        /// Status returned by the plugin
        rc: Tss2Rc,
    },

    /// A context buffer of the requested size could not be allocated
    #[error("could not allocate a {0} byte context buffer")]
    ContextAllocation(usize),

    /// The command-marshaling library could not be loaded
    #[error("command library \"{0}\" is unavailable")]
    CommandLibraryUnavailable(String),

    /// The command context could not be initialized
    #[error("command context initialization failed: {0:#x}")]
    CommandContextInit(Tss2Rc),

    /// An optional engine is not available
    #[error("engine \"{0}\" is unavailable")]
    EngineUnavailable(String),

    /// An optional engine failed at one bring-up step
    #[error("engine \"{engine}\" failed to {step}")]
    EngineStep {
        /// Engine id
        engine: String,
        /// Failed step
        step: &'static str,
    },

    /// Compliance mode could not be entered
    #[error("can't enter into FIPS mode")]
    ComplianceMode,

    /// Dispatch was asked for an unknown or unsupported kind
    #[error("Unknown algorithm '{0}'")]
    UnsupportedKind(String),

    /// The one-and-only RNG was not constructed
    #[error("random generator unavailable")]
    RngUnavailable,

    /// The factory instance or engine behind a handle was torn down by a reset
    #[error("crypto factory instance was reset")]
    InstanceReset,

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Streaming operation used in the wrong state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The log file could not be created
    #[error("could not create log file: {0}")]
    LogFile(String),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),
}

impl FactoryError {
    /// Returns the failure class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            FactoryError::LockPoolSize(_)
            | FactoryError::LockPoolAllocation(_)
            | FactoryError::CommandContextInit(_)
            | FactoryError::ContextAllocation(_)
            | FactoryError::LogFile(_) => ErrorClass::Configuration,
            FactoryError::TransportAlreadyLoaded
            | FactoryError::TransportNotFound(_)
            | FactoryError::TransportSymbolMissing { .. }
            | FactoryError::TransportInvalidInfo(_)
            | FactoryError::TransportInitSize { .. }
            | FactoryError::TransportInit { .. }
            | FactoryError::CommandLibraryUnavailable(_) => ErrorClass::PluginLoad,
            FactoryError::EngineUnavailable(_)
            | FactoryError::EngineStep { .. }
            | FactoryError::ComplianceMode => ErrorClass::Engine,
            FactoryError::UnsupportedKind(_) => ErrorClass::UnsupportedKind,
            FactoryError::RngUnavailable => ErrorClass::FatalConstruction,
            FactoryError::OpenSsl(_) => ErrorClass::Crypto,
            FactoryError::InvalidParameter(_)
            | FactoryError::InvalidState(_)
            | FactoryError::InstanceReset => ErrorClass::InvalidUsage,
        }
    }
}
