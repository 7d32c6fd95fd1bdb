// Copyright (C) Microsoft Corporation. All rights reserved.

//! Process-wide crypto factory.
//!
//! The factory is created on first demand and owns every subsystem it brings
//! up: the locking callback bridge, compliance mode, the hardware RNG engine,
//! the random generator, the TPM command context and the alternate suite
//! engine. Only the random generator is mandatory; every other subsystem
//! degrades to "absent" when it cannot be brought up.
//!
//! [`CryptoFactory::reset`] tears the instance down in reverse order, even
//! while callers still hold handles to it, and clears the slot so the next
//! [`CryptoFactory::instance`] rebuilds it. A handle held across a reset
//! answers every dispatch with [`FactoryError::InstanceReset`], and products
//! that depend on torn down subsystems stop working.

use std::fmt::Display;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::MappedRwLockReadGuard;
use parking_lot::Mutex;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;

use crate::algorithms::*;
use crate::compliance::enter_compliance_mode;
use crate::compliance::ComplianceModule;
use crate::compliance::OsslCompliance;
use crate::config::FactoryConfig;
use crate::engine::AltSuiteEngine;
use crate::engine::EngineApi;
use crate::engine::HardwareRngEngine;
use crate::engine::OsslEngineApi;
use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::kinds::AsymAlgo;
use crate::kinds::HashAlgo;
use crate::kinds::MacAlgo;
use crate::kinds::RngImpl;
use crate::kinds::SymAlgo;
use crate::lock_bridge::CallbackState;
use crate::lock_bridge::LockBridge;
use crate::lock_bridge::LockingHost;
use crate::lock_bridge::OsslLockingHost;
use crate::log::init_log;
use crate::native::DynamicLoader;
use crate::native::ModuleLoader;
use crate::sys_context::HardwareContext;

/// Constructor of the process-wide random generator.
pub type RngSource = fn() -> FactoryResult<Box<dyn Rng>>;

/// Native collaborators the factory brings up.
///
/// The defaults talk to the libcrypto linked into the process and to the
/// platform dynamic loader; tests substitute doubles.
#[derive(Clone)]
pub struct Backends {
    /// Legacy locking callback registry
    pub locking: Arc<dyn LockingHost>,

    /// ENGINE API
    pub engines: Arc<dyn EngineApi>,

    /// Compliance mode control
    pub compliance: Arc<dyn ComplianceModule>,

    /// Loader for transport plugins and the command library
    pub modules: Arc<dyn ModuleLoader>,

    /// Random generator constructor
    pub rng: RngSource,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            locking: Arc::new(OsslLockingHost::new()),
            engines: Arc::new(OsslEngineApi::new()),
            compliance: Arc::new(OsslCompliance::new()),
            modules: Arc::new(DynamicLoader),
            rng: OsslRng::boxed,
        }
    }
}

/// Everything needed to construct a factory instance.
#[derive(Clone, Default)]
pub struct FactoryOptions {
    /// Runtime configuration
    pub config: FactoryConfig,

    /// Native collaborators
    pub backends: Backends,
}

impl FactoryOptions {
    /// Environment configuration with the production backends.
    pub fn from_env() -> Self {
        Self {
            config: FactoryConfig::from_env(),
            backends: Backends::default(),
        }
    }
}

lazy_static! {
    static ref FACTORY: Mutex<Option<Arc<CryptoFactory>>> = Mutex::new(None);
}

/// Subsystems owned by one factory instance.
struct Subsystems {
    lock_bridge: Option<LockBridge>,
    fips_status: bool,
    rdrand: Option<HardwareRngEngine>,
    rng: Option<Arc<dyn Rng>>,
    hardware: Mutex<Option<HardwareContext>>,
    alt_engine: Option<Arc<AltSuiteEngine>>,
}

impl Subsystems {
    fn build(options: FactoryOptions) -> Self {
        init_log();
        let FactoryOptions { config, backends } = options;

        let mut subsystems = Self {
            lock_bridge: None,
            fips_status: false,
            rdrand: None,
            rng: None,
            hardware: Mutex::new(None),
            alt_engine: None,
        };

        match LockBridge::setup(backends.locking.clone()) {
            Ok(bridge) => subsystems.lock_bridge = Some(bridge),
            Err(e) => tracing::error!("could not set up the locking callback: {e}"),
        }

        if config.fips {
            if enter_compliance_mode(backends.compliance.as_ref()).is_err() {
                tracing::error!("crypto factory left in a degraded state");
                return subsystems;
            }
            subsystems.fips_status = true;
        }

        openssl::init();

        if config.hardware_rng {
            match HardwareRngEngine::attach(backends.engines.clone()) {
                Ok(engine) => subsystems.rdrand = Some(engine),
                Err(e) => tracing::warn!("hardware RNG unavailable: {e}"),
            }
        }

        match (backends.rng)() {
            Ok(rng) => subsystems.rng = Some(Arc::from(rng)),
            Err(e) => {
                tracing::error!("could not create the random generator: {e}");
                return subsystems;
            }
        }

        if let Some(transport) = &config.transport {
            match HardwareContext::bring_up(
                backends.modules.as_ref(),
                &config.sys_library,
                transport,
            ) {
                Ok(context) => *subsystems.hardware.get_mut() = Some(context),
                Err(e) => tracing::error!("TPM support unavailable: {e}"),
            }
        }

        if let Some(alt) = &config.alt_engine {
            match AltSuiteEngine::attach(backends.engines.clone(), alt) {
                Ok(engine) => subsystems.alt_engine = Some(Arc::new(engine)),
                Err(e) => tracing::warn!("alternate suite unavailable: {e}"),
            }
        }

        tracing::debug!("crypto factory constructed");
        subsystems
    }

    /// Releases everything in reverse construction order.
    ///
    /// Products only hold weak references, so the alternate suite engine is
    /// released here unless an operation on it is in flight.
    fn destroy(&mut self) {
        if let Some(engine) = self.alt_engine.take() {
            if Arc::strong_count(&engine) > 1 {
                tracing::warn!("{} engine in use during teardown", engine.id());
            }
        }

        if let Some(mut context) = self.hardware.get_mut().take() {
            context.teardown();
        }

        self.rng = None;
        self.rdrand = None;

        if let Some(mut bridge) = self.lock_bridge.take() {
            bridge.teardown();
        }
        tracing::debug!("crypto factory destroyed");
    }

    #[cfg(feature = "gost")]
    fn require_alt_engine(&self, kind: impl Display) -> FactoryResult<&Arc<AltSuiteEngine>> {
        self.alt_engine.as_ref().ok_or_else(|| {
            tracing::error!("{kind} needs the alternate suite engine, which is not loaded");
            FactoryError::UnsupportedKind(kind.to_string())
        })
    }
}

impl Drop for Subsystems {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// The crypto factory.
pub struct CryptoFactory {
    subsystems: RwLock<Option<Subsystems>>,
}

impl CryptoFactory {
    /// Returns the process-wide instance, constructing it from the
    /// environment on first use.
    pub fn instance() -> Arc<CryptoFactory> {
        Self::instance_with(FactoryOptions::from_env)
    }

    /// Returns the process-wide instance, constructing it from `options` on
    /// first use.
    ///
    /// `options` only runs when this call performs the construction.
    /// Concurrent first calls are serialized; exactly one constructs and all
    /// of them observe the same instance.
    pub fn instance_with(options: impl FnOnce() -> FactoryOptions) -> Arc<CryptoFactory> {
        let mut slot = FACTORY.lock();
        if let Some(factory) = slot.as_ref() {
            return factory.clone();
        }

        let factory = Arc::new(Self::construct(options()));
        *slot = Some(factory.clone());
        factory
    }

    /// Tears the instance down and clears the slot.
    ///
    /// Teardown completes before this returns, whether or not handles to the
    /// instance are still held. Those handles stay valid as values but
    /// answer every dispatch with [`FactoryError::InstanceReset`].
    pub fn reset() {
        let mut slot = FACTORY.lock();
        let Some(factory) = slot.take() else {
            return;
        };

        let handles = Arc::strong_count(&factory) - 1;
        if handles > 0 {
            tracing::warn!("crypto factory reset with {handles} outstanding handles");
        }
        factory.shutdown();
    }

    /// Returns true if an instance is live.
    pub fn is_initialized() -> bool {
        FACTORY.lock().is_some()
    }

    fn construct(options: FactoryOptions) -> Self {
        Self {
            subsystems: RwLock::new(Some(Subsystems::build(options))),
        }
    }

    /// Destroys the subsystems once in-flight dispatch calls finish.
    fn shutdown(&self) {
        let subsystems = self.subsystems.write().take();
        drop(subsystems);
    }

    fn live(&self) -> FactoryResult<MappedRwLockReadGuard<'_, Subsystems>> {
        RwLockReadGuard::try_map(self.subsystems.read(), Option::as_ref).map_err(|_| {
            tracing::error!("crypto factory used after reset");
            FactoryError::InstanceReset
        })
    }

    /// Whether this instance has been torn down by [`CryptoFactory::reset`].
    pub fn is_reset(&self) -> bool {
        self.subsystems.read().is_none()
    }

    /// Creates a symmetric cipher product.
    pub fn symmetric_algorithm(&self, kind: SymAlgo) -> FactoryResult<Box<dyn SymmetricAlgorithm>> {
        let _live = self.live()?;
        let algorithm: Box<dyn SymmetricAlgorithm> = match kind {
            SymAlgo::Aes => Box::new(OsslAes),
            SymAlgo::Des => Box::new(OsslDes),
            SymAlgo::Des3 => Box::new(OsslDes3),
            SymAlgo::Unknown => return Err(unknown_algorithm(kind)),
        };
        Ok(algorithm)
    }

    /// Creates an asymmetric scheme product.
    pub fn asymmetric_algorithm(
        &self,
        kind: AsymAlgo,
    ) -> FactoryResult<Box<dyn AsymmetricAlgorithm>> {
        #[cfg_attr(not(feature = "gost"), allow(unused_variables))]
        let live = self.live()?;
        let algorithm: Box<dyn AsymmetricAlgorithm> = match kind {
            AsymAlgo::Rsa => Box::new(OsslRsa),
            AsymAlgo::Dsa => Box::new(OsslDsa),
            AsymAlgo::Dh => Box::new(OsslDh),
            #[cfg(feature = "ecc")]
            AsymAlgo::Ecdh => Box::new(OsslEcdh),
            #[cfg(feature = "ecc")]
            AsymAlgo::Ecdsa => Box::new(OsslEcdsa),
            #[cfg(feature = "eddsa")]
            AsymAlgo::EdDsa => Box::new(OsslEddsa),
            #[cfg(feature = "gost")]
            AsymAlgo::Gost => Box::new(OsslGost::new(live.require_alt_engine(kind)?)),
            _ => return Err(unknown_algorithm(kind)),
        };
        Ok(algorithm)
    }

    /// Creates a hash product.
    pub fn hash_algorithm(&self, kind: HashAlgo) -> FactoryResult<Box<dyn HashAlgorithm>> {
        #[cfg_attr(not(feature = "gost"), allow(unused_variables))]
        let live = self.live()?;
        let algorithm = match kind {
            HashAlgo::Md5
            | HashAlgo::Sha1
            | HashAlgo::Sha224
            | HashAlgo::Sha256
            | HashAlgo::Sha384
            | HashAlgo::Sha512 => OsslHash::new(kind)?,
            #[cfg(feature = "gost")]
            HashAlgo::Gost => OsslHash::gost(live.require_alt_engine(kind)?),
            _ => return Err(unknown_algorithm(kind)),
        };
        Ok(Box::new(algorithm))
    }

    /// Creates a MAC product.
    pub fn mac_algorithm(&self, kind: MacAlgo) -> FactoryResult<Box<dyn MacAlgorithm>> {
        #[cfg_attr(not(feature = "gost"), allow(unused_variables))]
        let live = self.live()?;
        let algorithm: Box<dyn MacAlgorithm> = match kind {
            MacAlgo::HmacMd5
            | MacAlgo::HmacSha1
            | MacAlgo::HmacSha224
            | MacAlgo::HmacSha256
            | MacAlgo::HmacSha384
            | MacAlgo::HmacSha512 => Box::new(OsslHmac::new(kind)?),
            #[cfg(feature = "gost")]
            MacAlgo::HmacGost => Box::new(OsslHmac::gost(live.require_alt_engine(kind)?)),
            MacAlgo::CmacDes | MacAlgo::CmacAes => Box::new(OsslCmac::new(kind)?),
            _ => return Err(unknown_algorithm(kind)),
        };
        Ok(algorithm)
    }

    /// Returns a named random generator; only the default one exists.
    ///
    /// The handle fails with [`FactoryError::RngUnavailable`] after a reset.
    pub fn rng(&self, name: RngImpl) -> FactoryResult<Box<dyn Rng>> {
        match name {
            RngImpl::Default => {
                let live = self.live()?;
                let rng = live.rng.as_ref().ok_or(FactoryError::RngUnavailable)?;
                Ok(Box::new(SharedRng::new(rng)))
            }
            RngImpl::Unknown => {
                tracing::error!("Unknown RNG '{name}'");
                Err(FactoryError::UnsupportedKind(name.to_string()))
            }
        }
    }

    /// Whether compliance mode was entered and its self tests passed.
    pub fn fips_self_test_status(&self) -> bool {
        self.query(|live| live.fips_status)
    }

    /// Whether a TPM command context is bound.
    pub fn has_hardware(&self) -> bool {
        self.query(|live| live.hardware.lock().is_some())
    }

    /// Whether the hardware RNG engine is the default RAND method.
    pub fn has_hardware_rng(&self) -> bool {
        self.query(|live| live.rdrand.is_some())
    }

    /// Whether the alternate suite engine is live.
    pub fn has_alt_engine(&self) -> bool {
        self.query(|live| live.alt_engine.is_some())
    }

    /// Ownership state of the library's locking callback.
    pub fn locking_callback_state(&self) -> CallbackState {
        self.subsystems
            .read()
            .as_ref()
            .and_then(|live| live.lock_bridge.as_ref())
            .map_or(CallbackState::NotInstalled, LockBridge::state)
    }

    /// Runs `f` with exclusive access to the TPM command context.
    ///
    /// Returns `None` when no context is bound.
    pub fn with_command_context<R>(&self, f: impl FnOnce(&HardwareContext) -> R) -> Option<R> {
        let subsystems = self.subsystems.read();
        let context = subsystems.as_ref()?.hardware.lock();
        context.as_ref().map(f)
    }

    fn query(&self, f: impl FnOnce(&Subsystems) -> bool) -> bool {
        self.subsystems.read().as_ref().is_some_and(f)
    }
}

fn unknown_algorithm(kind: impl Display) -> FactoryError {
    tracing::error!("Unknown algorithm '{kind}'");
    FactoryError::UnsupportedKind(kind.to_string())
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_dispatch_without_singleton() {
        let _serial = crate::TEST_SERIAL.lock();
        let factory = CryptoFactory::construct(FactoryOptions {
            config: FactoryConfig {
                transport: None,
                hardware_rng: false,
                alt_engine: None,
                ..Default::default()
            },
            backends: Backends::default(),
        });

        let aes = factory.symmetric_algorithm(SymAlgo::Aes).expect("aes");
        assert_eq!(aes.kind(), SymAlgo::Aes);
        assert!(factory.symmetric_algorithm(SymAlgo::Unknown).is_err());

        for kind in [
            HashAlgo::Md5,
            HashAlgo::Sha1,
            HashAlgo::Sha224,
            HashAlgo::Sha256,
            HashAlgo::Sha384,
            HashAlgo::Sha512,
        ] {
            assert_eq!(factory.hash_algorithm(kind).expect("hash").kind(), kind);
        }
        assert!(matches!(
            factory.hash_algorithm(HashAlgo::Gost),
            Err(FactoryError::UnsupportedKind(_))
        ));
        assert!(matches!(
            factory.mac_algorithm(MacAlgo::HmacGost),
            Err(FactoryError::UnsupportedKind(_))
        ));
        assert!(matches!(
            factory.asymmetric_algorithm(AsymAlgo::Gost),
            Err(FactoryError::UnsupportedKind(_))
        ));
        assert!(factory.asymmetric_algorithm(AsymAlgo::Unknown).is_err());
        assert!(factory.mac_algorithm(MacAlgo::Unknown).is_err());

        assert!(factory.rng(RngImpl::Default).is_ok());
        assert!(factory.rng(RngImpl::Unknown).is_err());
        assert!(!factory.has_hardware());
        assert!(!factory.has_alt_engine());
    }

    #[test]
    fn test_shutdown_invalidates_handle() {
        let _serial = crate::TEST_SERIAL.lock();
        let factory = CryptoFactory::construct(FactoryOptions {
            config: FactoryConfig {
                transport: None,
                hardware_rng: false,
                alt_engine: None,
                ..Default::default()
            },
            backends: Backends::default(),
        });
        let rng = factory.rng(RngImpl::Default).expect("rng");
        assert!(!factory.is_reset());

        factory.shutdown();
        assert!(factory.is_reset());
        assert!(matches!(
            factory.symmetric_algorithm(SymAlgo::Aes),
            Err(FactoryError::InstanceReset)
        ));
        assert!(matches!(
            factory.rng(RngImpl::Default),
            Err(FactoryError::InstanceReset)
        ));
        assert!(matches!(
            rng.generate_vec(16),
            Err(FactoryError::RngUnavailable)
        ));
        assert_eq!(factory.locking_callback_state(), CallbackState::NotInstalled);
        assert!(factory.with_command_context(|_| ()).is_none());

        factory.shutdown();
    }
}
