// Copyright (C) Microsoft Corporation. All rights reserved.

//! Factory configuration read from the environment.

use std::ffi::CString;

use crate::engine::AltEngineConfig;
use crate::sys_context::TSS2_SYS_LIBRARY;
use crate::tcti::TransportSpec;

/// Transport selection, `name[:config]` or `none`.
pub const TCTI_ENV: &str = "AZIHSM_FACTORY_TCTI";
/// Command-marshaling library name or path.
pub const SYS_LIB_ENV: &str = "AZIHSM_FACTORY_SYS_LIB";
/// Enables the hardware RNG engine.
pub const RDRAND_ENV: &str = "AZIHSM_FACTORY_RDRAND";
/// Alternate suite engine id, or `none`.
pub const ALT_ENGINE_ENV: &str = "AZIHSM_FACTORY_ALT_ENGINE";
/// Alternate suite control string, `CMD=ARG` or `none`.
pub const ALT_ENGINE_PARAMS_ENV: &str = "AZIHSM_FACTORY_ALT_ENGINE_PARAMS";
/// Enters FIPS mode at construction.
pub const FIPS_ENV: &str = "AZIHSM_FACTORY_FIPS";

/// Transport used when none is configured.
pub const DEFAULT_TCTI: &str = "tabrmd";

const DISABLED: &str = "none";

/// Runtime configuration of a factory instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryConfig {
    /// Transport to bring up, `None` disables hardware support
    pub transport: Option<TransportSpec>,

    /// Command-marshaling library
    pub sys_library: String,

    /// Attach the hardware RNG engine
    pub hardware_rng: bool,

    /// Alternate suite engine, `None` disables it
    pub alt_engine: Option<AltEngineConfig>,

    /// Enter FIPS mode
    pub fips: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            transport: Some(TransportSpec {
                name: DEFAULT_TCTI.to_string(),
                config: None,
            }),
            sys_library: TSS2_SYS_LIBRARY.to_string(),
            hardware_rng: true,
            alt_engine: cfg!(feature = "gost").then(AltEngineConfig::gost),
            fips: false,
        }
    }
}

impl FactoryConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from `lookup`, keeping the default for every
    /// unset or malformed variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(TCTI_ENV) {
            if value.eq_ignore_ascii_case(DISABLED) {
                config.transport = None;
            } else {
                match TransportSpec::parse(&value) {
                    Ok(spec) => config.transport = Some(spec),
                    Err(e) => tracing::warn!("ignoring {TCTI_ENV}: {e}"),
                }
            }
        }

        if let Some(value) = lookup(SYS_LIB_ENV).filter(|v| !v.is_empty()) {
            config.sys_library = value;
        }

        if let Some(value) = lookup(RDRAND_ENV) {
            config.hardware_rng = parse_flag(RDRAND_ENV, &value, config.hardware_rng);
        }

        if let Some(value) = lookup(FIPS_ENV) {
            config.fips = parse_flag(FIPS_ENV, &value, config.fips);
        }

        if let Some(value) = lookup(ALT_ENGINE_ENV) {
            if value.eq_ignore_ascii_case(DISABLED) {
                config.alt_engine = None;
            } else {
                match CString::new(value) {
                    Ok(id) => {
                        let mut engine = AltEngineConfig::gost();
                        if id != engine.id {
                            engine.control = None;
                        }
                        engine.id = id;
                        config.alt_engine = Some(engine);
                    }
                    Err(_) => tracing::warn!("ignoring {ALT_ENGINE_ENV}: embedded NUL"),
                }
            }
        }

        let params = lookup(ALT_ENGINE_PARAMS_ENV);
        if let (Some(engine), Some(value)) = (config.alt_engine.as_mut(), params) {
            if value.eq_ignore_ascii_case(DISABLED) {
                engine.control = None;
            } else {
                match parse_control(&value) {
                    Some(control) => engine.control = Some(control),
                    None => tracing::warn!("ignoring {ALT_ENGINE_PARAMS_ENV}: expected CMD=ARG"),
                }
            }
        }

        config
    }
}

fn parse_flag(key: &str, value: &str, default: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => true,
        "0" | "false" | "off" | "no" => false,
        _ => {
            tracing::warn!("ignoring {key}={value}: expected a boolean");
            default
        }
    }
}

fn parse_control(value: &str) -> Option<(CString, CString)> {
    let (cmd, arg) = value.split_once('=')?;
    if cmd.is_empty() {
        return None;
    }
    Some((CString::new(cmd).ok()?, CString::new(arg).ok()?))
}
