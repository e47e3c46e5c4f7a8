//! Platform description: which models are mapped where.
//!
//! A [`PlatformConfig`] is read from JSON. Every model has a default
//! placement; a key set to `null` leaves the model out, a key that is
//! absent keeps the default. Addresses may be JSON numbers or strings in
//! any notation [`parse_number`] accepts.
//!
//! ```json
//! {
//!   "hmac": { "base": "0x4111_0000" },
//!   "csrng": { "base": "0x4115_0000", "config": { "mode": "FixedSeed", "seed": 7 } },
//!   "xrdc": null
//! }
//! ```

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use peripherals::{
    Csrng, CsrngConfig, Edn, EntropyProvider, EntropySrc, EntropySrcConfig, Hmac, Keymgr,
    KeymgrConfig, Kmac, KmacConfig, Otp, OtpConfig, RngConfig, RngCtrl, RngCtrlConfig, SimpleRng,
    SystemBus, Xrdc, XrdcConfig,
};
use regbank_core::{Collaborator, ConfigError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

use crate::script::parse_number;

/// Default base of the minimal random number generator.
pub const RNG_BASE: u64 = 0x4000_0000;
/// Default base of the TRNG controller.
pub const RNGCTRL_BASE: u64 = 0x4001_0000;
/// Default base of the access controller.
pub const XRDC_BASE: u64 = 0x4003_0000;
/// Default base of the OTP controller.
pub const OTP_BASE: u64 = 0x4013_0000;
/// Default base of the HMAC accelerator.
pub const HMAC_BASE: u64 = 0x4111_0000;
/// Default base of the KMAC accelerator.
pub const KMAC_BASE: u64 = 0x4112_0000;
/// Default base of the key manager.
pub const KEYMGR_BASE: u64 = 0x4114_0000;
/// Default base of the CSRNG.
pub const CSRNG_BASE: u64 = 0x4115_0000;
/// Default base of the entropy source.
pub const ENTROPY_SRC_BASE: u64 = 0x4116_0000;
/// Default base of the EDN.
pub const EDN_BASE: u64 = 0x4117_0000;

/// Placement of one model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Placement<C> {
    /// Bus address of the model's first register.
    #[serde(deserialize_with = "address")]
    pub base: u64,
    /// Model configuration.
    #[serde(default)]
    pub config: C,
}

impl<C: Default> Placement<C> {
    fn at(base: u64) -> Option<Self> {
        Some(Self {
            base,
            config: C::default(),
        })
    }
}

fn address<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => {
            parse_number(&text).ok_or_else(|| D::Error::custom(format!("invalid address `{text}`")))
        }
    }
}

/// Models to instantiate and their placements.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    /// Minimal random number generator.
    pub rng: Option<Placement<RngConfig>>,
    /// FIFO-backed TRNG controller.
    pub rngctrl: Option<Placement<RngCtrlConfig>>,
    /// Access controller.
    pub xrdc: Option<Placement<XrdcConfig>>,
    /// OTP controller.
    pub otp: Option<Placement<OtpConfig>>,
    /// HMAC accelerator.
    pub hmac: Option<Placement<()>>,
    /// KMAC accelerator.
    pub kmac: Option<Placement<KmacConfig>>,
    /// Key manager.
    pub keymgr: Option<Placement<KeymgrConfig>>,
    /// CSRNG, fed by `entropy_src` when both are mapped.
    pub csrng: Option<Placement<CsrngConfig>>,
    /// Entropy source.
    pub entropy_src: Option<Placement<EntropySrcConfig>>,
    /// EDN, drawing from `csrng` when both are mapped.
    pub edn: Option<Placement<()>>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            rng: Placement::at(RNG_BASE),
            rngctrl: Placement::at(RNGCTRL_BASE),
            xrdc: Placement::at(XRDC_BASE),
            otp: Placement::at(OTP_BASE),
            hmac: Placement::at(HMAC_BASE),
            kmac: Placement::at(KMAC_BASE),
            keymgr: Placement::at(KEYMGR_BASE),
            csrng: Placement::at(CSRNG_BASE),
            entropy_src: Placement::at(ENTROPY_SRC_BASE),
            edn: Placement::at(EDN_BASE),
        }
    }
}

/// Failure to load or instantiate a platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The description file could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        /// Description path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The description is not valid JSON for a [`PlatformConfig`].
    #[error("invalid platform description: {0}")]
    Json(#[from] serde_json::Error),
    /// A model rejected its configuration or placement.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PlatformConfig {
    /// Parses a JSON description.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Json`] for malformed input or unknown keys.
    pub fn from_json(text: &str) -> Result<Self, PlatformError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads and parses a JSON description file.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Io`] when the file cannot be read and
    /// [`PlatformError::Json`] when it does not parse.
    pub fn load(path: &Path) -> Result<Self, PlatformError> {
        let text = fs::read_to_string(path).map_err(|source| PlatformError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Instantiates every configured model and maps it onto a new bus.
    ///
    /// Mapped names match the keys of the description.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] of the first model that rejects its
    /// configuration or whose window collides with another.
    pub fn build(&self) -> Result<SystemBus, ConfigError> {
        let mut bus = SystemBus::new();
        if let Some(p) = &self.rng {
            bus.map("rng", p.base, Box::new(SimpleRng::new(p.config)?))?;
        }
        if let Some(p) = &self.rngctrl {
            bus.map("rngctrl", p.base, Box::new(RngCtrl::new(p.config)?))?;
        }
        if let Some(p) = &self.xrdc {
            bus.map("xrdc", p.base, Box::new(Xrdc::new(p.config.clone())?))?;
        }
        if let Some(p) = &self.otp {
            bus.map("otp", p.base, Box::new(Otp::new(p.config.clone())?))?;
        }
        if let Some(p) = &self.hmac {
            bus.map("hmac", p.base, Box::new(Hmac::new()?))?;
        }
        if let Some(p) = &self.kmac {
            bus.map("kmac", p.base, Box::new(Kmac::new(p.config.clone())?))?;
        }
        if let Some(p) = &self.keymgr {
            bus.map("keymgr", p.base, Box::new(Keymgr::new(p.config.clone())?))?;
        }

        let source = match &self.entropy_src {
            Some(p) => {
                let source = Rc::new(RefCell::new(EntropySrc::new(p.config)?));
                bus.map("entropy_src", p.base, Box::new(Rc::clone(&source)))?;
                Some(source)
            }
            None => None,
        };
        let csrng = match &self.csrng {
            Some(p) => {
                let csrng = Rc::new(RefCell::new(Csrng::new(p.config.clone())?));
                if let Some(source) = source {
                    let provider: Rc<RefCell<dyn EntropyProvider>> = source;
                    csrng
                        .borrow_mut()
                        .set_entropy_source(Collaborator::new(&provider));
                    debug!("csrng seeded from entropy_src");
                }
                bus.map("csrng", p.base, Box::new(Rc::clone(&csrng)))?;
                Some(csrng)
            }
            None => None,
        };
        if let Some(p) = &self.edn {
            let edn = Rc::new(RefCell::new(Edn::new()?));
            if let Some(csrng) = &csrng {
                edn.borrow_mut().set_csrng(Collaborator::new(csrng));
                debug!("edn linked to csrng");
            }
            bus.map("edn", p.base, Box::new(edn))?;
        }
        Ok(bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peripherals::csrng::CSRNG_CTRL;
    use regbank_core::AccessWidth;

    #[test]
    fn default_platform_maps_every_model() {
        let bus = PlatformConfig::default().build().unwrap();
        let names: Vec<&str> = bus.windows().map(|w| w.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "rng",
                "rngctrl",
                "xrdc",
                "otp",
                "hmac",
                "kmac",
                "keymgr",
                "csrng",
                "entropy_src",
                "edn",
            ]
        );
    }

    #[test]
    fn null_removes_a_model_and_strings_are_addresses() {
        let config = PlatformConfig::from_json(
            r#"{ "xrdc": null, "hmac": { "base": "0x5000_0000" }, "rng": { "base": 4096 } }"#,
        )
        .unwrap();
        assert_eq!(config.xrdc, None);
        assert_eq!(config.hmac.as_ref().map(|p| p.base), Some(0x5000_0000));
        assert_eq!(config.rng.as_ref().map(|p| p.base), Some(4096));
        assert_eq!(config.kmac, PlatformConfig::default().kmac);

        let bus = config.build().unwrap();
        assert!(bus.peripheral("xrdc").is_none());
        assert!(bus.windows().any(|w| w.name == "hmac" && w.start == 0x5000_0000));
    }

    #[test]
    fn model_configuration_is_forwarded() {
        let config = PlatformConfig::from_json(
            r#"{ "csrng": { "base": "0x4115_0000", "config": { "mode": "FixedData", "fixed_data": [1, 2] } } }"#,
        )
        .unwrap();
        let csrng = config.csrng.unwrap();
        assert_eq!(csrng.config.fixed_data, [1, 2]);
        assert_eq!(csrng.config.seed, CsrngConfig::default().seed);
    }

    #[test]
    fn overlapping_placement_is_a_config_error() {
        let config = PlatformConfig::from_json(r#"{ "kmac": { "base": "0x4111_0800" } }"#).unwrap();
        assert!(matches!(
            config.build(),
            Err(ConfigError::InvalidArgument { name: "base", .. })
        ));
    }

    #[test]
    fn unknown_keys_and_bad_addresses_are_rejected() {
        assert!(matches!(
            PlatformConfig::from_json(r#"{ "uart": { "base": 0 } }"#),
            Err(PlatformError::Json(_))
        ));
        assert!(matches!(
            PlatformConfig::from_json(r#"{ "rng": { "base": "0xZZ" } }"#),
            Err(PlatformError::Json(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.json");
        fs::write(&path, r#"{ "otp": null }"#).unwrap();
        let config = PlatformConfig::load(&path).unwrap();
        assert_eq!(config.otp, None);

        let missing = PlatformConfig::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, PlatformError::Io { .. }));
        assert!(missing.to_string().contains("missing.json"));
    }

    #[test]
    fn key_manager_advances_through_the_bus() {
        let mut bus = PlatformConfig::default().build().unwrap();
        bus.write(KEYMGR_BASE + 0x04, AccessWidth::DoubleWord, 1);
        bus.write(KEYMGR_BASE + 0x14, AccessWidth::DoubleWord, 1);
        assert_eq!(bus.read(KEYMGR_BASE + 0xE4, AccessWidth::DoubleWord), 1);
        let keymgr = bus.peripheral("keymgr").unwrap();
        assert_eq!(keymgr.line_level("op_done"), Some(true));
    }

    #[test]
    fn linked_models_survive_the_build() {
        let mut bus = PlatformConfig::default().build().unwrap();
        bus.write(CSRNG_BASE + CSRNG_CTRL, AccessWidth::DoubleWord, 0x966);
        assert_eq!(bus.read(CSRNG_BASE + CSRNG_CTRL, AccessWidth::DoubleWord), 0x966);
    }
}
