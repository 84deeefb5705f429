//! Engine configuration.
//!
//! Everything tunable about a build session lives here, constructed through
//! builders so call sites only name what they change. Parsing configuration
//! *files* is the caller's job; the engine consumes the typed values plus
//! the two recognized environment variables (see [`AppServerParams`] and
//! [`injected_translations`]).

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tracing::{debug, instrument};

use crate::{
    dispatch::DispatchLimits,
    fingerprint::FingerprintSalt,
    sandbox::breakaway::BreakawayMatcher,
    sandbox::opaque::MarkPolicy,
    translate::{DirectoryTranslator, Translation},
};

/// The environment variable that switches the process into app-server mode.
/// When set, startup parameters come exclusively from its value and command
/// line arguments are rejected.
pub const APP_SERVER_CONFIG_ENV: &str = "KILN_APP_SERVER_CONFIG";

/// The environment variable carrying injected directory translations in the
/// `src|tgt;src|tgt` format. Parsed before any other path handling.
pub const DIRECTORY_TRANSLATIONS_ENV: &str = "KILN_DIRECTORY_TRANSLATIONS";

/// Retry budget for infrastructure-prone operations.
#[derive(Clone, Copy, Debug, Builder)]
pub struct RetryPolicy {
    #[builder(default = 3)]
    pub attempts: u32,
    #[builder(default = Duration::from_millis(100))]
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Tunables for the risk-threshold pin algorithm.
///
/// The risk model: with `n` location records for a piece of content, the
/// chance it is unavailable everywhere is roughly `q_m^n` when the records
/// are verified and `(q_m + q_f·(1-q_m))^n` when they are not, where `q_m`
/// is the chance a machine is down and `q_f` the chance a record is stale.
/// Pinning succeeds by record count alone when the risk clears
/// `risk_tolerance`.
#[derive(Clone, Copy, Debug, Builder)]
pub struct PinConfig {
    /// `q_m`: probability a recorded machine is unavailable.
    #[builder(default = 0.05)]
    pub machine_risk: f64,
    /// `q_f`: probability a location record is stale (machine up, file gone).
    #[builder(default = 0.1)]
    pub file_risk: f64,
    /// `Q`: the unavailability risk a successful pin may leave behind.
    #[builder(default = 1e-4)]
    pub risk_tolerance: f64,
    /// Base TTL for pin-cache entries.
    #[builder(default = Duration::from_secs(30 * 60))]
    pub base_ttl: Duration,
    /// Geometric discount applied per missing location record when
    /// computing pin-cache TTLs. Must be < 1.
    #[builder(default = 0.5)]
    pub ttl_decay: f64,
    /// Proactive copy triggers while the replica count is below this.
    #[builder(default = 3)]
    pub replica_threshold: usize,
    /// Concurrent existence-verification calls the pin path may issue.
    #[builder(default = 4)]
    pub verify_capacity: usize,
    /// Skip the record-count and verification shortcuts and always copy
    /// content locally to satisfy a pin.
    #[builder(default = false)]
    pub always_copy_local: bool,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Sandbox policy configuration.
#[derive(Clone, Debug, Builder)]
pub struct SandboxConfig {
    /// Child processes matching any of these leave the sandbox unobserved.
    #[builder(default)]
    pub breakaway: Vec<BreakawayMatcher>,
    /// Report access violations as warnings instead of errors. Pips that
    /// complete with warned violations become uncacheable.
    #[builder(default = false)]
    pub violations_are_warnings: bool,
    /// How shared-opaque outputs are marked on this host.
    #[builder(default = MarkPolicy::default())]
    pub mark_policy: MarkPolicy,
    /// Whether mark detection follows symlinks. Hosts where directory
    /// symlinks are not first-class outputs follow; hosts where they are do
    /// not.
    #[builder(default = false)]
    pub follow_symlinks_for_marks: bool,
    /// Whether the local CAS keeps a hardlink to ingested outputs, which
    /// raises the expected hardlink count during marking from 1 to 2.
    #[builder(default = true)]
    pub cas_keeps_hardlink: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Everything tunable about one build session.
#[derive(Clone, Debug, Builder)]
pub struct EngineConfig {
    #[builder(default = FingerprintSalt::new(""))]
    pub fingerprint_salt: FingerprintSalt,
    #[builder(default)]
    pub limits: DispatchLimits,
    #[builder(default)]
    pub pin: PinConfig,
    #[builder(default)]
    pub sandbox: SandboxConfig,
    #[builder(default)]
    pub retry: RetryPolicy,
    /// Consumers may skip pinning outputs whose descriptor is younger than
    /// this window.
    #[builder(default = Duration::from_secs(10 * 60))]
    pub pin_elision_window: Duration,
    /// How long cancellation waits for in-flight pips. `None` waits
    /// indefinitely.
    pub cancel_timeout: Option<Duration>,
    /// Admission cap for place/put content operations.
    #[builder(default = 16)]
    pub max_put_place_ops: usize,
    /// Mounts whose observations are dropped during path-set
    /// canonicalization.
    #[builder(default)]
    pub untracked_mounts: Vec<PathBuf>,
    /// Directory translations, applied uniformly across fingerprinting,
    /// access reporting, and materialization.
    #[builder(default)]
    pub translations: Vec<Translation>,
    /// Free-form provenance recorded into published descriptors.
    #[builder(default = String::new())]
    pub trace_info: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EngineConfig {
    /// Seal the configured translations, including any injected through the
    /// environment. Injected rules come first so explicit configuration can
    /// only narrow them (longest prefix still wins).
    #[instrument(skip(self))]
    pub fn sealed_translator(&self) -> Result<DirectoryTranslator> {
        let mut rules = injected_translations()?;
        rules.extend(self.translations.iter().cloned());
        DirectoryTranslator::seal(rules)
    }
}

/// Startup parameters for app-server mode, parsed from
/// [`APP_SERVER_CONFIG_ENV`].
///
/// The engine itself does not host a server; it only recognizes the mode so
/// a host wrapper can consume the parsed parameters. The value is a
/// semicolon-separated list of `key=value` pairs.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct AppServerParams {
    pub params: BTreeMap<String, String>,
}

impl AppServerParams {
    /// Read app-server parameters from the environment.
    ///
    /// Returns `None` when the variable is unset (normal mode). When it is
    /// set, any command line arguments are an error: the server owns its
    /// own startup parameters.
    #[instrument(skip(cli_args))]
    pub fn from_env(cli_args: &[String]) -> Result<Option<Self>> {
        let Ok(raw) = std::env::var(APP_SERVER_CONFIG_ENV) else {
            return Ok(None);
        };

        if !cli_args.is_empty() {
            bail!("command line arguments are not allowed in app-server mode: {cli_args:?}");
        }

        let mut params = BTreeMap::new();
        for pair in raw.split(';').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                bail!("malformed app-server parameter: {pair:?}");
            };
            params.insert(key.to_string(), value.to_string());
        }
        debug!(count = params.len(), "parsed app-server parameters");
        Ok(Some(Self { params }))
    }
}

/// Read directory translations injected through the environment.
pub fn injected_translations() -> Result<Vec<Translation>> {
    match std::env::var(DIRECTORY_TRANSLATIONS_ENV) {
        Ok(raw) => DirectoryTranslator::parse_injection(&raw)
            .with_context(|| format!("parse {DIRECTORY_TRANSLATIONS_ENV}")),
        Err(_) => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.pin.ttl_decay < 1.0);
        assert!(config.pin.risk_tolerance < config.pin.machine_risk);
        pretty_assert_eq!(config.cancel_timeout, None);
    }

    #[test]
    fn app_server_params_parse() {
        // Environment access in tests is process-wide; use a distinct
        // variable lifecycle within this single test.
        unsafe { std::env::set_var(APP_SERVER_CONFIG_ENV, "port=9000;store=/var/kiln") };
        let params = AppServerParams::from_env(&[]).unwrap().unwrap();
        pretty_assert_eq!(params.params["port"], "9000");
        pretty_assert_eq!(params.params["store"], "/var/kiln");

        let err = AppServerParams::from_env(&["--flag".to_string()]);
        assert!(err.is_err());

        unsafe { std::env::remove_var(APP_SERVER_CONFIG_ENV) };
        assert!(AppServerParams::from_env(&[]).unwrap().is_none());
    }
}
