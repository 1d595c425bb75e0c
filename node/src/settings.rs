//! # Runtime Settings
//!
//! Loaded once at startup, in three layers: built-in defaults, then the
//! optional TOML file passed with `--config`, then `WEPAY_*` environment
//! variables (`WEPAY_MCH_ID`, `WEPAY_DATABASE_DSN`, ...).
//!
//! Merchant identity has no default. A missing `mch_id` is a startup error,
//! not a request-time surprise.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use wepay_core::config::{
    AES_KEY_LENGTH, DEFAULT_IO_TIMEOUT, DEFAULT_TRANSFER_SCENE_ID, DEFAULT_USER_RECV_PERCEPTION,
    PROGRESS_TICK_DELAY, PSP_BASE_URL,
};
use wepay_core::transfer::TransferSettings;
use wepay_core::MerchantConfig;

use crate::logging::LogFormat;

/// Prefix of the environment variables read by [`Settings::load`].
pub const ENV_PREFIX: &str = "WEPAY";

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DATABASE_DSN: &str = "sled://wepay-data";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub appid: String,
    pub mch_id: String,
    /// Serial number of the merchant API certificate.
    pub cert_serial: String,
    pub private_key_path: PathBuf,
    /// Key id the PSP puts in `Wechatpay-Serial`.
    pub pay_public_key_id: String,
    pub pay_public_key_path: PathBuf,
    /// 32-byte key for callback decryption.
    pub api_v3_key: String,
    pub notify_url: String,
    /// `postgres://...`, `sled://<path>`, a bare path, or `sled::memory`.
    pub database_dsn: String,
    pub listen_addr: String,
    pub psp_base_url: String,
    pub transfer_scene_id: String,
    pub user_recv_perception: String,
    pub io_timeout_secs: u64,
    /// 0 disables the progress tick.
    pub progress_tick_secs: u64,
    pub log_format: String,
}

impl Settings {
    /// Defaults, then `path` if given, then `WEPAY_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("database_dsn", DEFAULT_DATABASE_DSN)?
            .set_default("listen_addr", DEFAULT_LISTEN_ADDR)?
            .set_default("psp_base_url", PSP_BASE_URL)?
            .set_default("transfer_scene_id", DEFAULT_TRANSFER_SCENE_ID)?
            .set_default("user_recv_perception", DEFAULT_USER_RECV_PERCEPTION)?
            .set_default("io_timeout_secs", DEFAULT_IO_TIMEOUT.as_secs() as i64)?
            .set_default("progress_tick_secs", PROGRESS_TICK_DELAY.as_secs() as i64)?
            .set_default("log_format", "pretty")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()).format(FileFormat::Toml));
        }

        let settings: Settings = builder
            .add_source(env)
            .build()
            .context("failed to assemble settings")?
            .try_deserialize()
            .context("invalid settings")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("appid", &self.appid),
            ("mch_id", &self.mch_id),
            ("cert_serial", &self.cert_serial),
            ("pay_public_key_id", &self.pay_public_key_id),
            ("notify_url", &self.notify_url),
        ] {
            if value.trim().is_empty() {
                bail!("setting `{name}` must not be empty");
            }
        }
        if self.api_v3_key.len() != AES_KEY_LENGTH {
            bail!(
                "setting `api_v3_key` must be {AES_KEY_LENGTH} bytes, got {}",
                self.api_v3_key.len()
            );
        }
        if self.io_timeout_secs == 0 {
            bail!("setting `io_timeout_secs` must be positive");
        }
        Ok(())
    }

    /// Read both PEM keys and build the immutable merchant descriptor.
    pub fn merchant(&self) -> Result<MerchantConfig> {
        MerchantConfig::load(
            &self.mch_id,
            &self.cert_serial,
            &self.private_key_path,
            &self.pay_public_key_id,
            &self.pay_public_key_path,
            &self.api_v3_key,
        )
        .context("failed to load merchant keys")
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        let mut settings = TransferSettings::new(&self.appid, &self.notify_url);
        settings.transfer_scene_id = self.transfer_scene_id.clone();
        settings.user_recv_perception = self.user_recv_perception.clone();
        settings.io_timeout = self.io_timeout();
        settings.progress_tick =
            (self.progress_tick_secs > 0).then(|| Duration::from_secs(self.progress_tick_secs));
        settings
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn log_format(&self) -> LogFormat {
        LogFormat::from_str_lossy(&self.log_format)
    }
}

/// A `wepay.toml` for the files `init` writes into `dir`.
pub fn template(dir: &Path, api_v3_key: &str) -> String {
    format!(
        r#"# wepay-node settings. Any key can be overridden with WEPAY_<KEY>.
appid = "wx0000000000000000"
mch_id = "1900000000"
cert_serial = "REPLACE_WITH_CERT_SERIAL"
# Merchant signing key written by `wepay-node init`. Upload the matching
# apiclient_pub.pem to the PSP merchant platform.
private_key_path = "{private_key}"
# PSP platform public key and its id, both from the merchant platform.
pay_public_key_id = "PUB_KEY_ID_REPLACE_ME"
pay_public_key_path = "{public_key}"
api_v3_key = "{api_v3_key}"
notify_url = "https://merchant.example.com/transfer/notify"
database_dsn = "{dsn}"
listen_addr = "{listen}"
log_format = "pretty"
"#,
        private_key = dir.join("apiclient_key.pem").display(),
        public_key = dir.join("pub_key.pem").display(),
        dsn = DEFAULT_DATABASE_DSN,
        listen = DEFAULT_LISTEN_ADDR,
    )
}
