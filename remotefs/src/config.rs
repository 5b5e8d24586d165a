use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::transport::backoff::Backoff;
use crate::transport::http::TransportOptions;
use crate::transport::transfer::TransferConfig;

const DEFAULT_BASE_URL: &str = "https://cloud-api.yandex.net";
const DEFAULT_ROOT: &str = "disk";
const DEFAULT_PAGE_SIZE: u64 = 100;
const DEFAULT_RETRY_ATTEMPTS: u64 = 3;
const DEFAULT_DOWNLOAD_CONCURRENCY: u64 = 4;
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 2;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub base_url: String,
    pub token: String,
    pub root_name: String,
    pub download_dir: PathBuf,
    pub page_size: u32,
    pub retry_attempts: u32,
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl SessionConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let token = std::env::var("REMOTEFS_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .context("REMOTEFS_TOKEN is not set")?;
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let download_dir = std::env::var("REMOTEFS_DOWNLOAD_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| dirs::download_dir().unwrap_or_else(|| home.clone()));
        let base_url =
            std::env::var("REMOTEFS_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let root_name = std::env::var("REMOTEFS_ROOT")
            .ok()
            .map(|value| value.trim_matches('/').to_string())
            .filter(|value| !value.is_empty() && !value.contains('/'))
            .unwrap_or_else(|| DEFAULT_ROOT.to_string());

        Ok(Self {
            base_url,
            token,
            root_name,
            download_dir,
            page_size: clamp_u32(read_u64_env("REMOTEFS_PAGE_SIZE", DEFAULT_PAGE_SIZE)),
            retry_attempts: clamp_u32(read_u64_env(
                "REMOTEFS_RETRY_ATTEMPTS",
                DEFAULT_RETRY_ATTEMPTS,
            )),
            download_concurrency: read_u64_env(
                "REMOTEFS_DOWNLOAD_CONCURRENCY",
                DEFAULT_DOWNLOAD_CONCURRENCY,
            ) as usize,
            upload_concurrency: read_u64_env(
                "REMOTEFS_UPLOAD_CONCURRENCY",
                DEFAULT_UPLOAD_CONCURRENCY,
            ) as usize,
        })
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            download_concurrency: self.download_concurrency,
            upload_concurrency: self.upload_concurrency,
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            page_size: self.page_size,
            retry: Backoff::new(
                Duration::from_millis(250),
                Duration::from_secs(8),
                self.retry_attempts,
            ),
            ..TransportOptions::default()
        }
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_tilde_prefixes() {
        let home = Path::new("/home/user");
        assert_eq!(expand_with_home("~", home), PathBuf::from("/home/user"));
        assert_eq!(
            expand_with_home("~/Downloads", home),
            PathBuf::from("/home/user/Downloads")
        );
        assert_eq!(expand_with_home("/srv/data", home), PathBuf::from("/srv/data"));
        assert_eq!(expand_with_home("~other", home), PathBuf::from("~other"));
    }

    #[test]
    fn unset_or_invalid_numbers_fall_back() {
        assert_eq!(read_u64_env("REMOTEFS_TEST_UNSET_VARIABLE", 7), 7);
    }

    #[test]
    fn clamps_oversized_values() {
        assert_eq!(clamp_u32(5), 5);
        assert_eq!(clamp_u32(u64::MAX), u32::MAX);
    }

    #[test]
    fn transport_options_follow_config() {
        let config = SessionConfig {
            base_url: DEFAULT_BASE_URL.into(),
            token: "t".into(),
            root_name: DEFAULT_ROOT.into(),
            download_dir: PathBuf::from("/tmp"),
            page_size: 25,
            retry_attempts: 5,
            download_concurrency: 3,
            upload_concurrency: 1,
        };
        let options = config.transport_options();
        assert_eq!(options.page_size, 25);
        assert_eq!(options.retry.max_attempts(), 5);
        let transfer = config.transfer_config();
        assert_eq!(transfer.download_concurrency, 3);
        assert_eq!(transfer.upload_concurrency, 1);
    }
}
