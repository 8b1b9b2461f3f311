// Configuration for the server, read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use synth_core::{ChatterboxConfig, Device};

/// Credentials the platform proxy forwards with every authenticated call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyAuth {
    pub key: String,
    pub secret: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub app_name: String,
    pub port: u16,
    pub model_dir: PathBuf,
    pub device: String,
    pub intra_threads: usize,
    pub max_new_tokens: usize,
    pub bucket_mount: PathBuf,
    pub output_prefix: String,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub proxy_auth: Option<ProxyAuth>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            app_name: "aurasync-backend".to_string(),
            port: 8085,
            model_dir: PathBuf::from("/root/.cache/huggingface/chatterbox-multilingual"),
            device: "cuda".to_string(),
            intra_threads: 4,
            max_new_tokens: 1000,
            bucket_mount: PathBuf::from("/s3-mount"),
            output_prefix: "tts".to_string(),
            rate_limit_per_minute: 60,
            request_timeout_secs: 300,
            cors_allowed_origins: None,
            proxy_auth: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            });

        let proxy_auth = match (
            std::env::var("PROXY_AUTH_KEY").ok().filter(|v| !v.is_empty()),
            std::env::var("PROXY_AUTH_SECRET").ok().filter(|v| !v.is_empty()),
        ) {
            (Some(key), Some(secret)) => Some(ProxyAuth { key, secret }),
            _ => None,
        };

        Self {
            app_name: env_string("APP_NAME", &defaults.app_name),
            port: env_parse("PORT", defaults.port),
            model_dir: PathBuf::from(env_string(
                "MODEL_DIR",
                &defaults.model_dir.to_string_lossy(),
            )),
            device: env_string("DEVICE", &defaults.device),
            intra_threads: env_parse("INTRA_THREADS", defaults.intra_threads),
            max_new_tokens: env_parse("MAX_NEW_TOKENS", defaults.max_new_tokens),
            bucket_mount: PathBuf::from(env_string(
                "BUCKET_MOUNT",
                &defaults.bucket_mount.to_string_lossy(),
            )),
            output_prefix: env_string("OUTPUT_PREFIX", &defaults.output_prefix)
                .trim_matches('/')
                .to_string(),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cors_allowed_origins,
            proxy_auth,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Model settings derived from this config.
    pub fn chatterbox_config(&self) -> anyhow::Result<ChatterboxConfig> {
        Ok(ChatterboxConfig {
            model_dir: self.model_dir.clone(),
            device: Device::from_str(&self.device)?,
            intra_threads: self.intra_threads,
            max_new_tokens: self.max_new_tokens,
            ..ChatterboxConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8085);
        assert_eq!(config.bucket_mount, PathBuf::from("/s3-mount"));
        assert_eq!(config.output_prefix, "tts");
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert!(config.proxy_auth.is_none());
    }

    #[test]
    fn test_chatterbox_config() {
        let config = ServerConfig {
            device: "cpu".to_string(),
            max_new_tokens: 256,
            ..Default::default()
        };
        let model = config.chatterbox_config().unwrap();
        assert_eq!(model.device, Device::Cpu);
        assert_eq!(model.max_new_tokens, 256);
        assert_eq!(model.model_dir, config.model_dir);
    }

    #[test]
    fn test_chatterbox_config_rejects_bad_device() {
        let config = ServerConfig {
            device: "abacus".to_string(),
            ..Default::default()
        };
        assert!(config.chatterbox_config().is_err());
    }
}
