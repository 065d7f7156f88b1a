use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the daemon
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Where descriptors, templates and rendered output live
    #[serde(default)]
    pub paths: PathsConfig,

    /// How the proxy process is invoked
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Reconciliation cadence
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Directory of backend descriptor files (default: /config)
    #[serde(default = "default_descriptor_dir")]
    pub descriptor_dir: PathBuf,

    /// Proxy configuration directory that receives the include file
    #[serde(default = "default_proxy_config_dir")]
    pub proxy_config_dir: PathBuf,

    /// Directory rendered fragments are written to
    #[serde(default = "default_render_dir")]
    pub render_dir: PathBuf,

    /// Template search path, first match wins
    #[serde(default = "default_template_dirs")]
    pub template_dirs: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            descriptor_dir: default_descriptor_dir(),
            proxy_config_dir: default_proxy_config_dir(),
            render_dir: default_render_dir(),
            template_dirs: default_template_dirs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Proxy executable (default: nginx, resolved through PATH)
    #[serde(default = "default_proxy_binary")]
    pub binary: String,

    /// Main configuration file passed with `-c`
    #[serde(default = "default_main_config")]
    pub main_config: PathBuf,

    /// Name of the include file written into `proxy_config_dir`
    #[serde(default = "default_include_file")]
    pub include_file: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: default_proxy_binary(),
            main_config: default_main_config(),
            include_file: default_include_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Sleep between loop iterations in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// How often every entry is checked for changes, in milliseconds
    #[serde(default = "default_detect_interval_ms")]
    pub detect_interval_ms: u64,

    /// How often the proxy process is polled, in milliseconds
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Upper bound on a single DNS lookup, in milliseconds
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            detect_interval_ms: default_detect_interval_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
        }
    }
}

impl TimingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Number of ticks between detection passes (at least 1)
    pub fn detect_every(&self) -> u64 {
        ticks_per(self.detect_interval_ms, self.tick_ms)
    }

    /// Number of ticks between liveness polls (at least 1)
    pub fn poll_every(&self) -> u64 {
        ticks_per(self.liveness_interval_ms, self.tick_ms)
    }
}

fn ticks_per(interval_ms: u64, tick_ms: u64) -> u64 {
    if tick_ms == 0 {
        return 1;
    }
    (interval_ms / tick_ms).max(1)
}

fn default_descriptor_dir() -> PathBuf {
    PathBuf::from("/config")
}

fn default_proxy_config_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/http.d")
}

fn default_render_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/vhosts.d")
}

fn default_template_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/templates"), PathBuf::from("/ingress/templates")]
}

fn default_proxy_binary() -> String {
    "nginx".to_string()
}

fn default_main_config() -> PathBuf {
    PathBuf::from("/etc/nginx/nginx.conf")
}

fn default_include_file() -> String {
    "ingress-include.conf".to_string()
}

fn default_tick_ms() -> u64 {
    100
}

fn default_detect_interval_ms() -> u64 {
    10_000
}

fn default_liveness_interval_ms() -> u64 {
    1_000
}

fn default_resolve_timeout_ms() -> u64 {
    3_000
}

/// Path overrides taken from the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub descriptor_dir: Option<PathBuf>,
    pub proxy_config_dir: Option<PathBuf>,
    pub render_dir: Option<PathBuf>,
    pub template_dirs: Vec<PathBuf>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command line overrides on top of file or default values
    pub fn with_overrides(mut self, overrides: PathOverrides) -> Self {
        if let Some(dir) = overrides.descriptor_dir {
            self.paths.descriptor_dir = dir;
        }
        if let Some(dir) = overrides.proxy_config_dir {
            self.paths.proxy_config_dir = dir;
        }
        if let Some(dir) = overrides.render_dir {
            self.paths.render_dir = dir;
        }
        if !overrides.template_dirs.is_empty() {
            self.paths.template_dirs = overrides.template_dirs;
        }
        self
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let timing = &self.timing;

        if timing.tick_ms == 0 {
            errors.push("timing.tick_ms must be greater than 0".to_string());
        }
        if timing.resolve_timeout_ms == 0 {
            errors.push("timing.resolve_timeout_ms must be greater than 0".to_string());
        }
        if timing.detect_interval_ms < timing.tick_ms {
            errors.push(format!(
                "timing.detect_interval_ms ({}) must not be shorter than timing.tick_ms ({})",
                timing.detect_interval_ms, timing.tick_ms
            ));
        }
        if timing.liveness_interval_ms < timing.tick_ms {
            errors.push(format!(
                "timing.liveness_interval_ms ({}) must not be shorter than timing.tick_ms ({})",
                timing.liveness_interval_ms, timing.tick_ms
            ));
        }
        if self.paths.template_dirs.is_empty() {
            errors.push("paths.template_dirs must list at least one directory".to_string());
        }
        if self.proxy.binary.is_empty() {
            errors.push("proxy.binary must not be empty".to_string());
        }
        if self.proxy.include_file.is_empty() {
            errors.push("proxy.include_file must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[paths]
descriptor_dir = "/srv/ingress/backends"
render_dir = "/srv/ingress/vhosts"
template_dirs = ["/srv/ingress/templates"]

[proxy]
binary = "/usr/sbin/nginx"

[timing]
tick_ms = 50
detect_interval_ms = 5000
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.paths.descriptor_dir, PathBuf::from("/srv/ingress/backends"));
        assert_eq!(config.paths.render_dir, PathBuf::from("/srv/ingress/vhosts"));
        assert_eq!(config.paths.proxy_config_dir, PathBuf::from("/etc/nginx/http.d"));
        assert_eq!(config.paths.template_dirs.len(), 1);
        assert_eq!(config.proxy.binary, "/usr/sbin/nginx");
        assert_eq!(config.proxy.main_config, PathBuf::from("/etc/nginx/nginx.conf"));
        assert_eq!(config.timing.tick_ms, 50);
        assert_eq!(config.timing.detect_every(), 100);
        assert_eq!(config.timing.poll_every(), 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.paths.descriptor_dir, PathBuf::from("/config"));
        assert_eq!(config.paths.render_dir, PathBuf::from("/etc/nginx/vhosts.d"));
        assert_eq!(
            config.paths.template_dirs,
            vec![PathBuf::from("/templates"), PathBuf::from("/ingress/templates")]
        );
        assert_eq!(config.proxy.include_file, "ingress-include.conf");
    }

    #[test]
    fn test_default_timing() {
        let timing = TimingConfig::default();
        assert_eq!(timing.tick(), Duration::from_millis(100));
        assert_eq!(timing.resolve_timeout(), Duration::from_secs(3));
        assert_eq!(timing.detect_every(), 100);
        assert_eq!(timing.poll_every(), 10);
    }

    #[test]
    fn test_ticks_per_never_zero() {
        let timing = TimingConfig {
            tick_ms: 100,
            detect_interval_ms: 30,
            liveness_interval_ms: 0,
            resolve_timeout_ms: 1000,
        };
        assert_eq!(timing.detect_every(), 1);
        assert_eq!(timing.poll_every(), 1);
    }

    #[test]
    fn test_overrides() {
        let config = Config::default().with_overrides(PathOverrides {
            descriptor_dir: Some(PathBuf::from("/tmp/descriptors")),
            proxy_config_dir: None,
            render_dir: Some(PathBuf::from("/tmp/vhosts")),
            template_dirs: vec![PathBuf::from("/tmp/templates")],
        });

        assert_eq!(config.paths.descriptor_dir, PathBuf::from("/tmp/descriptors"));
        assert_eq!(config.paths.proxy_config_dir, PathBuf::from("/etc/nginx/http.d"));
        assert_eq!(config.paths.render_dir, PathBuf::from("/tmp/vhosts"));
        assert_eq!(config.paths.template_dirs, vec![PathBuf::from("/tmp/templates")]);
    }

    #[test]
    fn test_overrides_keep_template_dirs_when_empty() {
        let config = Config::default().with_overrides(PathOverrides::default());
        assert_eq!(config.paths.template_dirs, default_template_dirs());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.timing.tick_ms = 0;
        config.timing.resolve_timeout_ms = 0;
        config.paths.template_dirs.clear();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("tick_ms must be greater than 0"));
        assert!(err.contains("resolve_timeout_ms must be greater than 0"));
        assert!(err.contains("template_dirs"));
    }

    #[test]
    fn test_validate_interval_shorter_than_tick() {
        let mut config = Config::default();
        config.timing.tick_ms = 500;
        config.timing.liveness_interval_ms = 100;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("liveness_interval_ms"));
        assert!(!err.contains("detect_interval_ms"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingressd.toml");
        std::fs::write(&path, "[timing]\ntick_ms = 0\n").unwrap();

        assert!(Config::load(&path).is_err());

        std::fs::write(&path, "[proxy]\nmain_config = \"/opt/nginx/nginx.conf\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.main_config, PathBuf::from("/opt/nginx/nginx.conf"));
    }
}
