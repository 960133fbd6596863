use std::path::PathBuf;
use std::time::Duration;

/// Common numerical/data packages installed once into the baseline image.
///
/// A compile-time constant rather than something read from a config file:
/// the service carries no persisted, cross-restart configuration (see the
/// "no configuration file" rule in the external-interfaces design).
pub const BASELINE_PACKAGES: &[&str] = &["numpy", "pandas", "matplotlib", "scipy", "seaborn"];

/// Logical configuration driving the kernel's behaviour.
///
/// Every field has an environment-variable-driven default in
/// [`KernelConfig::from_env`]; there is no config file.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Process-wide temporary root under which the baseline image and every
    /// sandbox's `work_dir`/`env_dir` are created.
    pub tmp_root: PathBuf,
    /// How long a single `recv` on the publish channel may block before the
    /// pump gives up and returns whatever has been collected so far.
    pub execute_message_timeout: Duration,
    /// Upper bound on a single `install` call.
    pub install_timeout: Duration,
    /// How long an idle sandbox survives before the reaper closes it.
    pub idle_budget: Duration,
    /// Interval between periodic sweeps of the registry.
    pub sweep_period: Duration,
}

impl KernelConfig {
    pub fn baseline_dir(&self) -> PathBuf {
        self.tmp_root.join("repl-daemon-baseline")
    }

    pub fn from_env() -> Self {
        Self {
            tmp_root: env_path("REPL_TMP_ROOT", std::env::temp_dir()),
            execute_message_timeout: env_duration_secs("REPL_EXECUTE_MESSAGE_TIMEOUT_SECS", 3600),
            install_timeout: env_duration_secs("REPL_INSTALL_TIMEOUT_SECS", 120),
            idle_budget: env_duration_secs("REPL_IDLE_BUDGET_SECS", 24 * 60 * 60),
            sweep_period: env_duration_secs("REPL_SWEEP_PERIOD_SECS", 3600),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tmp_root: std::env::temp_dir(),
            execute_message_timeout: Duration::from_secs(3600),
            install_timeout: Duration::from_secs(120),
            idle_budget: Duration::from_secs(24 * 60 * 60),
            sweep_period: Duration::from_secs(3600),
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_budgets() {
        let config = KernelConfig::default();
        assert_eq!(config.execute_message_timeout, Duration::from_secs(3600));
        assert_eq!(config.install_timeout, Duration::from_secs(120));
        assert_eq!(config.idle_budget, Duration::from_secs(86400));
        assert_eq!(config.sweep_period, Duration::from_secs(3600));
    }

    #[test]
    fn baseline_dir_is_under_tmp_root() {
        let config = KernelConfig {
            tmp_root: PathBuf::from("/tmp/example"),
            ..KernelConfig::default()
        };
        assert_eq!(
            config.baseline_dir(),
            PathBuf::from("/tmp/example/repl-daemon-baseline")
        );
    }
}
