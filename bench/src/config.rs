//! Command-line overrides on top of `bench.toml`.

use anyhow::Result;
use harness::io::config::HarnessConfig;

#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub max_parallel: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub trials: Option<u32>,
}

/// Apply command-line overrides to the loaded config, then re-validate.
pub fn apply_overrides(mut base: HarnessConfig, overrides: &RunOverrides) -> Result<HarnessConfig> {
    if let Some(max_parallel) = overrides.max_parallel {
        base.max_parallel = max_parallel;
    }
    if let Some(timeout_secs) = overrides.timeout_secs {
        base.run_timeout_secs = timeout_secs;
    }
    if let Some(trials) = overrides.trials {
        base.trials = trials;
    }
    base.validate()?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_config_values_without_overrides() {
        let base = HarnessConfig {
            max_parallel: 7,
            ..HarnessConfig::default()
        };
        let merged = apply_overrides(base.clone(), &RunOverrides::default()).expect("merge");
        assert_eq!(merged, base);
    }

    #[test]
    fn flags_win_over_config() {
        let overrides = RunOverrides {
            max_parallel: Some(3),
            timeout_secs: Some(60),
            trials: Some(2),
        };
        let merged = apply_overrides(HarnessConfig::default(), &overrides).expect("merge");
        assert_eq!(merged.max_parallel, 3);
        assert_eq!(merged.run_timeout_secs, 60);
        assert_eq!(merged.trials, 2);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let overrides = RunOverrides {
            max_parallel: Some(0),
            ..RunOverrides::default()
        };
        assert!(apply_overrides(HarnessConfig::default(), &overrides).is_err());
    }
}
