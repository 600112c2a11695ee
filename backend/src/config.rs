//! Pipeline configuration.
//!
//! One plain struct holds every tunable the job services read. Reference
//! values live in the `Default` impl so no service carries inline literals.

use std::time::Duration;

/// Tunables for the creation job pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPipelineConfig {
    /// Hard deadline for one provider generation call.
    pub provider_timeout: Duration,
    /// Margin added to the provider timeout when computing a submission's
    /// `timeout_at`, covering queue latency before the call starts.
    pub timeout_safety_margin: Duration,
    /// Percentage of a paid job's cost credited to the provider owner on
    /// success.
    pub revenue_share_percent: u32,
    /// Maximum completed trial rows retained per prompt.
    pub trial_pool_size: usize,
    /// Age window within which completed trial rows count as pool entries.
    pub trial_pool_ttl: Duration,
    /// Maximum characters of a provider error body preserved in metadata.
    pub provider_error_preview_limit: usize,
    /// Image width assumed when the provider declares none.
    pub default_image_width: u32,
    /// Image height assumed when the provider declares none.
    pub default_image_height: u32,
}

impl Default for JobPipelineConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(50),
            timeout_safety_margin: Duration::from_secs(10),
            revenue_share_percent: 30,
            trial_pool_size: 5,
            trial_pool_ttl: Duration::from_secs(24 * 60 * 60),
            provider_error_preview_limit: 500,
            default_image_width: 1024,
            default_image_height: 1024,
        }
    }
}

impl JobPipelineConfig {
    /// Revenue share owed to a provider owner for a job charged `cost`.
    ///
    /// # Examples
    /// ```
    /// use backend::JobPipelineConfig;
    ///
    /// let config = JobPipelineConfig::default();
    /// assert_eq!(config.revenue_share_for(10), 3);
    /// assert_eq!(config.revenue_share_for(0), 0);
    /// ```
    pub fn revenue_share_for(&self, cost: i64) -> i64 {
        if cost <= 0 {
            return 0;
        }
        cost.saturating_mul(i64::from(self.revenue_share_percent)) / 100
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(10, 3)]
    #[case(3, 0)]
    #[case(100, 30)]
    #[case(0, 0)]
    #[case(-4, 0)]
    fn revenue_share_truncates_toward_zero(#[case] cost: i64, #[case] share: i64) {
        let config = JobPipelineConfig::default();
        assert_eq!(config.revenue_share_for(cost), share);
    }

    #[test]
    fn defaults_match_reference_values() {
        let config = JobPipelineConfig::default();
        assert_eq!(config.provider_timeout, Duration::from_secs(50));
        assert_eq!(config.trial_pool_size, 5);
        assert_eq!(config.trial_pool_ttl, Duration::from_secs(86_400));
    }
}
