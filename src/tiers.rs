use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Subscription tier governing page quota and scan cadence.
#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone, PartialOrd, Ord)]
pub enum Tier {
    #[strum(serialize = "free")]
    Free,
    #[strum(serialize = "starter")]
    Starter,
    #[strum(serialize = "pro")]
    Pro,
}

#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone)]
pub enum SubscriptionStatus {
    #[strum(serialize = "active")]
    Active,
    #[strum(serialize = "trialing")]
    Trialing,
    #[strum(serialize = "past_due")]
    PastDue,
    #[strum(serialize = "canceled")]
    Canceled,
}

/// How often a page is scanned. Ordering reflects cadence: a tier that
/// allows Daily also satisfies a page configured Weekly.
#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone, PartialOrd, Ord)]
pub enum ScanFrequency {
    #[strum(serialize = "manual")]
    Manual,
    #[strum(serialize = "weekly")]
    Weekly,
    #[strum(serialize = "daily")]
    Daily,
}

/// Tier promised for the duration of a trial.
const TRIAL_TIER: Tier = Tier::Pro;

/// Resolve the tier an account actually gets, independent of what is stored.
///
/// A past-due or canceled subscription degrades to Free, unless the account
/// is still inside an active trial window, in which case the trial's
/// promised tier wins. Pure function: `now` is passed in so callers and
/// tests control the clock.
pub fn effective_tier(
    raw_tier: Tier,
    status: SubscriptionStatus,
    trial_ends_at: Option<i64>,
    now: i64,
) -> Tier {
    let in_trial = trial_ends_at.is_some_and(|ends| ends > now);
    if in_trial {
        return TRIAL_TIER;
    }
    match status {
        SubscriptionStatus::PastDue | SubscriptionStatus::Canceled => Tier::Free,
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => raw_tier,
    }
}

/// Maximum number of monitored pages for a tier.
pub fn page_limit(tier: Tier) -> usize {
    match tier {
        Tier::Free => 1,
        Tier::Starter => 5,
        Tier::Pro => 25,
    }
}

/// Fastest scan cadence a tier is allowed.
pub fn allowed_scan_frequency(tier: Tier) -> ScanFrequency {
    match tier {
        Tier::Free => ScanFrequency::Weekly,
        Tier::Starter => ScanFrequency::Daily,
        Tier::Pro => ScanFrequency::Daily,
    }
}

/// The cadence a page actually runs at: its configured frequency, capped
/// by what the owner's tier allows.
pub fn effective_frequency(page_frequency: ScanFrequency, tier: Tier) -> ScanFrequency {
    page_frequency.min(allowed_scan_frequency(tier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_effective_tier_active_keeps_raw() {
        assert_eq!(
            effective_tier(Tier::Pro, SubscriptionStatus::Active, None, NOW),
            Tier::Pro
        );
        assert_eq!(
            effective_tier(Tier::Starter, SubscriptionStatus::Active, None, NOW),
            Tier::Starter
        );
    }

    #[test]
    fn test_effective_tier_degrades_on_bad_standing() {
        assert_eq!(
            effective_tier(Tier::Pro, SubscriptionStatus::PastDue, None, NOW),
            Tier::Free
        );
        assert_eq!(
            effective_tier(Tier::Starter, SubscriptionStatus::Canceled, None, NOW),
            Tier::Free
        );
    }

    #[test]
    fn test_active_trial_forces_promised_tier() {
        // Trial window overrides even a canceled subscription
        assert_eq!(
            effective_tier(
                Tier::Free,
                SubscriptionStatus::Canceled,
                Some(NOW + 86_400),
                NOW
            ),
            Tier::Pro
        );
        assert_eq!(
            effective_tier(
                Tier::Free,
                SubscriptionStatus::Trialing,
                Some(NOW + 1),
                NOW
            ),
            Tier::Pro
        );
    }

    #[test]
    fn test_expired_trial_has_no_effect() {
        assert_eq!(
            effective_tier(
                Tier::Free,
                SubscriptionStatus::Canceled,
                Some(NOW - 1),
                NOW
            ),
            Tier::Free
        );
        // Trial ending exactly now is expired
        assert_eq!(
            effective_tier(Tier::Free, SubscriptionStatus::Active, Some(NOW), NOW),
            Tier::Free
        );
    }

    #[test]
    fn test_page_limits() {
        assert_eq!(page_limit(Tier::Free), 1);
        assert_eq!(page_limit(Tier::Starter), 5);
        assert_eq!(page_limit(Tier::Pro), 25);
    }

    #[test]
    fn test_allowed_scan_frequency() {
        assert_eq!(allowed_scan_frequency(Tier::Free), ScanFrequency::Weekly);
        assert_eq!(allowed_scan_frequency(Tier::Starter), ScanFrequency::Daily);
        assert_eq!(allowed_scan_frequency(Tier::Pro), ScanFrequency::Daily);
    }

    #[test]
    fn test_effective_frequency_caps_at_tier() {
        // Free tier downgrades a daily page to weekly
        assert_eq!(
            effective_frequency(ScanFrequency::Daily, Tier::Free),
            ScanFrequency::Weekly
        );
        // Tier never upgrades an explicit page-level choice
        assert_eq!(
            effective_frequency(ScanFrequency::Weekly, Tier::Pro),
            ScanFrequency::Weekly
        );
        assert_eq!(
            effective_frequency(ScanFrequency::Manual, Tier::Pro),
            ScanFrequency::Manual
        );
        assert_eq!(
            effective_frequency(ScanFrequency::Daily, Tier::Pro),
            ScanFrequency::Daily
        );
    }

    #[test]
    fn test_tier_string_round_trip() {
        assert_eq!("pro".parse::<Tier>().unwrap(), Tier::Pro);
        assert_eq!(Tier::Free.to_string(), "free");
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
        assert!("platinum".parse::<Tier>().is_err());
    }
}
