use std::collections::HashMap;

use log::warn;
use rusqlite::Connection;

use crate::error::WebPulseError;
use crate::tiers::{self, SubscriptionStatus, Tier};

/// Billing/identity snapshot for one owner, as supplied by the external
/// billing system. Read-only from the core's perspective.
#[derive(Debug, Clone)]
pub struct BillingProfile {
    pub tier: Tier,
    pub subscription_status: SubscriptionStatus,
    pub trial_ends_at: Option<i64>,
}

impl BillingProfile {
    pub fn effective_tier(&self, now: i64) -> Tier {
        tiers::effective_tier(self.tier, self.subscription_status, self.trial_ends_at, now)
    }
}

/// Resolves owners to their effective tier. Injected into the scheduler and
/// backup runner so tests can substitute a fixed mapping.
pub trait TierResolver {
    /// Resolve effective tiers for a set of owners. Owners without billing
    /// records resolve to Free.
    fn resolve(&self, conn: &Connection, owner_ids: &[i64], now: i64)
        -> Result<HashMap<i64, Tier>, WebPulseError>;
}

/// Resolver backed by the owner_billing snapshot table. Lookups are chunked
/// to bound the size of any single IN clause.
pub struct StoredTierResolver;

const LOOKUP_CHUNK_SIZE: usize = 100;

impl TierResolver for StoredTierResolver {
    fn resolve(
        &self,
        conn: &Connection,
        owner_ids: &[i64],
        now: i64,
    ) -> Result<HashMap<i64, Tier>, WebPulseError> {
        let mut tiers_by_owner: HashMap<i64, Tier> = HashMap::with_capacity(owner_ids.len());

        // Missing billing rows fall through as Free
        for id in owner_ids {
            tiers_by_owner.insert(*id, Tier::Free);
        }

        for chunk in owner_ids.chunks(LOOKUP_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT owner_id, tier, subscription_status, trial_ends_at
                 FROM owner_billing WHERE owner_id IN ({})",
                placeholders
            );

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(chunk.iter()))?;

            while let Some(row) = rows.next()? {
                let owner_id: i64 = row.get(0)?;
                let tier_str: String = row.get(1)?;
                let status_str: String = row.get(2)?;
                let trial_ends_at: Option<i64> = row.get(3)?;

                let tier = match tier_str.parse::<Tier>() {
                    Ok(t) => t,
                    Err(_) => {
                        warn!("Owner {} has unknown tier '{}', treating as free", owner_id, tier_str);
                        Tier::Free
                    }
                };
                let status = match status_str.parse::<SubscriptionStatus>() {
                    Ok(s) => s,
                    Err(_) => {
                        warn!(
                            "Owner {} has unknown subscription status '{}', treating as canceled",
                            owner_id, status_str
                        );
                        SubscriptionStatus::Canceled
                    }
                };

                let profile = BillingProfile {
                    tier,
                    subscription_status: status,
                    trial_ends_at,
                };
                tiers_by_owner.insert(owner_id, profile.effective_tier(now));
            }
        }

        Ok(tiers_by_owner)
    }
}
