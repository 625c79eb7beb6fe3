//! Default plan configuration and seeding

use crate::{PlanConfiguration, PlanTier, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

pub const FEATURE_SINGLE_SEARCH: &str = "single_search";
pub const FEATURE_BATCH_SEARCH: &str = "batch_search";

/// Built-in plan table used to seed an empty directory
pub fn default_plans(now: DateTime<Utc>) -> Vec<PlanConfiguration> {
    let plan = |tier, monthly_quota, rate_limit_per_minute, price_cents, features: &[&str]| {
        PlanConfiguration {
            tier,
            monthly_quota,
            rate_limit_per_minute,
            features: features.iter().map(|f| f.to_string()).collect(),
            price_cents,
            version: 1,
            updated_at: now,
        }
    };

    vec![
        plan(
            PlanTier::Free,
            1_000,
            10,
            0,
            &[FEATURE_SINGLE_SEARCH, "basic_support"],
        ),
        plan(
            PlanTier::Starter,
            10_000,
            60,
            2_900,
            &[FEATURE_SINGLE_SEARCH, FEATURE_BATCH_SEARCH, "email_support"],
        ),
        plan(
            PlanTier::Professional,
            100_000,
            300,
            9_900,
            &[
                FEATURE_SINGLE_SEARCH,
                FEATURE_BATCH_SEARCH,
                "priority_support",
                "analytics",
            ],
        ),
        plan(
            PlanTier::Enterprise,
            1_000_000,
            1_000,
            49_900,
            &[
                FEATURE_SINGLE_SEARCH,
                FEATURE_BATCH_SEARCH,
                "sso",
                "dedicated_support",
                "analytics",
                "sla",
            ],
        ),
    ]
}

/// Insert the default plans for any tier that has no row yet.
///
/// Existing rows are left untouched so operator edits survive restarts.
/// Returns the number of rows inserted.
pub fn seed_default_plans(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let mut inserted = 0;
    for plan in default_plans(now) {
        inserted += conn.execute(
            "INSERT OR IGNORE INTO plan_configurations
               (tier, monthly_quota, rate_limit_per_minute, features, price_cents, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                plan.tier.as_str(),
                plan.monthly_quota as i64,
                plan.rate_limit_per_minute,
                serde_json::to_string(&plan.features)?,
                plan.price_cents,
                plan.version,
                plan.updated_at,
            ],
        )?;
    }

    if inserted > 0 {
        tracing::info!(inserted, "Seeded default plan configuration");
    }
    Ok(inserted)
}
