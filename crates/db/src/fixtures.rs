use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

const SEED_COMPANY_IDS: &[&str] = &["co-acme"];

const SEED_USER_IDS: &[&str] =
    &["usr-admin", "usr-emp", "usr-mgr-1", "usr-mgr-2", "usr-mgr-3", "usr-fin-dir"];

const SEED_MANAGER_APPROVER_IDS: &[&str] = &["usr-mgr-1", "usr-mgr-2", "usr-mgr-3"];

const SEED_RULE_IDS: &[&str] = &["rule-travel-seq", "rule-large-threshold"];

/// Deterministic demo tenant used by `expensa seed` and local smoke runs.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed.sql");

    /// Idempotent: rows that already exist are left alone.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;
        tracing::info!(
            event_name = "db.seed.loaded",
            companies = SEED_COMPANY_IDS.len(),
            users = SEED_USER_IDS.len(),
            rules = SEED_RULE_IDS.len(),
            "demo seed applied"
        );

        Ok(SeedResult {
            companies: SEED_COMPANY_IDS.len(),
            users: SEED_USER_IDS.len(),
            rules: SEED_RULE_IDS.len(),
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let companies = count_ids(pool, "companies", SEED_COMPANY_IDS).await?;
        checks.push(("companies", companies == SEED_COMPANY_IDS.len() as i64));

        let users = count_ids(pool, "users", SEED_USER_IDS).await?;
        checks.push(("users", users == SEED_USER_IDS.len() as i64));

        let rules = count_ids(pool, "approval_rules", SEED_RULE_IDS).await?;
        checks.push(("approval-rules", rules == SEED_RULE_IDS.len() as i64));

        let managers: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM users WHERE company_id = 'co-acme' AND is_manager_approver = 1
             ORDER BY roster_position ASC",
        )
        .fetch_all(pool)
        .await?;
        checks.push((
            "manager-roster-order",
            string_list_matches(&managers, SEED_MANAGER_APPROVER_IDS),
        ));

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the seeded rows and anything submitted against the demo tenant.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;
        let companies = sql_array_from_ids(SEED_COMPANY_IDS);

        sqlx::query(&format!(
            "DELETE FROM expense_approvers WHERE expense_id IN
                 (SELECT id FROM expenses WHERE company_id IN {companies})"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!("DELETE FROM expenses WHERE company_id IN {companies}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM approval_rules WHERE company_id IN {companies}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM users WHERE company_id IN {companies}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM companies WHERE id IN {companies}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn count_ids(pool: &DbPool, table: &str, ids: &[&str]) -> Result<i64, RepositoryError> {
    let quoted = sql_array_from_ids(ids);
    let count: i64 =
        sqlx::query_scalar(&format!("SELECT COUNT(1) FROM {table} WHERE id IN {quoted}"))
            .fetch_one(pool)
            .await?;
    Ok(count)
}

fn string_list_matches(actual: &[String], expected: &[&str]) -> bool {
    actual.len() == expected.len() && actual.iter().zip(expected).all(|(a, b)| a == b)
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub companies: usize,
    pub users: usize,
    pub rules: usize,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
