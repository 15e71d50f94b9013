use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use expensa_core::domain::rule::{ApprovalRule, RuleId};
use expensa_core::domain::tenant::{CompanyId, UserId};
use expensa_core::workflow::{RuleRepository, StoreError};

use super::{
    decode_json, encode_json, format_timestamp, parse_decimal, parse_timestamp, RepositoryError,
};
use crate::DbPool;

const RULE_COLUMNS: &str = "id, company_id, name, threshold_percent, required_approver_ids,
     is_sequential, min_amount, max_amount, category_filters, is_active, created_at, updated_at";

pub struct SqlRuleRepository {
    pool: DbPool,
}

impl SqlRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_for_company(
        &self,
        company_id: &CompanyId,
        include_inactive: bool,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rules
             WHERE company_id = ? AND (is_active = 1 OR ? = 1)
             ORDER BY id ASC"
        ))
        .bind(&company_id.0)
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn load(&self, rule_id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM approval_rules WHERE id = ?"))
            .bind(&rule_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(rule_from_row).transpose()
    }

    async fn upsert(&self, rule: &ApprovalRule) -> Result<(), RepositoryError> {
        let approvers = encode_json("required_approver_ids", rule.required_approver_ids.as_ref())?;
        let categories = encode_json("category_filters", rule.category_filters.as_ref())?;

        sqlx::query(
            "INSERT INTO approval_rules (id, company_id, name, threshold_percent,
                                         required_approver_ids, is_sequential, min_amount,
                                         max_amount, category_filters, is_active,
                                         created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 threshold_percent = excluded.threshold_percent,
                 required_approver_ids = excluded.required_approver_ids,
                 is_sequential = excluded.is_sequential,
                 min_amount = excluded.min_amount,
                 max_amount = excluded.max_amount,
                 category_filters = excluded.category_filters,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.company_id.0)
        .bind(&rule.name)
        .bind(rule.threshold_percent.map(i64::from))
        .bind(approvers)
        .bind(rule.is_sequential)
        .bind(rule.min_amount.map(|amount| amount.to_string()))
        .bind(rule.max_amount.map(|amount| amount.to_string()))
        .bind(categories)
        .bind(rule.is_active)
        .bind(format_timestamp(&rule.created_at))
        .bind(format_timestamp(&rule.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_inactive(&self, rule_id: &RuleId) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE approval_rules SET is_active = 0, updated_at = ? WHERE id = ?")
                .bind(format_timestamp(&Utc::now()))
                .bind(&rule_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn rule_from_row(row: &SqliteRow) -> Result<ApprovalRule, RepositoryError> {
    let threshold_percent = row
        .try_get::<Option<i64>, _>("threshold_percent")?
        .map(|raw| {
            u8::try_from(raw).map_err(|_| {
                RepositoryError::Decode(format!("threshold_percent out of range: {raw}"))
            })
        })
        .transpose()?;
    let min_amount = row
        .try_get::<Option<String>, _>("min_amount")?
        .map(|raw| parse_decimal("min_amount", &raw))
        .transpose()?;
    let max_amount = row
        .try_get::<Option<String>, _>("max_amount")?
        .map(|raw| parse_decimal("max_amount", &raw))
        .transpose()?;

    Ok(ApprovalRule {
        id: RuleId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        name: row.try_get("name")?,
        threshold_percent,
        required_approver_ids: decode_json::<Vec<UserId>>(
            "required_approver_ids",
            row.try_get("required_approver_ids")?,
        )?,
        is_sequential: row.try_get("is_sequential")?,
        min_amount,
        max_amount,
        category_filters: decode_json("category_filters", row.try_get("category_filters")?)?,
        is_active: row.try_get("is_active")?,
        created_at: parse_timestamp("created_at", &row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp("updated_at", &row.try_get::<String, _>("updated_at")?)?,
    })
}

#[async_trait]
impl RuleRepository for SqlRuleRepository {
    async fn list_active_rules(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, StoreError> {
        Ok(self.load_for_company(company_id, false).await?)
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
        include_inactive: bool,
    ) -> Result<Vec<ApprovalRule>, StoreError> {
        Ok(self.load_for_company(company_id, include_inactive).await?)
    }

    async fn find_by_id(&self, rule_id: &RuleId) -> Result<Option<ApprovalRule>, StoreError> {
        Ok(self.load(rule_id).await?)
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), StoreError> {
        Ok(self.upsert(&rule).await?)
    }

    async fn deactivate(&self, rule_id: &RuleId) -> Result<bool, StoreError> {
        Ok(self.mark_inactive(rule_id).await?)
    }
}
