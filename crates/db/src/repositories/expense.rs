use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use expensa_core::domain::expense::{
    ApprovalMode, ApproverAssignment, Expense, ExpenseId, ExpenseStatus,
};
use expensa_core::domain::rule::RuleId;
use expensa_core::domain::tenant::{CompanyId, UserId};
use expensa_core::workflow::{is_awaiting, ExpenseStore, StoreError};

use super::{format_timestamp, parse_date, parse_decimal, parse_timestamp, RepositoryError};
use crate::DbPool;

const EXPENSE_COLUMNS: &str = "e.id, e.company_id, e.submitted_by, e.amount, e.currency,
     e.converted_amount, e.category, e.description, e.expense_date, e.receipt_url, e.status,
     e.approval_mode, e.threshold_percent, e.matched_rule_id, e.version, e.created_at,
     e.updated_at";

/// Expenses with their approver chains. Chain rows are written with the expense and only
/// their decision columns change afterwards.
pub struct SqlExpenseStore {
    pool: DbPool,
}

impl SqlExpenseStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_expense(&self, expense: &Expense) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO expenses (id, company_id, submitted_by, amount, currency,
                                   converted_amount, category, description, expense_date,
                                   receipt_url, status, approval_mode, threshold_percent,
                                   matched_rule_id, version, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&expense.id.0)
        .bind(&expense.company_id.0)
        .bind(&expense.submitted_by.0)
        .bind(expense.amount.to_string())
        .bind(&expense.currency)
        .bind(expense.converted_amount.to_string())
        .bind(&expense.category)
        .bind(&expense.description)
        .bind(expense.expense_date.format("%Y-%m-%d").to_string())
        .bind(&expense.receipt_url)
        .bind(expense.status.as_str())
        .bind(expense.approval_mode.as_str())
        .bind(expense.approval_mode.threshold_percent().map(i64::from))
        .bind(expense.matched_rule_id.as_ref().map(|rule_id| rule_id.0.as_str()))
        .bind(i64::from(expense.version))
        .bind(format_timestamp(&expense.created_at))
        .bind(format_timestamp(&expense.updated_at))
        .execute(&mut *tx)
        .await?;

        for assignment in &expense.approvers {
            sqlx::query(
                "INSERT INTO expense_approvers (expense_id, user_id, sequence_order, approved,
                                                comments, decided_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&expense.id.0)
            .bind(&assignment.user_id.0)
            .bind(i64::from(assignment.order))
            .bind(assignment.approved)
            .bind(&assignment.comments)
            .bind(assignment.decided_at.map(|at| format_timestamp(&at)))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Reads the expense row and its chain inside one transaction so both come from the
    /// same snapshot.
    async fn load(&self, expense_id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!("SELECT {EXPENSE_COLUMNS} FROM expenses e WHERE e.id = ?"))
            .bind(&expense_id.0)
            .fetch_optional(&mut *tx)
            .await?;

        let expense = match row {
            Some(ref row) => Some(hydrate(&mut tx, row).await?),
            None => None,
        };
        tx.commit().await?;
        Ok(expense)
    }

    /// `Ok(false)` means the stored version moved on.
    async fn write_decision(
        &self,
        expense: &Expense,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE expenses SET status = ?, version = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(expense.status.as_str())
        .bind(i64::from(expense.version))
        .bind(format_timestamp(&expense.updated_at))
        .bind(&expense.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            ensure_exists(&mut tx, &expense.id).await?;
            tracing::debug!(
                event_name = "db.expense.version_conflict",
                expense_id = %expense.id,
                expected_version,
                "stale expense version; decision not written"
            );
            return Ok(false);
        }

        for assignment in &expense.approvers {
            sqlx::query(
                "UPDATE expense_approvers SET approved = ?, comments = ?, decided_at = ?
                 WHERE expense_id = ? AND user_id = ?",
            )
            .bind(assignment.approved)
            .bind(&assignment.comments)
            .bind(assignment.decided_at.map(|at| format_timestamp(&at)))
            .bind(&expense.id.0)
            .bind(&assignment.user_id.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn load_open_assignments(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses e
             JOIN expense_approvers a ON a.expense_id = e.id
             WHERE a.user_id = ? AND a.approved IS NULL AND e.status = 'pending'
             ORDER BY e.created_at ASC, e.id ASC"
        ))
        .bind(&approver_id.0)
        .fetch_all(&mut *tx)
        .await?;

        let expenses = hydrate_all(&mut tx, &rows).await?;
        tx.commit().await?;
        Ok(expenses)
    }

    async fn load_submitted(&self, user_id: &UserId) -> Result<Vec<Expense>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses e
             WHERE e.submitted_by = ?
             ORDER BY e.created_at DESC, e.id DESC"
        ))
        .bind(&user_id.0)
        .fetch_all(&mut *tx)
        .await?;

        let expenses = hydrate_all(&mut tx, &rows).await?;
        tx.commit().await?;
        Ok(expenses)
    }
}

async fn hydrate(
    tx: &mut Transaction<'_, Sqlite>,
    row: &SqliteRow,
) -> Result<Expense, RepositoryError> {
    let mut expense = expense_from_row(row)?;
    let rows = sqlx::query(
        "SELECT user_id, sequence_order, approved, comments, decided_at
         FROM expense_approvers WHERE expense_id = ?
         ORDER BY sequence_order ASC",
    )
    .bind(&expense.id.0)
    .fetch_all(&mut **tx)
    .await?;
    expense.approvers = rows.iter().map(assignment_from_row).collect::<Result<_, _>>()?;
    Ok(expense)
}

async fn hydrate_all(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[SqliteRow],
) -> Result<Vec<Expense>, RepositoryError> {
    let mut expenses = Vec::with_capacity(rows.len());
    for row in rows {
        expenses.push(hydrate(tx, row).await?);
    }
    Ok(expenses)
}

async fn ensure_exists(
    tx: &mut Transaction<'_, Sqlite>,
    expense_id: &ExpenseId,
) -> Result<(), RepositoryError> {
    let exists: i64 = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM expenses WHERE id = ?)")
        .bind(&expense_id.0)
        .fetch_one(&mut **tx)
        .await?;
    if exists == 1 {
        Ok(())
    } else {
        Err(RepositoryError::Decode(format!("expense `{expense_id}` vanished")))
    }
}

fn expense_from_row(row: &SqliteRow) -> Result<Expense, RepositoryError> {
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("approval_mode")?;
    let threshold_percent = row
        .try_get::<Option<i64>, _>("threshold_percent")?
        .map(|raw| {
            u8::try_from(raw).map_err(|_| {
                RepositoryError::Decode(format!("threshold_percent out of range: {raw}"))
            })
        })
        .transpose()?;
    let version: i64 = row.try_get("version")?;

    Ok(Expense {
        id: ExpenseId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        submitted_by: UserId(row.try_get("submitted_by")?),
        amount: parse_decimal("amount", &row.try_get::<String, _>("amount")?)?,
        currency: row.try_get("currency")?,
        converted_amount: parse_decimal(
            "converted_amount",
            &row.try_get::<String, _>("converted_amount")?,
        )?,
        category: row.try_get("category")?,
        description: row.try_get("description")?,
        expense_date: parse_date("expense_date", &row.try_get::<String, _>("expense_date")?)?,
        receipt_url: row.try_get("receipt_url")?,
        status: ExpenseStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown expense status `{status}`")))?,
        approvers: Vec::new(),
        approval_mode: ApprovalMode::from_parts(&mode, threshold_percent).ok_or_else(|| {
            RepositoryError::Decode(format!("invalid approval mode `{mode}`"))
        })?,
        matched_rule_id: row.try_get::<Option<String>, _>("matched_rule_id")?.map(RuleId),
        version: u32::try_from(version)
            .map_err(|_| RepositoryError::Decode(format!("version out of range: {version}")))?,
        created_at: parse_timestamp("created_at", &row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp("updated_at", &row.try_get::<String, _>("updated_at")?)?,
    })
}

fn assignment_from_row(row: &SqliteRow) -> Result<ApproverAssignment, RepositoryError> {
    let order: i64 = row.try_get("sequence_order")?;
    Ok(ApproverAssignment {
        user_id: UserId(row.try_get("user_id")?),
        order: u32::try_from(order)
            .map_err(|_| RepositoryError::Decode(format!("sequence_order out of range: {order}")))?,
        approved: row.try_get("approved")?,
        comments: row.try_get("comments")?,
        decided_at: row
            .try_get::<Option<String>, _>("decided_at")?
            .map(|raw| parse_timestamp("decided_at", &raw))
            .transpose()?,
    })
}

#[async_trait]
impl ExpenseStore for SqlExpenseStore {
    async fn insert(&self, expense: &Expense) -> Result<(), StoreError> {
        self.insert_expense(expense).await.map_err(|error| match StoreError::from(error) {
            StoreError::Duplicate(_) => StoreError::Duplicate(expense.id.0.clone()),
            other => other,
        })
    }

    async fn find_by_id(&self, expense_id: &ExpenseId) -> Result<Option<Expense>, StoreError> {
        Ok(self.load(expense_id).await?)
    }

    async fn save_decision(
        &self,
        expense: &Expense,
        expected_version: u32,
    ) -> Result<(), StoreError> {
        if self.write_decision(expense, expected_version).await? {
            Ok(())
        } else {
            Err(StoreError::VersionConflict {
                expense_id: expense.id.clone(),
                expected: expected_version,
            })
        }
    }

    async fn list_pending_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Expense>, StoreError> {
        let candidates = self.load_open_assignments(approver_id).await?;
        Ok(candidates.into_iter().filter(|expense| is_awaiting(expense, approver_id)).collect())
    }

    async fn list_by_submitter(&self, user_id: &UserId) -> Result<Vec<Expense>, StoreError> {
        Ok(self.load_submitted(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal::Decimal;

    use expensa_core::domain::expense::{
        ApprovalMode, ApproverAssignment, Expense, ExpenseId, ExpenseStatus,
    };
    use expensa_core::domain::tenant::{CompanyId, UserId};
    use expensa_core::workflow::{ExpenseStore, StoreError};

    use super::SqlExpenseStore;
    use crate::repositories::test_support::{seed_tenant, setup};

    fn sample_expense(id: &str, mode: ApprovalMode, approvers: &[&str]) -> Expense {
        let now = Utc::now();
        Expense {
            id: ExpenseId(id.to_string()),
            company_id: CompanyId("acme".to_string()),
            submitted_by: UserId("u-emp".to_string()),
            amount: Decimal::new(88000, 2),
            currency: "EUR".to_string(),
            converted_amount: Decimal::new(110000, 2),
            category: "travel".to_string(),
            description: "client visit".to_string(),
            expense_date: NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date"),
            receipt_url: None,
            status: ExpenseStatus::Pending,
            approvers: approvers
                .iter()
                .enumerate()
                .map(|(index, user)| {
                    ApproverAssignment::undecided(UserId(user.to_string()), index as u32 + 1)
                })
                .collect(),
            approval_mode: mode,
            matched_rule_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_find_round_trips_chain_and_mode() {
        let pool = setup().await;
        seed_tenant(&pool).await;
        let store = SqlExpenseStore::new(pool);

        let expense =
            sample_expense("EXP-1", ApprovalMode::Threshold { percent: 50 }, &["m1", "m2"]);
        store.insert(&expense).await.expect("insert");

        let found = store.find_by_id(&expense.id).await.expect("find").expect("exists");
        assert_eq!(found.approval_mode, ApprovalMode::Threshold { percent: 50 });
        assert_eq!(found.converted_amount, Decimal::new(110000, 2));
        assert_eq!(found.approvers.len(), 2);
        assert_eq!(found.approvers[0].user_id.0, "m1");
        assert_eq!(found.approvers[1].order, 2);
        assert_eq!(found.approvers[0].approved, None);
        assert_eq!(found.expense_date, expense.expense_date);
    }

    #[tokio::test]
    async fn duplicate_insert_is_reported_with_expense_id() {
        let pool = setup().await;
        seed_tenant(&pool).await;
        let store = SqlExpenseStore::new(pool);

        let expense = sample_expense("EXP-1", ApprovalMode::Parallel, &["m1"]);
        store.insert(&expense).await.expect("insert");
        let error = store.insert(&expense).await.expect_err("duplicate");
        assert_eq!(error, StoreError::Duplicate("EXP-1".to_string()));
    }

    #[tokio::test]
    async fn stale_version_is_refused_and_leaves_row_untouched() {
        let pool = setup().await;
        seed_tenant(&pool).await;
        let store = SqlExpenseStore::new(pool);

        let expense = sample_expense("EXP-1", ApprovalMode::Parallel, &["m1", "m2"]);
        store.insert(&expense).await.expect("insert");

        let mut first = expense.clone();
        first.approvers[0].approved = Some(true);
        first.approvers[0].decided_at = Some(Utc::now());
        first.version = 2;
        store.save_decision(&first, 1).await.expect("first decision");

        let mut stale = expense.clone();
        stale.approvers[1].approved = Some(false);
        stale.status = ExpenseStatus::Rejected;
        stale.version = 2;
        let error = store.save_decision(&stale, 1).await.expect_err("stale write");
        assert!(matches!(error, StoreError::VersionConflict { expected: 1, .. }));

        let stored = store.find_by_id(&expense.id).await.expect("find").expect("exists");
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, ExpenseStatus::Pending);
        assert_eq!(stored.approvers[0].approved, Some(true));
        assert_eq!(stored.approvers[1].approved, None);
    }

    #[tokio::test]
    async fn inbox_respects_sequential_turns() {
        let pool = setup().await;
        seed_tenant(&pool).await;
        let store = SqlExpenseStore::new(pool);

        store
            .insert(&sample_expense("EXP-SEQ", ApprovalMode::Sequential, &["m1", "m2"]))
            .await
            .expect("insert sequential");
        store
            .insert(&sample_expense("EXP-PAR", ApprovalMode::Parallel, &["m1", "m2"]))
            .await
            .expect("insert parallel");

        let first = store.list_pending_for_approver(&UserId("m1".to_string())).await.expect("m1");
        assert_eq!(first.len(), 2);

        let second = store.list_pending_for_approver(&UserId("m2".to_string())).await.expect("m2");
        let ids: Vec<&str> = second.iter().map(|expense| expense.id.0.as_str()).collect();
        assert_eq!(ids, ["EXP-PAR"]);
    }

    #[tokio::test]
    async fn submitter_history_is_newest_first() {
        let pool = setup().await;
        seed_tenant(&pool).await;
        let store = SqlExpenseStore::new(pool);

        let mut older = sample_expense("EXP-OLD", ApprovalMode::Parallel, &["m1"]);
        older.created_at = Utc::now() - Duration::days(2);
        store.insert(&older).await.expect("insert older");
        store
            .insert(&sample_expense("EXP-NEW", ApprovalMode::Parallel, &["m1"]))
            .await
            .expect("insert newer");

        let history =
            store.list_by_submitter(&UserId("u-emp".to_string())).await.expect("history");
        let ids: Vec<&str> = history.iter().map(|expense| expense.id.0.as_str()).collect();
        assert_eq!(ids, ["EXP-NEW", "EXP-OLD"]);
    }
}
