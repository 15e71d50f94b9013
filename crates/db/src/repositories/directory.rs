use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use expensa_core::domain::tenant::{Company, CompanyId, User, UserId, UserRole};
use expensa_core::workflow::{StoreError, UserDirectory};

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Companies and users. Roster order is insertion order (`roster_position`).
pub struct SqlUserDirectory {
    pool: DbPool,
}

impl SqlUserDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn save_company(&self, company: &Company) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO companies (id, name, base_currency, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 base_currency = excluded.base_currency",
        )
        .bind(&company.id.0)
        .bind(&company.name)
        .bind(&company.base_currency)
        .bind(format_timestamp(&company.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upserts keep the original row, so an edited user keeps their roster position.
    pub async fn save_user(&self, user: &User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO users (id, company_id, name, email, role, is_manager_approver, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 email = excluded.email,
                 role = excluded.role,
                 is_manager_approver = excluded.is_manager_approver",
        )
        .bind(&user.id.0)
        .bind(&user.company_id.0)
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(user.is_manager_approver)
        .bind(format_timestamp(&user.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_companies(&self) -> Result<Vec<Company>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, base_currency, created_at FROM companies ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn load_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<Company>, RepositoryError> {
        let row =
            sqlx::query("SELECT id, name, base_currency, created_at FROM companies WHERE id = ?")
                .bind(&company_id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn load_user(&self, user_id: &UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, company_id, name, email, role, is_manager_approver, created_at
             FROM users WHERE id = ?",
        )
        .bind(&user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn load_member_ids(
        &self,
        company_id: &CompanyId,
        managers_only: bool,
    ) -> Result<Vec<UserId>, RepositoryError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM users
             WHERE company_id = ? AND (is_manager_approver = 1 OR ? = 0)
             ORDER BY roster_position ASC",
        )
        .bind(&company_id.0)
        .bind(managers_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(UserId).collect())
    }
}

fn company_from_row(row: &SqliteRow) -> Result<Company, RepositoryError> {
    Ok(Company {
        id: CompanyId(row.try_get("id")?),
        name: row.try_get("name")?,
        base_currency: row.try_get("base_currency")?,
        created_at: parse_timestamp("created_at", &row.try_get::<String, _>("created_at")?)?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<User, RepositoryError> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: UserId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        role: UserRole::parse(&role)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown user role `{role}`")))?,
        is_manager_approver: row.try_get("is_manager_approver")?,
        created_at: parse_timestamp("created_at", &row.try_get::<String, _>("created_at")?)?,
    })
}

#[async_trait]
impl UserDirectory for SqlUserDirectory {
    async fn find_company(&self, company_id: &CompanyId) -> Result<Option<Company>, StoreError> {
        Ok(self.load_company(company_id).await?)
    }

    async fn find_user(&self, user_id: &UserId) -> Result<Option<User>, StoreError> {
        Ok(self.load_user(user_id).await?)
    }

    async fn list_manager_approvers(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<UserId>, StoreError> {
        Ok(self.load_member_ids(company_id, true).await?)
    }

    async fn list_company_members(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<UserId>, StoreError> {
        Ok(self.load_member_ids(company_id, false).await?)
    }
}

#[cfg(test)]
mod tests {
    use expensa_core::domain::tenant::{CompanyId, UserId, UserRole};
    use expensa_core::workflow::UserDirectory;

    use crate::repositories::test_support::{company, seed_tenant, setup, user};

    #[tokio::test]
    async fn manager_approvers_follow_roster_order() {
        let pool = setup().await;
        let directory = seed_tenant(&pool).await;

        directory.save_company(&company("globex", "EUR")).await.expect("second company");
        directory.save_user(&user("g-boss", "globex", true)).await.expect("foreign manager");

        let managers = directory
            .list_manager_approvers(&CompanyId("acme".to_string()))
            .await
            .expect("managers");
        let ids: Vec<&str> = managers.iter().map(|id| id.0.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);

        let members = directory
            .list_company_members(&CompanyId("acme".to_string()))
            .await
            .expect("members");
        assert_eq!(members.len(), 4);
        assert!(!members.contains(&UserId("g-boss".to_string())));
    }

    #[tokio::test]
    async fn editing_a_user_keeps_roster_position() {
        let pool = setup().await;
        let directory = seed_tenant(&pool).await;

        let mut first = user("m1", "acme", true);
        first.name = "Renamed".to_string();
        first.role = UserRole::Admin;
        directory.save_user(&first).await.expect("update");

        let managers = directory
            .list_manager_approvers(&CompanyId("acme".to_string()))
            .await
            .expect("managers");
        assert_eq!(managers[0].0, "m1");

        let found =
            directory.find_user(&UserId("m1".to_string())).await.expect("find").expect("exists");
        assert_eq!(found.name, "Renamed");
        assert_eq!(found.role, UserRole::Admin);
    }

    async fn globex_positions(pool: &crate::DbPool) -> Vec<(String, i64)> {
        sqlx::query_as(
            "SELECT id, roster_position FROM users WHERE company_id = 'globex'
             ORDER BY roster_position ASC",
        )
        .fetch_all(pool)
        .await
        .expect("positions")
    }

    #[tokio::test]
    async fn roster_order_survives_vacuum() {
        let pool = setup().await;
        let directory = seed_tenant(&pool).await;
        directory.save_company(&company("globex", "EUR")).await.expect("company");
        for manager in ["zed", "amy", "kim"] {
            directory.save_user(&user(manager, "globex", true)).await.expect("manager");
        }

        sqlx::query("DELETE FROM users WHERE id = 'amy'").execute(&pool).await.expect("delete");
        let before = globex_positions(&pool).await;
        sqlx::query("VACUUM").execute(&pool).await.expect("vacuum");
        assert_eq!(globex_positions(&pool).await, before);

        directory.save_user(&user("bob", "globex", true)).await.expect("late manager");
        let managers = directory
            .list_manager_approvers(&CompanyId("globex".to_string()))
            .await
            .expect("managers");
        let ids: Vec<&str> = managers.iter().map(|id| id.0.as_str()).collect();
        assert_eq!(ids, ["zed", "kim", "bob"]);
    }

    #[tokio::test]
    async fn unknown_company_and_user_are_none() {
        let pool = setup().await;
        let directory = seed_tenant(&pool).await;

        assert!(directory
            .find_company(&CompanyId("nope".to_string()))
            .await
            .expect("company lookup")
            .is_none());
        assert!(directory.find_user(&UserId("ghost".to_string())).await.expect("lookup").is_none());
        let company = directory
            .find_company(&CompanyId("acme".to_string()))
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(company.base_currency, "USD");
    }
}
