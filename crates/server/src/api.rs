//! JSON API over the approval workflow.
//!
//! - `POST   /api/v1/expenses`                          submit an expense for routing
//! - `GET    /api/v1/expenses/{expense_id}`             expense with its approver chain
//! - `POST   /api/v1/expenses/{expense_id}/decisions`   record an approver decision
//! - `GET    /api/v1/approvers/{user_id}/pending`       expenses awaiting this approver now
//! - `GET    /api/v1/users/{user_id}/expenses`          submitter history, newest first
//! - `GET    /api/v1/companies/{company_id}/rules`      list rules (`?includeInactive=true`)
//! - `POST   /api/v1/companies/{company_id}/rules`      create a rule
//! - `PUT    /api/v1/rules/{rule_id}`                   replace a rule's editable fields
//! - `DELETE /api/v1/rules/{rule_id}`                   deactivate a rule

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use expensa_core::audit::AuditContext;
use expensa_core::{
    ApprovalRule, CompanyId, DecisionEvent, Expense, ExpenseDraft, ExpenseId, ExpenseService,
    ExpenseStatus, InterfaceError, RuleAdminService, RuleDraft, RuleId, SubmissionOutcome,
    UserId, WorkflowError,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

const CORRELATION_HEADER: &str = "x-correlation-id";
const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct ApiState {
    expenses: ExpenseService,
    rules: RuleAdminService,
}

impl ApiState {
    pub fn new(expenses: ExpenseService, rules: RuleAdminService) -> Self {
        Self { expenses, rules }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub approver_id: UserId,
    pub approved: bool,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub new_status: ExpenseStatus,
    pub next_approvers: Vec<UserId>,
    pub rejected: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleListQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    pub error: &'static str,
    pub message: String,
    pub correlation_id: String,
}

/// Interface-tier error rendered as a JSON body with a matching status code.
#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn from_workflow(error: WorkflowError, correlation_id: &str) -> Self {
        Self(error.into_interface(correlation_id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, class, correlation_id) = match &self.0 {
            InterfaceError::BadRequest { correlation_id, .. } => {
                (StatusCode::BAD_REQUEST, "bad_request", correlation_id)
            }
            InterfaceError::NotFound { correlation_id, .. } => {
                (StatusCode::NOT_FOUND, "not_found", correlation_id)
            }
            InterfaceError::Conflict { correlation_id, .. } => {
                (StatusCode::CONFLICT, "conflict", correlation_id)
            }
            InterfaceError::ServiceUnavailable { correlation_id, .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", correlation_id)
            }
            InterfaceError::Internal { correlation_id, .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", correlation_id)
            }
        };

        // Backend detail stays in the log; clients get the generic message.
        let message = if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = %correlation_id,
                http_status = status.as_u16(),
                error = %self.0,
                "request failed"
            );
            self.0.user_message().to_string()
        } else {
            warn!(
                event_name = "api.request.rejected",
                correlation_id = %correlation_id,
                http_status = status.as_u16(),
                error = %self.0,
                "request rejected"
            );
            self.0.message().to_string()
        };

        let body = ApiErrorBody { error: class, message, correlation_id: correlation_id.clone() };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/expenses", post(submit_expense))
        .route("/api/v1/expenses/{expense_id}", get(get_expense))
        .route("/api/v1/expenses/{expense_id}/decisions", post(record_decision))
        .route("/api/v1/approvers/{user_id}/pending", get(approver_inbox))
        .route("/api/v1/users/{user_id}/expenses", get(submitter_history))
        .route("/api/v1/companies/{company_id}/rules", get(list_rules).post(create_rule))
        .route("/api/v1/rules/{rule_id}", put(update_rule).delete(deactivate_rule))
        .with_state(state)
}

async fn submit_expense(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(draft): Json<ExpenseDraft>,
) -> Result<(StatusCode, Json<SubmissionOutcome>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let outcome = state
        .expenses
        .submit(draft, &correlation_id)
        .await
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn get_expense(
    Path(expense_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Expense>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .expenses
        .workflow()
        .find_expense(&ExpenseId(expense_id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

async fn record_decision(
    Path(expense_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let outcome = state
        .expenses
        .workflow()
        .decide(DecisionEvent {
            expense_id: ExpenseId(expense_id),
            approver_id: body.approver_id,
            approved: body.approved,
            comments: body.comments.filter(|comments| !comments.trim().is_empty()),
            correlation_id: correlation_id.clone(),
        })
        .await
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))?;

    Ok(Json(DecisionResponse {
        new_status: outcome.new_status,
        next_approvers: outcome.next_approvers,
        rejected: outcome.rejected,
    }))
}

async fn approver_inbox(
    Path(user_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Expense>>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .expenses
        .workflow()
        .pending_for(&UserId(user_id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

async fn submitter_history(
    Path(user_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Expense>>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .expenses
        .workflow()
        .submitted_by(&UserId(user_id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

async fn list_rules(
    Path(company_id): Path<String>,
    Query(query): Query<RuleListQuery>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ApprovalRule>>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .rules
        .list(&CompanyId(company_id), query.include_inactive)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

async fn create_rule(
    Path(company_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(draft): Json<RuleDraft>,
) -> Result<(StatusCode, Json<ApprovalRule>), ApiError> {
    let company_id = CompanyId(company_id);
    let context = audit_context(&headers, Some(company_id.clone()));
    let rule = state
        .rules
        .create(&company_id, draft, &context)
        .await
        .map_err(|error| ApiError::from_workflow(error, &context.correlation_id))?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    Path(rule_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(draft): Json<RuleDraft>,
) -> Result<Json<ApprovalRule>, ApiError> {
    let context = audit_context(&headers, None);
    state
        .rules
        .update(&RuleId(rule_id), draft, &context)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &context.correlation_id))
}

async fn deactivate_rule(
    Path(rule_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let context = audit_context(&headers, None);
    state
        .rules
        .deactivate(&RuleId(rule_id), &context)
        .await
        .map_err(|error| ApiError::from_workflow(error, &context.correlation_id))?;
    Ok(StatusCode::NO_CONTENT)
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map_or_else(|| format!("req-{}", Uuid::new_v4()), ToString::to_string)
}

fn audit_context(headers: &HeaderMap, company_id: Option<CompanyId>) -> AuditContext {
    let actor = headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("api");
    AuditContext::new(company_id, None, correlation_id(headers), actor)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use expensa_core::audit::InMemoryAuditSink;
    use expensa_core::workflow::RecordingNotificationDispatcher;
    use expensa_core::{ApprovalWorkflow, ExpenseService, RuleAdminService, StaticRateTable};
    use expensa_db::{
        connect_with_settings, migrations, DbPool, DemoSeedDataset, SqlExpenseStore,
        SqlRuleRepository, SqlUserDirectory,
    };
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, ApiState};

    struct Harness {
        router: Router,
        pool: DbPool,
        notifier: Arc<RecordingNotificationDispatcher>,
    }

    async fn harness() -> Harness {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrate");
        DemoSeedDataset::load(&pool).await.expect("seed");

        let notifier = Arc::new(RecordingNotificationDispatcher::default());
        let audit = Arc::new(InMemoryAuditSink::default());
        let rules = Arc::new(SqlRuleRepository::new(pool.clone()));
        let directory = Arc::new(SqlUserDirectory::new(pool.clone()));
        let workflow = ApprovalWorkflow::new(
            rules.clone(),
            directory.clone(),
            Arc::new(SqlExpenseStore::new(pool.clone())),
            notifier.clone(),
            audit.clone(),
        );
        let rates = StaticRateTable::new("USD", [("EUR".to_string(), Decimal::new(8, 1))]);
        let state = ApiState::new(
            ExpenseService::new(workflow, Arc::new(rates)),
            RuleAdminService::new(rules, directory, audit),
        );

        Harness { router: router(state), pool, notifier }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-correlation-id", "corr-test");
        let request = match body {
            Some(body) => builder.body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    fn draft(amount: &str, currency: &str, category: &str) -> Value {
        json!({
            "companyId": "co-acme",
            "submittedBy": "usr-emp",
            "amount": amount,
            "currency": currency,
            "category": category,
            "description": "client visit",
            "expenseDate": "2026-03-02",
        })
    }

    #[tokio::test]
    async fn small_expense_routes_to_first_manager_and_shows_in_inbox() {
        let harness = harness().await;

        let (status, outcome) =
            send(&harness.router, "POST", "/api/v1/expenses", Some(draft("42.50", "USD", "meals")))
                .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(outcome["matchedRuleId"].is_null());
        assert_eq!(outcome["expense"]["approvers"][0]["userId"], "usr-mgr-1");
        let expense_id = outcome["expense"]["id"].as_str().expect("expense id").to_string();

        let (status, expense) =
            send(&harness.router, "GET", &format!("/api/v1/expenses/{expense_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(expense["status"], "pending");

        let (status, inbox) =
            send(&harness.router, "GET", "/api/v1/approvers/usr-mgr-1/pending", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(inbox.as_array().map(Vec::len), Some(1));

        let assigned = harness.notifier.wait_for(1).await;
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].recipient_user_id.0, "usr-mgr-1");

        harness.pool.close().await;
    }

    #[tokio::test]
    async fn sequential_decisions_enforce_order_over_http() {
        let harness = harness().await;

        let (status, outcome) =
            send(&harness.router, "POST", "/api/v1/expenses", Some(draft("1200", "EUR", "travel")))
                .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(outcome["expense"]["convertedAmount"], "1500.00");
        assert_eq!(outcome["matchedRuleId"], "rule-travel-seq");
        let expense_id = outcome["expense"]["id"].as_str().expect("expense id").to_string();
        let decisions = format!("/api/v1/expenses/{expense_id}/decisions");

        let (status, early) = send(
            &harness.router,
            "POST",
            &decisions,
            Some(json!({"approverId": "usr-fin-dir", "approved": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(early["error"], "conflict");
        assert_eq!(early["correlationId"], "corr-test");

        let (status, first) = send(
            &harness.router,
            "POST",
            &decisions,
            Some(json!({"approverId": "usr-mgr-1", "approved": true, "comments": "ok"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            first,
            json!({"newStatus": "pending", "nextApprovers": ["usr-fin-dir"], "rejected": false})
        );

        let (status, last) = send(
            &harness.router,
            "POST",
            &decisions,
            Some(json!({"approverId": "usr-fin-dir", "approved": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(last["newStatus"], "approved");

        let (status, history) =
            send(&harness.router, "GET", "/api/v1/users/usr-emp/expenses", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history[0]["status"], "approved");

        harness.pool.close().await;
    }

    #[tokio::test]
    async fn lookup_and_intake_errors_map_to_client_statuses() {
        let harness = harness().await;

        let (status, missing) =
            send(&harness.router, "GET", "/api/v1/expenses/EXP-missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["error"], "not_found");

        let (status, unsupported) =
            send(&harness.router, "POST", "/api/v1/expenses", Some(draft("10", "JPY", "meals")))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(unsupported["message"].as_str().unwrap_or_default().contains("JPY"));

        let (status, _) =
            send(&harness.router, "POST", "/api/v1/expenses", Some(draft("-5", "USD", "meals")))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        harness.pool.close().await;
    }

    #[tokio::test]
    async fn rules_can_be_created_listed_and_deactivated() {
        let harness = harness().await;
        let rules_uri = "/api/v1/companies/co-acme/rules";

        let (status, _) = send(
            &harness.router,
            "POST",
            rules_uri,
            Some(json!({"name": "Ghost approver", "requiredApproverIds": ["usr-nobody"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, created) = send(
            &harness.router,
            "POST",
            rules_uri,
            Some(json!({
                "name": "Hardware",
                "requiredApproverIds": ["usr-mgr-2"],
                "categoryFilters": ["hardware"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let rule_id = created["id"].as_str().expect("rule id").to_string();

        let (status, listed) = send(&harness.router, "GET", rules_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(3));

        let (status, updated) = send(
            &harness.router,
            "PUT",
            &format!("/api/v1/rules/{rule_id}"),
            Some(json!({"name": "Hardware purchases", "requiredApproverIds": ["usr-mgr-3"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["requiredApproverIds"], json!(["usr-mgr-3"]));

        let (status, _) =
            send(&harness.router, "DELETE", &format!("/api/v1/rules/{rule_id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, active) = send(&harness.router, "GET", rules_uri, None).await;
        assert_eq!(active.as_array().map(Vec::len), Some(2));
        let (_, all) =
            send(&harness.router, "GET", &format!("{rules_uri}?includeInactive=true"), None)
                .await;
        assert_eq!(all.as_array().map(Vec::len), Some(3));

        harness.pool.close().await;
    }
}
