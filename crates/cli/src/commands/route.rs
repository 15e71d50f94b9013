use std::sync::Arc;

use expensa_core::audit::TracingAuditSink;
use expensa_core::{
    ApprovalWorkflow, CompanyId, ExpenseService, LogNotificationDispatcher, RoutePreview,
    StoreError, WorkflowError,
};
use expensa_db::{SqlExpenseStore, SqlRuleRepository, SqlUserDirectory};
use rust_decimal::Decimal;
use serde_json::json;

use super::{open_pool, prepare, CommandFailure, CommandResult};

const COMMAND: &str = "route";

#[derive(Debug, Clone)]
pub struct RouteArgs {
    pub company: String,
    pub amount: Decimal,
    pub category: String,
    pub currency: Option<String>,
}

pub fn run(args: RouteArgs) -> CommandResult {
    let (config, runtime) = match prepare(COMMAND) {
        Ok(prepared) => prepared,
        Err(result) => return result,
    };

    let outcome: Result<RoutePreview, CommandFailure> = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let workflow = ApprovalWorkflow::new(
            Arc::new(SqlRuleRepository::new(pool.clone())),
            Arc::new(SqlUserDirectory::new(pool.clone())),
            Arc::new(SqlExpenseStore::new(pool.clone())),
            Arc::new(LogNotificationDispatcher),
            Arc::new(TracingAuditSink),
        );
        let service = ExpenseService::new(workflow, Arc::new(config.currency.rate_table()));

        let company_id = CompanyId(args.company.trim().to_string());
        let currency = match args.currency.as_deref() {
            Some(code) => code.to_string(),
            None => service
                .workflow()
                .directory()
                .find_company(&company_id)
                .await
                .map_err(|error| routing_failure(WorkflowError::Store(error)))?
                .map(|company| company.base_currency)
                .ok_or_else(|| {
                    routing_failure(WorkflowError::CompanyNotFound(company_id.clone()))
                })?,
        };

        let preview = service
            .preview(&company_id, args.amount, &currency, &args.category)
            .await
            .map_err(routing_failure);
        pool.close().await;
        preview
    });

    match outcome {
        Ok(preview) => CommandResult::success_with_details(
            COMMAND,
            summary_message(&preview),
            Some(details(&preview)),
        ),
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}

fn routing_failure(error: WorkflowError) -> CommandFailure {
    match error {
        WorkflowError::Store(StoreError::Backend(message)) => ("db_query", message, 4),
        other => ("routing", other.to_string(), 7),
    }
}

fn summary_message(preview: &RoutePreview) -> String {
    let rule = match preview.policy.rule() {
        Some(rule) => format!("rule `{}`", rule.id),
        None => "default manager routing".to_string(),
    };
    match &preview.chain {
        Ok(chain) => format!(
            "{rule} routes {} to {} approver(s) ({})",
            preview.converted_amount,
            chain.assignments.len(),
            chain.mode.as_str()
        ),
        Err(error) => format!("{rule} cannot be routed: {error}"),
    }
}

fn details(preview: &RoutePreview) -> serde_json::Value {
    let (mode, approvers, issue) = match &preview.chain {
        Ok(chain) => (
            Some(chain.mode.as_str()),
            chain.assignments.iter().map(|slot| slot.user_id.0.clone()).collect::<Vec<_>>(),
            None,
        ),
        Err(error) => (None, Vec::new(), Some(error.to_string())),
    };

    json!({
        "convertedAmount": preview.converted_amount.to_string(),
        "matchedRuleId": preview.policy.rule().map(|rule| rule.id.0.clone()),
        "thresholdPercent": preview.policy.rule().and_then(|rule| rule.threshold_percent),
        "mode": mode,
        "approvers": approvers,
        "configurationIssue": issue,
    })
}

#[cfg(test)]
mod tests {
    use expensa_core::approvals::{BuiltChain, ChainError, MatchedPolicy};
    use expensa_core::{ApprovalMode, ApproverAssignment, CompanyId, RoutePreview, UserId};
    use rust_decimal::Decimal;

    use super::{details, summary_message};

    #[test]
    fn default_route_lists_first_manager() {
        let preview = RoutePreview {
            converted_amount: Decimal::new(4200, 2),
            policy: MatchedPolicy::Default,
            chain: Ok(BuiltChain {
                assignments: vec![ApproverAssignment::undecided(UserId("m1".to_string()), 0)],
                mode: ApprovalMode::Parallel,
                matched_rule_id: None,
            }),
        };

        assert_eq!(
            summary_message(&preview),
            "default manager routing routes 42.00 to 1 approver(s) (parallel)"
        );
        let value = details(&preview);
        assert_eq!(value["approvers"], serde_json::json!(["m1"]));
        assert_eq!(value["convertedAmount"], "42.00");
        assert!(value["matchedRuleId"].is_null());
    }

    #[test]
    fn configuration_issue_is_reported_instead_of_approvers() {
        let preview = RoutePreview {
            converted_amount: Decimal::new(10, 0),
            policy: MatchedPolicy::Default,
            chain: Err(ChainError::NoManagerApprovers {
                company_id: CompanyId("acme".to_string()),
            }),
        };

        let value = details(&preview);
        assert!(value["mode"].is_null());
        assert_eq!(value["approvers"], serde_json::json!([]));
        assert_eq!(
            value["configurationIssue"],
            "company `acme` has no manager-approvers to route to"
        );
        assert!(summary_message(&preview).starts_with("default manager routing cannot be routed"));
    }
}
