use expensa_db::{migrations, DemoSeedDataset, SeedResult};

use crate::commands::{open_pool, prepare, CommandFailure, CommandResult};

pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("seed") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let seeded = DemoSeedDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        let failed_checks = verification
            .checks
            .iter()
            .filter_map(|(check, passed)| (!passed).then_some(*check))
            .collect::<Vec<_>>();

        pool.close().await;

        let outcome: Result<SeedResult, CommandFailure> = if verification.all_present {
            Ok(seeded)
        } else {
            Err(("seed_verification", verification_message(&failed_checks), 6u8))
        };
        outcome
    });

    match result {
        Ok(seeded) => CommandResult::success("seed", summary_message(&seeded)),
        Err(failure) => CommandResult::from_failure("seed", failure),
    }
}

fn summary_message(seeded: &SeedResult) -> String {
    format!(
        "demo tenant loaded: {} company, {} users, {} approval rules (company id `co-acme`)",
        seeded.companies, seeded.users, seeded.rules
    )
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use expensa_db::SeedResult;

    use super::{summary_message, verification_message};

    #[test]
    fn verification_error_message_targets_failed_checks() {
        let message = verification_message(&["users", "manager-roster-order"]);
        assert_eq!(message, "Seed verification failed for checks: users, manager-roster-order");
    }

    #[test]
    fn verification_error_message_falls_back_to_generic_when_no_labels() {
        assert_eq!(verification_message(&[]), "Some seed data failed to load");
    }

    #[test]
    fn summary_names_the_demo_company() {
        let message = summary_message(&SeedResult { companies: 1, users: 6, rules: 2 });
        assert!(message.contains("6 users"));
        assert!(message.contains("co-acme"));
    }
}
