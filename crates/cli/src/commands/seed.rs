use crate::commands::{self, CommandResult, StepError};
use tunesmith_db::fixtures::{self, SeedSummary};

pub fn run() -> CommandResult {
    let config = match commands::load_config("seed") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match commands::runtime("seed") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = commands::open_migrated_pool(&config).await?;
        let summary = fixtures::seed(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<SeedSummary, StepError>(summary)
    });

    match result {
        // The seed is a no-op when catalog data already exists.
        Ok(summary) if summary.artists == 0 => CommandResult::success(
            "seed",
            "database already contains catalog data; nothing to do",
        ),
        Ok(summary) => CommandResult::success(
            "seed",
            format!(
                "seeded demo store: {} artists, {} tracks, {} employees, {} customers, \
                 {} invoices",
                summary.artists,
                summary.tracks,
                summary.employees,
                summary.customers,
                summary.invoices
            ),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}
