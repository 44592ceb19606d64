use crate::commands::{self, CommandResult, StepError};

pub fn run() -> CommandResult {
    let config = match commands::load_config("migrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match commands::runtime("migrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = commands::open_migrated_pool(&config).await?;
        pool.close().await;
        Ok::<(), StepError>(())
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
