use std::process::ExitCode;

fn main() -> ExitCode {
    tunesmith_cli::run()
}
