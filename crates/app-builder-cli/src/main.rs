use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = app_builder_cli::Cli::parse();
    app_builder_cli::init_tracing(cli.verbosity());

    match app_builder_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = ?err, "command failed");
            let envelope = app_builder_cli::ErrorEnvelope::from_error(&err);
            match serde_json::to_string(&envelope) {
                Ok(body) => eprintln!("{body}"),
                Err(_) => eprintln!("{err:#}"),
            }
            ExitCode::from(app_builder_cli::exit_code(&err))
        }
    }
}
