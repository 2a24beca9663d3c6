use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = effect_ledger_cli::Cli::parse();
    effect_ledger_cli::init_tracing(cli.global.verbose);
    match effect_ledger_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(effect_ledger_cli::exit_code(&err))
        }
    }
}
