use std::process::ExitCode;

fn main() -> ExitCode {
    tars_cli::run()
}
