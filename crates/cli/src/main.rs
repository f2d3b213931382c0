use std::process::ExitCode;

fn main() -> ExitCode {
    dataagent_cli::run()
}
