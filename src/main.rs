use std::process::ExitCode;

fn main() -> ExitCode {
    let env = zonesign::env::RealEnv;
    ExitCode::from(zonesign::run(env))
}
