use clap::Parser;

use env::Env;
use error::Error;

pub use self::args::Args;

pub mod args;
pub mod canonical;
pub mod commands;
pub mod config;
pub mod denial;
pub mod env;
pub mod error;
pub mod keys;
pub mod log;
pub mod pkcs11;
pub mod signer;
pub mod verifier;
pub mod zone;
pub mod zonemd;

/// Parse the command line arguments provided by the given environment.
pub fn parse_args(env: impl Env) -> Result<Args, Error> {
    Ok(Args::try_parse_from(env.args_os())?)
}

/// Run the program in the given environment, returning its exit code.
pub fn run(env: impl Env) -> u8 {
    log::init();
    let res = parse_args(&env).and_then(|args| args.execute(&env));
    match res {
        Ok(()) => 0,
        Err(err) => {
            err.pretty_print(&env);
            err.exit_code()
        }
    }
}
