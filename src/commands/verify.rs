//! The verify command.

use std::path::PathBuf;

use bytes::Bytes;
use clap::builder::ValueParser;
use domain::base::Name;

use crate::config::parse_name;
use crate::env::Env;
use crate::error::Result;
use crate::verifier::verify_file;

#[derive(Clone, Debug, clap::Args)]
pub struct Verify {
    /// The signed zone file to verify
    #[arg(short = 'f', long = "file", value_name = "path")]
    zonefile_path: PathBuf,

    /// Apex owner name of the zone
    #[arg(
        short = 'z',
        long = "zone",
        value_name = "name",
        value_parser = ValueParser::new(parse_name)
    )]
    zone: Name<Bytes>,
}

impl Verify {
    pub fn execute(self, env: impl Env) -> Result<()> {
        verify_file(&env, &self.zonefile_path, &self.zone)?;
        writeln!(
            env.stdout(),
            "zone {}: signatures and digest verified successfully",
            self.zone.fmt_with_dot()
        );
        Ok(())
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use crate::env::fake::FakeCmd;

    #[test]
    fn requires_file_and_zone() {
        let cmd = FakeCmd::new(["zonesign", "verify"]);
        assert!(cmd.parse().is_err());
        assert!(cmd.args(["-f", "zone.signed"]).parse().is_err());
        assert!(cmd
            .args(["-f", "zone.signed", "-z", "example."])
            .parse()
            .is_ok());
    }

    #[test]
    fn missing_file_fails() {
        let res = FakeCmd::new(["zonesign", "verify"])
            .args(["-f", "/nonexistent/zone.signed", "-z", "example."])
            .run();
        assert_eq!(res.exit_code, 1);
    }
}
