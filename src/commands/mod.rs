//! The commands of _zonesign_.

pub mod hsm;
pub mod sign;
pub mod verify;

use crate::env::Env;
use crate::error::Error;

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Sign a zone file with DNSSEC
    #[command(name = "sign")]
    Sign(self::sign::Sign),

    /// Verify the signatures and digest of a signed zone file
    #[command(name = "verify")]
    Verify(self::verify::Verify),

    /// Destroy the signer keys on a PKCS#11 token
    #[command(name = "reset-pkcs11-keys")]
    ResetPkcs11Keys(self::hsm::ResetPkcs11Keys),

    /// Expire the signer keys on a PKCS#11 token
    #[command(name = "expire-pkcs11-keys")]
    ExpirePkcs11Keys(self::hsm::ExpirePkcs11Keys),
}

impl Command {
    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        match self {
            Self::Sign(sign) => sign.execute(env),
            Self::Verify(verify) => verify.execute(env),
            Self::ResetPkcs11Keys(reset) => reset.execute(env),
            Self::ExpirePkcs11Keys(expire) => expire.execute(env),
        }
    }
}
