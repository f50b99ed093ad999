//! Maintenance commands for PKCS#11 signer keys.

use std::path::PathBuf;

use crate::env::Env;
use crate::error::Result;
use crate::pkcs11::{destroy_signer_keys, expire_signer_keys, HsmModule};

/// How to reach the token.
#[derive(Clone, Debug, clap::Args)]
struct HsmAccess {
    /// Path of the PKCS#11 module to load
    #[arg(long = "p11lib", value_name = "path")]
    p11lib: PathBuf,

    /// Label of the token holding the signer keys
    #[arg(long = "token-label", value_name = "label")]
    token_label: String,

    /// User PIN for the token
    #[arg(short = 'p', long = "pin", value_name = "pin")]
    pin: String,
}

#[derive(Clone, Debug, clap::Args)]
pub struct ResetPkcs11Keys {
    #[command(flatten)]
    access: HsmAccess,
}

#[derive(Clone, Debug, clap::Args)]
pub struct ExpirePkcs11Keys {
    #[command(flatten)]
    access: HsmAccess,
}

impl ResetPkcs11Keys {
    pub fn execute(self, env: impl Env) -> Result<()> {
        let module = HsmModule::open(&env.in_cwd(&self.access.p11lib))?;
        let session = module.login(&self.access.token_label, &self.access.pin)?;
        let count = destroy_signer_keys(&session)?;
        writeln!(env.stdout(), "destroyed {count} signer key objects");
        Ok(())
    }
}

impl ExpirePkcs11Keys {
    pub fn execute(self, env: impl Env) -> Result<()> {
        let module = HsmModule::open(&env.in_cwd(&self.access.p11lib))?;
        let session = module.login(&self.access.token_label, &self.access.pin)?;
        let count = expire_signer_keys(&session)?;
        writeln!(env.stdout(), "expired {count} signer key objects");
        Ok(())
    }
}

//============ Tests =========================================================
