//! The sign command.

use std::path::PathBuf;

use bytes::Bytes;
use clap::builder::ValueParser;
use domain::base::iana::ZonemdAlgorithm;
use domain::base::{Name, Ttl};
use domain::rdata::dnssec::Timestamp;
use domain::rdata::nsec3::Nsec3Salt;

use crate::config::{
    parse_name, parse_salt, parse_timestamp, parse_zonemd_alg, SignAlgorithm,
    SignConfig, DEFAULT_MIN_TTL,
};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::keys::load_key_pair;
use crate::pkcs11::{self, HsmModule};
use crate::signer::sign_zone;

#[derive(Clone, Debug, clap::Args)]
pub struct Sign {
    #[command(subcommand)]
    backend: Backend,
}

#[derive(Clone, Debug, clap::Subcommand)]
enum Backend {
    /// Sign with keys loaded from BIND format key files
    ///
    /// Keys must be specified by their base name (usually
    /// K<name>+<alg>+<tag>), i.e. WITHOUT the .private or .key extension.
    /// Both the .private and .key files are required.
    #[command(name = "file")]
    File(FileArgs),

    /// Sign with keys held in a PKCS#11 HSM
    ///
    /// The signer keys are the token objects labelled "dHSM-signer" whose
    /// CKA_ID is "zsk" or "ksk" and whose validity window covers today.
    #[command(name = "pkcs11")]
    Pkcs11(Pkcs11Args),
}

#[derive(Clone, Debug, clap::Args)]
struct CommonArgs {
    /// Apex owner name of the zone to sign
    #[arg(
        short = 'z',
        long = "zone",
        value_name = "name",
        value_parser = ValueParser::new(parse_name)
    )]
    zone: Name<Bytes>,

    /// The zone file to sign
    #[arg(short = 'f', long = "file", value_name = "path")]
    zonefile_path: PathBuf,

    /// Output file [default: <zonefile>.signed]
    ///
    /// Use '-o -' to output to stdout.
    #[arg(short = 'o', long = "output", value_name = "path")]
    out_path: Option<PathBuf>,

    /// Signature algorithm the keys must use
    #[arg(
        short = 'a',
        long = "algorithm",
        value_name = "algorithm",
        default_value = "RSASHA256"
    )]
    algorithm: SignAlgorithm,

    /// Signature expiration date [default: 3 months from now]
    ///
    /// A date can be a timestamp (seconds since the epoch), or of the form
    /// <YYYYMMdd[hhmmss]>.
    #[arg(
        short = 'e',
        long = "expiration",
        value_name = "date",
        value_parser = ValueParser::new(parse_timestamp)
    )]
    expiration: Option<Timestamp>,

    /// Signature inception date [default: 1 hour ago]
    #[arg(
        short = 'i',
        long = "inception",
        value_name = "date",
        value_parser = ValueParser::new(parse_timestamp)
    )]
    inception: Option<Timestamp>,

    /// Use NSEC3 instead of NSEC
    #[arg(short = 'n', long = "nsec3")]
    use_nsec3: bool,

    /// Set the Opt-Out flag and skip insecure delegations
    #[arg(
        help_heading = Some("NSEC3 (when using '-n')"),
        long = "opt-out",
        requires = "use_nsec3"
    )]
    opt_out: bool,

    /// Number of extra hash iterations
    #[arg(
        help_heading = Some("NSEC3 (when using '-n')"),
        short = 't',
        long = "iterations",
        value_name = "number",
        default_value_t = 0,
        requires = "use_nsec3"
    )]
    iterations: u16,

    /// Salt in hex representation [default: 8 random bytes]
    #[arg(
        help_heading = Some("NSEC3 (when using '-n')"),
        short = 's',
        long = "salt",
        value_name = "hex",
        value_parser = ValueParser::new(parse_salt),
        requires = "use_nsec3"
    )]
    salt: Option<Nsec3Salt<Bytes>>,

    /// Add a ZONEMD record with a digest over the signed zone
    #[arg(long = "zonemd")]
    zonemd: bool,

    /// Hash algorithm for the ZONEMD record
    #[arg(
        long = "zonemd-hash",
        value_name = "algorithm",
        default_value = "SHA384",
        value_parser = ValueParser::new(parse_zonemd_alg),
        requires = "zonemd"
    )]
    zonemd_hash: ZonemdAlgorithm,

    /// TTL for records added to the zone
    #[arg(long = "min-ttl", value_name = "seconds", default_value_t = DEFAULT_MIN_TTL)]
    min_ttl: u32,
}

#[derive(Clone, Debug, clap::Args)]
struct FileArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Base path of the zone signing key files
    #[arg(long = "zsk", value_name = "key")]
    zsk: PathBuf,

    /// Base path of the key signing key files
    #[arg(long = "ksk", value_name = "key")]
    ksk: PathBuf,
}

#[derive(Clone, Debug, clap::Args)]
struct Pkcs11Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Path of the PKCS#11 module to load
    #[arg(long = "p11lib", value_name = "path")]
    p11lib: PathBuf,

    /// Label of the token holding the signer keys
    #[arg(long = "token-label", value_name = "label")]
    token_label: String,

    /// User PIN for the token
    #[arg(short = 'p', long = "pin", value_name = "pin")]
    pin: String,

    /// Generate missing signer keys on the token
    #[arg(long = "create-keys")]
    create_keys: bool,
}

impl Sign {
    pub fn execute(self, env: impl Env) -> Result<()> {
        match self.backend {
            Backend::File(args) => args.execute(env),
            Backend::Pkcs11(args) => args.execute(env),
        }
    }
}

impl CommonArgs {
    fn into_config(self, create_keys: bool) -> SignConfig {
        let out_path = self.out_path.unwrap_or_else(|| {
            PathBuf::from(format!("{}.signed", self.zonefile_path.display()))
        });
        SignConfig {
            zone: self.zone,
            zonefile_path: self.zonefile_path,
            out_path,
            create_keys,
            use_nsec3: self.use_nsec3,
            opt_out: self.opt_out,
            iterations: self.iterations,
            salt: self.salt,
            digest_enabled: self.zonemd,
            zonemd_algorithm: self.zonemd_hash,
            sign_algorithm: self.algorithm,
            inception: self
                .inception
                .unwrap_or_else(SignConfig::default_inception),
            expiration: self
                .expiration
                .unwrap_or_else(SignConfig::default_expiration),
            min_ttl: Ttl::from_secs(self.min_ttl),
        }
    }
}

impl FileArgs {
    fn execute(self, env: impl Env) -> Result<()> {
        let config = self.common.into_config(false);
        config.validate()?;

        let zsk = load_key_pair(&env, &self.zsk)?;
        let ksk = load_key_pair(&env, &self.ksk)?;
        if zsk.is_ksk() {
            return Err(Error::key(
                "the key given with --zsk has the secure entry point flag set",
            ));
        }
        if !ksk.is_ksk() {
            return Err(Error::key(
                "the key given with --ksk lacks the secure entry point flag",
            ));
        }

        sign_zone(&env, &config, &zsk, &ksk)
    }
}

impl Pkcs11Args {
    fn execute(self, env: impl Env) -> Result<()> {
        let config = self.common.into_config(self.create_keys);
        config.validate()?;

        let module = HsmModule::open(&env.in_cwd(&self.p11lib))?;
        let session = module.login(&self.token_label, &self.pin)?;
        let (zsk, ksk) = pkcs11::signer_handles(
            &session,
            &config.zone,
            config.sign_algorithm.to_sec_alg(),
            config.create_keys,
        )?;

        sign_zone(&env, &config, &zsk, &ksk)
    }
}

//============ Tests =========================================================
