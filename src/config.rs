//! The signing run configuration.

use core::str::FromStr;
use std::path::PathBuf;

use bytes::Bytes;
use domain::base::iana::{SecurityAlgorithm, ZonemdAlgorithm};
use domain::base::{Name, Ttl};
use domain::rdata::dnssec::Timestamp;
use domain::rdata::nsec3::Nsec3Salt;

use crate::error::{Error, Result};

/// Default signature lifetime: three months from now.
pub const THREE_MONTHS: u32 = 90 * 86400;

/// Default distance of the inception time from now.
pub const ONE_HOUR: u32 = 3600;

/// Default TTL for records synthesized into the zone.
pub const DEFAULT_MIN_TTL: u32 = 3600;

//------------ SignAlgorithm -------------------------------------------------

/// The signature algorithms a zone can be signed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum SignAlgorithm {
    /// RSA with SHA-256 (algorithm 8).
    #[value(name = "RSASHA256", alias = "8")]
    RsaSha256,

    /// ECDSA P-256 with SHA-256 (algorithm 13).
    #[value(name = "ECDSAP256SHA256", alias = "13")]
    EcdsaP256Sha256,
}

impl SignAlgorithm {
    pub fn to_sec_alg(self) -> SecurityAlgorithm {
        match self {
            SignAlgorithm::RsaSha256 => SecurityAlgorithm::RSASHA256,
            SignAlgorithm::EcdsaP256Sha256 => SecurityAlgorithm::ECDSAP256SHA256,
        }
    }
}

//------------ SignConfig ----------------------------------------------------

/// Everything a signing run needs to know.
///
/// Populated by the CLI layer and validated once at entry into the signing
/// pipeline.
#[derive(Clone, Debug)]
pub struct SignConfig {
    /// The apex owner name of the zone to sign.
    pub zone: Name<Bytes>,

    /// The unsigned input zone file.
    pub zonefile_path: PathBuf,

    /// Where to write the signed zone.
    pub out_path: PathBuf,

    /// Whether missing HSM keys may be generated.
    pub create_keys: bool,

    /// Use NSEC3 instead of NSEC for denial of existence.
    pub use_nsec3: bool,

    /// Set the NSEC3 Opt-Out flag and skip insecure delegations.
    pub opt_out: bool,

    /// NSEC3 hash iterations.
    pub iterations: u16,

    /// NSEC3 salt; a random 8 byte salt is chosen if `None`.
    pub salt: Option<Nsec3Salt<Bytes>>,

    /// Emit a ZONEMD record.
    pub digest_enabled: bool,

    /// Hash algorithm for the ZONEMD record.
    pub zonemd_algorithm: ZonemdAlgorithm,

    /// The signature algorithm keys must use.
    pub sign_algorithm: SignAlgorithm,

    /// RRSIG inception time.
    pub inception: Timestamp,

    /// RRSIG expiration time.
    pub expiration: Timestamp,

    /// TTL for synthesized records (DNSKEY, CDS, CDNSKEY, NSEC3PARAM,
    /// ZONEMD).
    pub min_ttl: Ttl,
}

impl SignConfig {
    /// Check the configuration for inconsistent option combinations.
    pub fn validate(&self) -> Result<()> {
        if self.opt_out && !self.use_nsec3 {
            return Err(Error::config("opt-out is only meaningful with NSEC3"));
        }
        if !self.use_nsec3 && (self.iterations != 0 || self.salt.is_some()) {
            return Err(Error::config(
                "NSEC3 iterations and salt require NSEC3 mode",
            ));
        }
        if self.expiration < self.inception {
            return Err(Error::config(format!(
                "signature expiration {} lies before inception {}",
                self.expiration, self.inception
            )));
        }
        Ok(())
    }

    /// The default inception time: an hour ago, rounded down to a minute.
    pub fn default_inception() -> Timestamp {
        let now = Timestamp::now().into_int();
        (now / 60 * 60 - ONE_HOUR).into()
    }

    /// The default expiration time.
    pub fn default_expiration() -> Timestamp {
        (Timestamp::now().into_int() + THREE_MONTHS).into()
    }
}

//------------ Argument parsers ----------------------------------------------
//
// These return plain string errors so that clap can wrap them.

/// Parse a domain name argument.
pub fn parse_name(arg: &str) -> core::result::Result<Name<Bytes>, String> {
    Name::from_str(&arg.to_lowercase())
        .map_err(|err| format!("invalid domain name '{arg}': {err}"))
}

/// Parse a timestamp argument.
///
/// Accepts seconds since the epoch or `YYYYMMDD[HHmmss]`. A bare eight
/// digit number is treated as a date, which mirrors what the classic zone
/// signing tools do, even though it shadows a few valid Unix timestamps.
pub fn parse_timestamp(arg: &str) -> core::result::Result<Timestamp, String> {
    let res = if arg.len() == 8 && arg.parse::<u32>().is_ok() {
        Timestamp::from_str(&format!("{arg}000000"))
    } else {
        Timestamp::from_str(arg)
    };
    res.map_err(|err| format!("invalid timestamp '{arg}': {err}"))
}

/// Parse an NSEC3 salt argument in hex representation.
pub fn parse_salt(arg: &str) -> core::result::Result<Nsec3Salt<Bytes>, String> {
    if arg.len() >= 512 {
        Err("salt too long".into())
    } else {
        Nsec3Salt::from_str(arg).map_err(|err| format!("invalid salt: {err}"))
    }
}

/// Parse a ZONEMD hash algorithm argument.
pub fn parse_zonemd_alg(arg: &str) -> core::result::Result<ZonemdAlgorithm, &'static str> {
    if let Ok(num) = arg.parse() {
        let alg = ZonemdAlgorithm::from_int(num);
        match alg {
            ZonemdAlgorithm::SHA384 | ZonemdAlgorithm::SHA512 => Ok(alg),
            _ => Err("unknown ZONEMD algorithm number"),
        }
    } else {
        ZonemdAlgorithm::from_mnemonic(arg.as_bytes())
            .ok_or("unknown ZONEMD algorithm mnemonic")
    }
}

//============ Tests =========================================================
