//! Signing key handles.
//!
//! A [`SignerHandle`] couples the owner name and DNSKEY flags of a zone key
//! with any implementation of the raw signing capability. File backed keys
//! use the built-in [`KeyPair`]; HSM backed keys plug in through the same
//! trait without their private material ever entering the process.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use domain::base::iana::SecurityAlgorithm;
use domain::base::name::FlattenInto;
use domain::crypto::sign::{KeyPair, SecretKeyBytes, SignRaw};
use domain::rdata::{Dnskey, ZoneRecordData};
use domain::zonefile::inplace::{Entry, Zonefile};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::zone::ZoneName;

/// DNSKEY flags of a zone signing key.
pub const ZSK_FLAGS: u16 = 256;

/// DNSKEY flags of a key signing key: zone key plus secure entry point.
pub const KSK_FLAGS: u16 = 257;

//------------ SignerHandle --------------------------------------------------

/// A signing key with its zone metadata.
#[derive(Debug)]
pub struct SignerHandle<Inner: SignRaw> {
    /// The owner of the key.
    owner: ZoneName,

    /// The flags that go into the key's DNSKEY record.
    flags: u16,

    /// The raw signing capability.
    inner: Inner,
}

impl<Inner: SignRaw> SignerHandle<Inner> {
    pub fn new(owner: ZoneName, flags: u16, inner: Inner) -> Self {
        Self {
            owner,
            flags,
            inner,
        }
    }

    pub fn owner(&self) -> &ZoneName {
        &self.owner
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Whether the secure entry point bit is set.
    pub fn is_ksk(&self) -> bool {
        self.flags & 0x0001 != 0
    }

    pub fn algorithm(&self) -> SecurityAlgorithm {
        self.inner.algorithm()
    }

    /// The DNSKEY record data for this key.
    pub fn dnskey(&self) -> Dnskey<Bytes> {
        let key = self.inner.dnskey();
        Dnskey::new(
            self.flags,
            3,
            key.algorithm(),
            Bytes::from(key.public_key().clone()),
        )
        .expect("long public key")
    }

    /// The key tag of this key's DNSKEY.
    pub fn key_tag(&self) -> u16 {
        self.dnskey().key_tag()
    }

    /// The raw signing capability.
    pub fn raw(&self) -> &Inner {
        &self.inner
    }

    /// Check that the key matches the algorithm the run was configured for.
    pub fn check_algorithm(&self, expected: SecurityAlgorithm) -> Result<()> {
        if self.algorithm() != expected {
            return Err(Error::sign(format!(
                "key {} uses algorithm {} but the zone is to be signed with {}",
                self.owner.fmt_with_dot(),
                self.algorithm(),
                expected
            )));
        }
        Ok(())
    }

    /// Check that the key belongs to the given zone.
    pub fn check_owner(&self, apex: &ZoneName) -> Result<()> {
        if &self.owner != apex {
            return Err(Error::key(format!(
                "key owner {} does not match the zone apex {}",
                self.owner.fmt_with_dot(),
                apex.fmt_with_dot()
            )));
        }
        Ok(())
    }
}

//------------ File backed keys ----------------------------------------------

/// Load a key pair from a BIND style pair of key files.
///
/// Expects a path that is the common prefix of a pair of '.key' (public)
/// and '.private' key files, i.e. given /path/to/K<name>+<alg>+<tag> loads
///
///   - /path/to/K<name>+<alg>+<tag>.key
///   - /path/to/K<name>+<alg>+<tag>.private
///
/// The private file must be in the conventional "Private-key-format: v1.3"
/// text format, the public file a DNSKEY record in zone file format.
pub fn load_key_pair(env: &impl Env, key_path: &Path) -> Result<SignerHandle<KeyPair>> {
    let key_path_str = key_path.to_string_lossy();
    let public_key_path = PathBuf::from(format!("{key_path_str}.key"));
    let private_key_path = PathBuf::from(format!("{key_path_str}.private"));

    let private_data =
        std::fs::read_to_string(env.in_cwd(&private_key_path)).map_err(|err| {
            Error::key(format!(
                "unable to load private key from file '{}': {err}",
                private_key_path.display()
            ))
        })?;

    let public_data = std::fs::read_to_string(env.in_cwd(&public_key_path)).map_err(|err| {
        Error::key(format!(
            "unable to load public key from file '{}': {err}",
            public_key_path.display()
        ))
    })?;

    let secret_key = SecretKeyBytes::parse_from_bind(&private_data).map_err(|err| {
        Error::key(format!(
            "unable to parse BIND formatted private key file '{}': {err}",
            private_key_path.display()
        ))
    })?;

    let (owner, dnskey) = parse_dnskey_file(&public_data).map_err(|err| {
        err.context(&format!(
            "parsing BIND formatted public key file '{}'",
            public_key_path.display()
        ))
    })?;

    let key_pair = KeyPair::from_bytes(&secret_key, &dnskey).map_err(|err| {
        Error::key(format!(
            "unable to import private key from file '{}': {err}",
            private_key_path.display()
        ))
    })?;

    Ok(SignerHandle::new(owner, dnskey.flags(), key_pair))
}

/// Parse the DNSKEY record out of a public key file.
///
/// Public key files usually carry no TTL, which the zone file scanner
/// otherwise insists on, so a throwaway $TTL is prepended.
fn parse_dnskey_file(data: &str) -> Result<(ZoneName, Dnskey<Bytes>)> {
    let mut text = String::from("$TTL 3600\n");
    text.push_str(data);
    if !text.ends_with('\n') {
        text.push('\n');
    }
    let reader = Zonefile::from(text.as_str());
    for entry in reader {
        let entry = entry.map_err(|err| Error::key(format!("bad entry: {err}")))?;
        let Entry::Record(record) = entry else {
            continue;
        };
        let record: crate::zone::ZoneRecord = record.flatten_into();
        if let ZoneRecordData::Dnskey(dnskey) = record.data() {
            return Ok((record.owner().clone(), dnskey.clone()));
        }
    }
    Err(Error::key("no DNSKEY record found in public key file"))
}

//============ Tests =========================================================
