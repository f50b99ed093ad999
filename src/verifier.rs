//! Verifying a signed zone.
//!
//! Re-parses a signed zone and checks every RRSIG against the DNSKEY RRset
//! at the apex, and the ZONEMD digest if one is present. Each failure is
//! reported on the log individually; the caller gets a single aggregate
//! error.

use std::path::Path;

use bytes::Bytes;
use domain::base::iana::ZonemdScheme;
use domain::base::Serial;
use domain::crypto::common::PublicKey;
use domain::rdata::dnssec::{ProtoRrsig, Timestamp};
use domain::rdata::{Dnskey, Rrsig};
use tracing::error;

use crate::canonical;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::zone::{SortedZone, ZoneData, ZoneName, ZoneRecord};
use crate::zonemd;

/// Verify the signed zone in a file.
pub fn verify_file(env: &impl Env, path: &Path, zone_name: &ZoneName) -> Result<()> {
    let zone = SortedZone::load_from_file(env, path, zone_name.clone(), false)?;
    verify_zone(&zone, zone_name)
}

/// Verify a loaded signed zone.
pub fn verify_zone(zone: &SortedZone, zone_name: &ZoneName) -> Result<()> {
    let (apex, _, _, soa_serial) = zone.find_apex()?;
    if &apex != zone_name {
        return Err(Error::verify(format!(
            "zone apex {} does not match the expected apex {}",
            apex.fmt_with_dot(),
            zone_name.fmt_with_dot()
        )));
    }

    let dnskeys: Vec<&Dnskey<Bytes>> = zone
        .iter()
        .filter(|rr| rr.owner() == &apex)
        .filter_map(|rr| match rr.data() {
            ZoneData::Dnskey(dnskey) => Some(dnskey),
            _ => None,
        })
        .collect();
    if dnskeys.is_empty() {
        return Err(Error::verify("no DNSKEY RRset at the zone apex"));
    }

    let now = Timestamp::now();
    let mut scratch = Vec::new();
    let mut failures = 0usize;

    for record in zone.iter() {
        let ZoneData::Rrsig(rrsig) = record.data() else {
            continue;
        };
        if let Err(reason) =
            check_rrsig(zone, &apex, record, rrsig, &dnskeys, now, &mut scratch)
        {
            error!(
                "RRSIG over {} {} (key tag {}): {reason}",
                record.owner().fmt_with_dot(),
                rrsig.type_covered(),
                rrsig.key_tag()
            );
            failures += 1;
        }
    }

    if let Err(reason) = check_zonemd(zone, &apex, soa_serial) {
        error!("ZONEMD at {}: {reason}", apex.fmt_with_dot());
        failures += 1;
    }

    if failures > 0 {
        return Err(Error::verify(format!(
            "{failures} record checks failed"
        )));
    }
    Ok(())
}

/// Check a single RRSIG.
#[allow(clippy::too_many_arguments)]
fn check_rrsig(
    zone: &SortedZone,
    apex: &ZoneName,
    record: &ZoneRecord,
    rrsig: &Rrsig<Bytes, ZoneName>,
    dnskeys: &[&Dnskey<Bytes>],
    now: Timestamp,
    scratch: &mut Vec<u8>,
) -> core::result::Result<(), String> {
    if rrsig.inception() > now {
        return Err(format!(
            "signature not yet valid, inception is {}",
            rrsig.inception()
        ));
    }
    if rrsig.expiration() <= now {
        return Err(format!(
            "signature expired at {}",
            rrsig.expiration()
        ));
    }
    if rrsig.signer_name() != apex {
        return Err(format!(
            "signer name {} is not the zone apex",
            rrsig.signer_name().fmt_with_dot()
        ));
    }

    let covered: Vec<ZoneRecord> = zone
        .iter()
        .filter(|rr| {
            rr.owner() == record.owner() && rr.rtype() == rrsig.type_covered()
        })
        .cloned()
        .collect();
    if covered.is_empty() {
        return Err("no RRset with the covered type at this owner".into());
    }

    let candidates: Vec<&&Dnskey<Bytes>> = dnskeys
        .iter()
        .filter(|dnskey| {
            dnskey.key_tag() == rrsig.key_tag()
                && dnskey.algorithm() == rrsig.algorithm()
        })
        .collect();
    if candidates.is_empty() {
        return Err("no DNSKEY with matching key tag and algorithm".into());
    }

    let proto = ProtoRrsig::new(
        rrsig.type_covered(),
        rrsig.algorithm(),
        rrsig.labels(),
        rrsig.original_ttl(),
        rrsig.expiration(),
        rrsig.inception(),
        rrsig.key_tag(),
        rrsig.signer_name().clone(),
    );
    canonical::rrset_signing_input(&proto, &covered, rrsig.original_ttl(), scratch);

    for dnskey in candidates {
        let Ok(public_key) = PublicKey::from_dnskey(*dnskey) else {
            continue;
        };
        if public_key
            .verify(scratch, rrsig.signature().as_ref())
            .is_ok()
        {
            return Ok(());
        }
    }
    Err("signature does not verify".into())
}

/// Check the apex ZONEMD RRset, if present.
///
/// At least one ZONEMD record must carry a supported scheme and algorithm
/// and match the recomputed digest of the zone.
fn check_zonemd(
    zone: &SortedZone,
    apex: &ZoneName,
    soa_serial: Serial,
) -> core::result::Result<(), String> {
    let zonemds: Vec<_> = zone
        .iter()
        .filter(|rr| rr.owner() == apex)
        .filter_map(|rr| match rr.data() {
            ZoneData::Zonemd(zonemd) => Some(zonemd),
            _ => None,
        })
        .collect();
    if zonemds.is_empty() {
        return Ok(());
    }

    let mut reason = String::from("no verifiable ZONEMD record");
    for zonemd in zonemds {
        if zonemd.scheme() != ZonemdScheme::SIMPLE {
            reason = format!("unsupported scheme {}", zonemd.scheme());
            continue;
        }
        if zonemd.serial() != soa_serial {
            reason = format!(
                "serial {} does not match the SOA serial {}",
                zonemd.serial(),
                soa_serial
            );
            continue;
        }
        let digest = match zonemd::digest_simple(apex, zone, zonemd.algorithm()) {
            Ok(digest) => digest,
            Err(err) => {
                reason = format!("unsupported hash algorithm: {err}");
                continue;
            }
        };
        if digest.as_slice() == zonemd.digest().as_ref() {
            return Ok(());
        }
        reason = "digest does not match the zone contents".into();
    }
    Err(reason)
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SignAlgorithm, SignConfig, DEFAULT_MIN_TTL};
    use crate::env::RealEnv;
    use crate::keys::{SignerHandle, KSK_FLAGS, ZSK_FLAGS};
    use crate::signer::sign_zone;
    use core::str::FromStr;
    use domain::base::iana::ZonemdAlgorithm;
    use domain::base::{Name, Ttl};
    use domain::crypto::sign::{generate, GenerateParams, KeyPair};
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    const ZONE: &str = "\
example.    240 IN SOA ns.example. admin.example. 1 3600 900 86400 300
example.    240 IN NS  ns.example.
ns.example. 240 IN A   192.0.2.1
a.example.  240 IN A   192.0.2.2
";

    fn test_key(flags: u16) -> SignerHandle<KeyPair> {
        let (secret, public) =
            generate(GenerateParams::EcdsaP256Sha256, flags).unwrap();
        let key_pair = KeyPair::from_bytes(&secret, &public).unwrap();
        SignerHandle::new(Name::from_str("example.").unwrap(), flags, key_pair)
    }

    fn test_config(dir: &Path, zonemd: bool) -> SignConfig {
        let zonefile_path = dir.join("example.zone");
        let mut file = File::create(&zonefile_path).unwrap();
        file.write_all(ZONE.as_bytes()).unwrap();
        SignConfig {
            zone: Name::from_str("example.").unwrap(),
            out_path: dir.join("example.zone.signed"),
            zonefile_path,
            create_keys: false,
            use_nsec3: false,
            opt_out: false,
            iterations: 0,
            salt: None,
            digest_enabled: zonemd,
            zonemd_algorithm: ZonemdAlgorithm::SHA384,
            sign_algorithm: SignAlgorithm::EcdsaP256Sha256,
            inception: SignConfig::default_inception(),
            expiration: SignConfig::default_expiration(),
            min_ttl: Ttl::from_secs(DEFAULT_MIN_TTL),
        }
    }

    fn apex() -> ZoneName {
        Name::from_str("example.").unwrap()
    }

    #[test]
    fn round_trip_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), false);
        sign_zone(&RealEnv, &config, &test_key(ZSK_FLAGS), &test_key(KSK_FLAGS))
            .unwrap();
        verify_file(&RealEnv, &config.out_path, &apex()).unwrap();
    }

    #[test]
    fn expired_signatures_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), false);
        config.inception = (Timestamp::now().into_int() - 2000).into();
        config.expiration = (Timestamp::now().into_int() - 1000).into();
        sign_zone(&RealEnv, &config, &test_key(ZSK_FLAGS), &test_key(KSK_FLAGS))
            .unwrap();
        assert!(verify_file(&RealEnv, &config.out_path, &apex()).is_err());
    }

    #[test]
    fn tampered_records_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), false);
        sign_zone(&RealEnv, &config, &test_key(ZSK_FLAGS), &test_key(KSK_FLAGS))
            .unwrap();

        let text = std::fs::read_to_string(&config.out_path).unwrap();
        let tampered = text.replace("192.0.2.2", "192.0.2.66");
        assert_ne!(text, tampered);
        std::fs::write(&config.out_path, tampered).unwrap();

        assert!(verify_file(&RealEnv, &config.out_path, &apex()).is_err());
    }

    #[test]
    fn zonemd_round_trip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), true);
        sign_zone(&RealEnv, &config, &test_key(ZSK_FLAGS), &test_key(KSK_FLAGS))
            .unwrap();
        verify_file(&RealEnv, &config.out_path, &apex()).unwrap();

        // A record sneaked in after signing keeps every RRSIG intact but
        // must break the zone digest.
        let mut text = std::fs::read_to_string(&config.out_path).unwrap();
        text.push_str("zz.example.\t240\tIN\tTXT\t\"sneaky\"\n");
        std::fs::write(&config.out_path, text).unwrap();

        let err = verify_file(&RealEnv, &config.out_path, &apex()).unwrap_err();
        assert!(err.to_string().contains("checks failed"));
    }

    #[test]
    fn unsigned_zone_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.zone");
        std::fs::write(&path, ZONE).unwrap();
        assert!(verify_file(&RealEnv, &path, &apex()).is_err());
    }

    #[test]
    fn wrong_apex_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), false);
        sign_zone(&RealEnv, &config, &test_key(ZSK_FLAGS), &test_key(KSK_FLAGS))
            .unwrap();
        let other = Name::from_str("other.").unwrap();
        assert!(verify_file(&RealEnv, &config.out_path, &other).is_err());
    }
}
