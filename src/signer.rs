//! The zone signing driver.
//!
//! Orchestrates a signing run: loading the zone, placing the DNSKEY, CDS,
//! CDNSKEY and ZONEMD records, generating the denial chain, producing an
//! RRSIG for every authoritative RRset and emitting the result in canonical
//! order.

use std::ffi::OsString;
use std::fmt::Debug;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use domain::base::iana::{Class, DigestAlgorithm, Rtype};
use domain::base::{Record, ToName, Ttl};
use domain::crypto::sign::SignRaw;
use domain::rdata::dnssec::ProtoRrsig;
use domain::rdata::{Cdnskey, Cds, Ds};
use tracing::info;

use crate::canonical;
use crate::config::SignConfig;
use crate::denial::{self, Nsec3Config};
use crate::env::Env;
use crate::error::{Context, Error, Result};
use crate::keys::SignerHandle;
use crate::zone::{SortedZone, ZoneData, ZoneName, ZoneRecord};
use crate::zonemd;

/// Sign the configured zone with the given key pair.
///
/// `zsk` signs every authoritative RRset; `ksk` additionally signs the
/// DNSKEY RRset. Both public keys are published at the apex. The signed
/// zone is written to the configured output path through a temporary file
/// that is only moved into place on success.
pub fn sign_zone<Inner: SignRaw + Debug>(
    env: &impl Env,
    config: &SignConfig,
    zsk: &SignerHandle<Inner>,
    ksk: &SignerHandle<Inner>,
) -> Result<()> {
    config.validate()?;

    let expected_alg = config.sign_algorithm.to_sec_alg();
    for key in [zsk, ksk] {
        key.check_algorithm(expected_alg)?;
        key.check_owner(&config.zone)?;
    }

    // Read the zone file, dropping any stale DNSSEC records.
    let mut zone = SortedZone::load_from_file(
        env,
        &config.zonefile_path,
        config.zone.clone(),
        true,
    )
    .with_context(|| {
        format!("loading zone file '{}'", config.zonefile_path.display())
    })?;

    let (apex, class, nsec_ttl, soa_serial) = zone.find_apex()?;
    if apex != config.zone {
        return Err(Error::parse(format!(
            "zone apex {} does not match the expected apex {}",
            apex.fmt_with_dot(),
            config.zone.fmt_with_dot()
        )));
    }
    if !zone
        .rrsets()
        .any(|rrset| rrset.owner() == &apex && rrset.rtype() == Rtype::NS)
    {
        return Err(Error::parse("zone has no NS RRset at the apex"));
    }

    // Publish the zone keys.
    let min_ttl = config.min_ttl;
    zone.extend([
        Record::new(apex.clone(), class, min_ttl, ZoneData::Dnskey(zsk.dnskey())),
        Record::new(apex.clone(), class, min_ttl, ZoneData::Dnskey(ksk.dnskey())),
    ]);

    // Publish CDS and CDNSKEY for the key signing key and report the DS
    // record the parent should carry.
    insert_child_records(&mut zone, &apex, class, min_ttl, ksk)?;

    // A stale digest from the input must never survive a signing run.
    zone.remove_all_by_rtype(&apex, Rtype::ZONEMD);
    if config.digest_enabled {
        zone.insert(zonemd::placeholder_record(&apex, class, soa_serial, min_ttl))
            .map_err(|_| Error::sign("duplicate ZONEMD placeholder"))?;
    }

    // Build the denial chain. The records inserted above are in place so
    // the type bitmaps pick them up.
    let nsec3_config = if config.use_nsec3 {
        let salt = match &config.salt {
            Some(salt) => salt.clone(),
            None => denial::random_salt(),
        };
        let nsec3_config = Nsec3Config::new(config.opt_out, config.iterations, salt);
        zone.insert(nsec3_config.param_record(&apex, class, min_ttl))
            .map_err(|_| Error::sign("duplicate NSEC3PARAM record"))?;
        Some(nsec3_config)
    } else {
        None
    };

    match &nsec3_config {
        Some(nsec3_config) => {
            let nsec3s =
                denial::generate_nsec3s(&zone, &apex, class, nsec_ttl, nsec3_config)?;
            zone.extend(nsec3s);
        }
        None => {
            let nsecs = denial::generate_nsecs(&zone, &apex, nsec_ttl);
            zone.extend(nsecs);
        }
    }

    // Sign every authoritative RRset. The apex ZONEMD is left out here; it
    // is signed once its digest is final.
    let mut scratch = Vec::new();
    let mut rrsigs = Vec::new();
    let mut cut: Option<ZoneName> = None;
    for owner_rrs in zone.owner_rrs() {
        if !owner_rrs.is_in_zone(&apex) {
            continue;
        }
        if let Some(ref cut_name) = cut {
            if owner_rrs.owner().ends_with(cut_name) {
                continue;
            }
        }
        let at_cut = owner_rrs.is_zone_cut(&apex);
        cut = at_cut.then(|| owner_rrs.owner().clone());

        for rrset in owner_rrs.rrsets() {
            // An RRSIG RR itself must not be signed, and at a delegation
            // only the DS RRset is authoritative.
            if rrset.rtype() == Rtype::RRSIG {
                continue;
            }
            if at_cut && rrset.rtype() != Rtype::DS {
                continue;
            }
            if config.digest_enabled
                && rrset.rtype() == Rtype::ZONEMD
                && rrset.owner() == &apex
            {
                continue;
            }

            rrsigs.push(sign_rrset(
                zsk,
                &apex,
                rrset.as_slice(),
                config,
                &mut scratch,
            )?);
            if rrset.rtype() == Rtype::DNSKEY {
                rrsigs.push(sign_rrset(
                    ksk,
                    &apex,
                    rrset.as_slice(),
                    config,
                    &mut scratch,
                )?);
            }
        }
    }
    let rrsig_count = rrsigs.len();
    zone.extend(rrsigs);

    // Compute and place the zone digest, then sign it. The RRSIG covers
    // the final digest, so the order here must not be reversed.
    if config.digest_enabled {
        let digest = zonemd::digest_simple(&apex, &zone, config.zonemd_algorithm)?;
        zone.remove_all_by_rtype(&apex, Rtype::ZONEMD);
        let zonemd_rr = zonemd::zonemd_record(
            &apex,
            class,
            soa_serial,
            min_ttl,
            config.zonemd_algorithm,
            digest,
        );
        let rrsig =
            sign_rrset(zsk, &apex, &[zonemd_rr.clone()], config, &mut scratch)?;
        zone.extend([zonemd_rr, rrsig]);
    }

    write_zone(env, &zone, &config.out_path)?;

    info!(
        "signed zone {} with {} RRSIGs into '{}'",
        apex.fmt_with_dot(),
        rrsig_count,
        config.out_path.display()
    );

    Ok(())
}

/// Produce the RRSIG record covering one RRset.
///
/// The records must all share owner, class, type and TTL; the RRSIG TTL
/// matches the TTL of the covered RRset per RFC 4034 section 3.
fn sign_rrset<Inner: SignRaw>(
    key: &SignerHandle<Inner>,
    apex: &ZoneName,
    rrset: &[ZoneRecord],
    config: &SignConfig,
    scratch: &mut Vec<u8>,
) -> Result<ZoneRecord> {
    let first = &rrset[0];
    let original_ttl = first.ttl();

    let rrsig = ProtoRrsig::new(
        first.rtype(),
        key.algorithm(),
        first.owner().rrsig_label_count(),
        original_ttl,
        config.expiration,
        config.inception,
        key.key_tag(),
        apex.clone(),
    );

    canonical::rrset_signing_input(&rrsig, rrset, original_ttl, scratch);

    let signature = key.raw().sign_raw(scratch).map_err(|err| {
        Error::sign(format!(
            "signing {} {} failed: {err}",
            first.owner().fmt_with_dot(),
            first.rtype()
        ))
    })?;

    let rrsig = rrsig
        .into_rrsig(Bytes::copy_from_slice(signature.as_ref()))
        .map_err(|err| Error::sign(format!("signature too long: {err}")))?;

    Ok(Record::new(
        first.owner().clone(),
        first.class(),
        original_ttl,
        ZoneData::Rrsig(rrsig),
    ))
}

/// Insert the CDS and CDNSKEY RRsets for the key signing key.
///
/// The matching DS record belongs in the parent zone, so it is only
/// reported on the log.
fn insert_child_records<Inner: SignRaw>(
    zone: &mut SortedZone,
    apex: &ZoneName,
    class: Class,
    ttl: Ttl,
    ksk: &SignerHandle<Inner>,
) -> Result<()> {
    zone.remove_all_by_rtype(apex, Rtype::CDS);
    zone.remove_all_by_rtype(apex, Rtype::CDNSKEY);

    let dnskey = ksk.dnskey();

    let cdnskey = Cdnskey::new(
        dnskey.flags(),
        dnskey.protocol(),
        dnskey.algorithm(),
        dnskey.public_key().clone(),
    )
    .map_err(|err| Error::sign(format!("bad CDNSKEY record data: {err}")))?;

    let digest = canonical::dnskey_digest(apex, &dnskey);
    let cds = Cds::new(
        ksk.key_tag(),
        dnskey.algorithm(),
        DigestAlgorithm::SHA256,
        Bytes::from(digest.clone()),
    )
    .map_err(|err| Error::sign(format!("bad CDS record data: {err}")))?;

    let ds = Ds::new(
        ksk.key_tag(),
        dnskey.algorithm(),
        DigestAlgorithm::SHA256,
        digest,
    )
    .map_err(|err| Error::sign(format!("bad DS record data: {err}")))?;
    info!(
        "DS record for the parent zone: {} {} IN DS {}",
        apex.fmt_with_dot(),
        ttl.as_secs(),
        ds
    );

    zone.extend([
        Record::new(apex.clone(), class, ttl, ZoneData::Cdnskey(cdnskey)),
        Record::new(apex.clone(), class, ttl, ZoneData::Cds(cds)),
    ]);
    Ok(())
}

//------------ Zone output ---------------------------------------------------

/// Write the signed zone.
///
/// Output goes to a temporary file next to the destination which is moved
/// into place once everything has been written, so a failed run never
/// leaves a partial zone behind. Passing `-` writes to stdout instead.
fn write_zone(env: &impl Env, zone: &SortedZone, out_path: &Path) -> Result<()> {
    if out_path.as_os_str() == "-" {
        let stream = env.stdout();
        let mut writer = &stream;
        return write_records(zone, &mut writer)
            .map_err(|err| Error::io(format!("cannot write to stdout: {err}")));
    }

    let mut tmp: OsString = env.in_cwd(&out_path).as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);

    let file = File::create(&tmp_path).map_err(|err| {
        Error::io(format!("cannot create '{}': {err}", tmp_path.display()))
    })?;
    let mut writer = BufWriter::new(file);

    let res = write_records(zone, &mut writer)
        .and_then(|()| writer.flush())
        .map_err(|err| {
            Error::io(format!("cannot write '{}': {err}", tmp_path.display()))
        })
        .and_then(|()| {
            std::fs::rename(&tmp_path, env.in_cwd(&out_path)).map_err(|err| {
                Error::io(format!(
                    "could not move '{}' to '{}': {err}",
                    tmp_path.display(),
                    out_path.display()
                ))
            })
        });

    if res.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    res
}

/// Write all records, one presentation format line each, in the canonical
/// order the zone is already sorted in.
fn write_records(zone: &SortedZone, writer: &mut impl io::Write) -> io::Result<()> {
    for record in zone.iter() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            record.owner().fmt_with_dot(),
            record.ttl().as_secs(),
            record.class(),
            record.rtype(),
            record.data()
        )?;
    }
    Ok(())
}

//============ Tests =========================================================
