//! Authenticated denial of existence chains.
//!
//! Builds the NSEC (RFC 4034) or NSEC3 (RFC 5155) records covering every
//! authoritative owner name of a zone. The records that will accompany the
//! chain (DNSKEY, NSEC3PARAM, a ZONEMD placeholder) are expected to already
//! be present in the zone so that the type bitmaps simply reflect what is
//! there.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use domain::base::iana::{Class, Nsec3HashAlgorithm, Rtype};
use domain::base::name::NameBuilder;
use domain::base::{Record, Ttl};
use domain::dnssec::common::nsec3_hash;
use domain::rdata::dnssec::{RtypeBitmap, RtypeBitmapBuilder};
use domain::rdata::nsec3::{Nsec3Salt, OwnerHash};
use domain::rdata::{Nsec, Nsec3, Nsec3param};
use domain::utils::base32;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Error, Result};
use crate::zone::{OwnerRrs, SortedZone, ZoneData, ZoneName, ZoneRecord};

/// The NSEC3 Opt-Out flag bit.
const OPT_OUT_FLAG: u8 = 0x01;

//------------ Nsec3Config ---------------------------------------------------

/// Parameters of an NSEC3 chain.
#[derive(Clone, Debug)]
pub struct Nsec3Config {
    pub algorithm: Nsec3HashAlgorithm,
    pub opt_out: bool,
    pub iterations: u16,
    pub salt: Nsec3Salt<Bytes>,
}

impl Nsec3Config {
    pub fn new(opt_out: bool, iterations: u16, salt: Nsec3Salt<Bytes>) -> Self {
        Self {
            algorithm: Nsec3HashAlgorithm::SHA1,
            opt_out,
            iterations,
            salt,
        }
    }

    fn flags(&self) -> u8 {
        if self.opt_out {
            OPT_OUT_FLAG
        } else {
            0
        }
    }

    /// The NSEC3PARAM record to publish at the apex.
    ///
    /// The flags field of NSEC3PARAM is always zero; Opt-Out only appears
    /// in the NSEC3 records themselves.
    pub fn param_record(&self, apex: &ZoneName, class: Class, ttl: Ttl) -> ZoneRecord {
        Record::new(
            apex.clone(),
            class,
            ttl,
            ZoneData::Nsec3param(Nsec3param::new(
                self.algorithm,
                0,
                self.iterations,
                self.salt.clone(),
            )),
        )
    }
}

/// Pick a random 8 byte NSEC3 salt.
pub fn random_salt() -> Nsec3Salt<Bytes> {
    let mut salt = [0u8; 8];
    SystemRandom::new()
        .fill(&mut salt)
        .expect("system random source failed");
    Nsec3Salt::from_octets(Bytes::copy_from_slice(&salt))
        .expect("8 bytes is a valid salt")
}

//------------ NSEC generation -----------------------------------------------

/// Generate the NSEC chain for a zone.
///
/// One NSEC per authoritative owner name, each pointing at the next owner
/// in canonical order with the last one wrapping back to the apex. Glue and
/// anything below a zone cut is skipped.
pub fn generate_nsecs(zone: &SortedZone, apex: &ZoneName, ttl: Ttl) -> Vec<ZoneRecord> {
    let mut res = Vec::new();

    // The owner name of a zone cut if we currently are at or below one.
    let mut cut: Option<ZoneName> = None;

    // Because of the next name field, we keep the last bitmap around until
    // the following owner is known.
    let mut prev: Option<(ZoneName, Class, RtypeBitmap<Bytes>)> = None;

    for owner_rrs in zone.owner_rrs() {
        if !owner_rrs.is_in_zone(apex) {
            continue;
        }
        if let Some(ref cut_name) = cut {
            if owner_rrs.owner().ends_with(cut_name) {
                continue;
            }
        }

        let name = owner_rrs.owner().clone();
        let at_cut = owner_rrs.is_zone_cut(apex);
        cut = at_cut.then(|| name.clone());

        if let Some((prev_name, class, bitmap)) = prev.take() {
            res.push(Record::new(
                prev_name,
                class,
                ttl,
                ZoneData::Nsec(Nsec::new(name.clone(), bitmap)),
            ));
        }

        let mut bitmap = RtypeBitmap::<Bytes>::builder();

        // RFC 4035 section 2.3: the bitmap of every NSEC must indicate the
        // presence of the NSEC itself and its RRSIG.
        bitmap.add(Rtype::RRSIG).unwrap();
        bitmap.add(Rtype::NSEC).unwrap();
        add_owner_types(&mut bitmap, &owner_rrs, at_cut);

        prev = Some((name, owner_rrs.class(), bitmap.finalize()));
    }

    if let Some((prev_name, class, bitmap)) = prev {
        res.push(Record::new(
            prev_name,
            class,
            ttl,
            ZoneData::Nsec(Nsec::new(apex.clone(), bitmap)),
        ));
    }

    res
}

//------------ NSEC3 generation ----------------------------------------------

/// Generate the NSEC3 chain for a zone.
///
/// Hashes every authoritative owner name (and every empty non-terminal
/// between an owner and the apex), sorts the hashes and links each NSEC3 to
/// the following hash, the last wrapping to the first. Under Opt-Out,
/// insecure delegations are left out of the chain entirely.
pub fn generate_nsec3s(
    zone: &SortedZone,
    apex: &ZoneName,
    class: Class,
    ttl: Ttl,
    config: &Nsec3Config,
) -> Result<Vec<ZoneRecord>> {
    // Hashed owner name to (original name, bitmap), ordered by hash. The
    // base32hex alphabet preserves the order of the raw hashes, so hash
    // order and canonical owner order of the NSEC3 records agree.
    let mut chain: BTreeMap<Vec<u8>, (ZoneName, RtypeBitmap<Bytes>)> = BTreeMap::new();

    // Names already covered, for empty non-terminal discovery.
    let mut seen: Vec<ZoneName> = Vec::new();

    let mut cut: Option<ZoneName> = None;

    for owner_rrs in zone.owner_rrs() {
        if !owner_rrs.is_in_zone(apex) {
            continue;
        }
        if let Some(ref cut_name) = cut {
            if owner_rrs.owner().ends_with(cut_name) {
                continue;
            }
        }

        let name = owner_rrs.owner().clone();
        let at_cut = owner_rrs.is_zone_cut(apex);
        if at_cut {
            cut = Some(name.clone());
        } else {
            cut = None;
        }

        let has_ds = owner_rrs
            .records()
            .any(|record| record.rtype() == Rtype::DS);

        // RFC 5155 section 7.1 step 2: under Opt-Out, owner names of
        // insecure delegations are excluded from the chain.
        if config.opt_out && at_cut && !has_ds {
            continue;
        }

        let mut bitmap = RtypeBitmap::<Bytes>::builder();

        // The NSEC3 type itself never appears in the bitmap. RRSIG only
        // covers authoritative data, so a delegation without a DS gets no
        // RRSIG bit.
        if !at_cut || has_ds {
            bitmap.add(Rtype::RRSIG).unwrap();
        }
        add_owner_types(&mut bitmap, &owner_rrs, at_cut);

        insert_hashed(&mut chain, &name, apex, config, bitmap.finalize())?;

        if &name == apex {
            seen.push(name);
            continue;
        }

        // RFC 5155 section 7.1 step 4: add NSEC3 RRs for every empty
        // non-terminal between the apex and the original owner name.
        for suffix in name.iter_suffixes() {
            if suffix == name {
                continue;
            }
            if &suffix == apex {
                break;
            }
            if seen.iter().any(|n| *n == suffix) {
                // The ancestors of a known name are known as well.
                break;
            }
            seen.push(suffix.clone());
            let empty = RtypeBitmap::<Bytes>::builder().finalize();
            insert_hashed(&mut chain, &suffix, apex, config, empty)?;
        }
        seen.push(name);
    }

    // Walking the sorted zone visits each real owner name at most once, so
    // a duplicate hash means two distinct names collided.
    // (Empty non-terminal re-insertion is prevented by the seen list.)

    // Link every NSEC3 to the hash that follows it, wrapping around.
    let hashes: Vec<Vec<u8>> = chain.keys().cloned().collect();
    let mut res = Vec::with_capacity(hashes.len());
    for (idx, (hash, (_, bitmap))) in chain.iter().enumerate() {
        let next = &hashes[(idx + 1) % hashes.len()];
        let owner = hashed_owner_name(hash, apex)?;
        let next_owner = OwnerHash::from_octets(Bytes::copy_from_slice(next))
            .map_err(|err| Error::sign(format!("invalid NSEC3 owner hash: {err}")))?;
        let salt = config.salt.clone();
        res.push(Record::new(
            owner,
            class,
            ttl,
            ZoneData::Nsec3(Nsec3::new(
                config.algorithm,
                config.flags(),
                config.iterations,
                salt,
                next_owner,
                bitmap.clone(),
            )),
        ));
    }

    Ok(res)
}

/// Hash a name and file it into the chain.
fn insert_hashed(
    chain: &mut BTreeMap<Vec<u8>, (ZoneName, RtypeBitmap<Bytes>)>,
    name: &ZoneName,
    apex: &ZoneName,
    config: &Nsec3Config,
    bitmap: RtypeBitmap<Bytes>,
) -> Result<()> {
    let hash = nsec3_hash::<_, _, Vec<u8>>(
        name,
        config.algorithm,
        config.iterations,
        &config.salt,
    )
    .map_err(|err| Error::sign(format!("NSEC3 hashing failed: {err}")))?;

    if let Some((existing, _)) = chain.get(hash.as_slice()) {
        if existing != name {
            return Err(Error::sign(format!(
                "NSEC3 hash collision between {} and {}",
                existing.fmt_with_dot(),
                name.fmt_with_dot()
            )));
        }
        return Ok(());
    }
    chain.insert(hash.as_slice().to_vec(), (name.clone(), bitmap));
    Ok(())
}

/// The owner name of the NSEC3 covering the given hash.
fn hashed_owner_name(hash: &[u8], apex: &ZoneName) -> Result<ZoneName> {
    let label = base32::encode_string_hex(hash).to_lowercase();
    let mut builder = NameBuilder::new_bytes();
    builder
        .append_chars(label.chars())
        .map_err(|err| Error::sign(format!("invalid NSEC3 owner label: {err}")))?;
    builder
        .append_origin(apex)
        .map_err(|err| Error::sign(format!("invalid NSEC3 owner name: {err}")))
}

/// Add the record types present at an owner to a bitmap.
///
/// At a zone cut only the NS and DS types are represented; everything else
/// at that name belongs to the child zone.
fn add_owner_types(
    bitmap: &mut RtypeBitmapBuilder<BytesMut>,
    owner_rrs: &OwnerRrs<'_>,
    at_cut: bool,
) {
    for rrset in owner_rrs.rrsets() {
        if !at_cut || matches!(rrset.rtype(), Rtype::NS | Rtype::DS) {
            bitmap.add(rrset.rtype()).unwrap();
        }
    }
}

//============ Tests =========================================================
