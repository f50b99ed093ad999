//! Whole zone digests per RFC 8976.

use bytes::Bytes;
use domain::base::iana::{Class, Rtype, ZonemdAlgorithm, ZonemdScheme};
use domain::base::{Record, Serial, Ttl};
use domain::rdata::Zonemd;
use octseq::builder::with_infallible;
use ring::digest;

use crate::error::{Error, Result};
use crate::zone::{SortedZone, ZoneData, ZoneName, ZoneRecord};

/// The placeholder ZONEMD inserted at the apex before signing.
///
/// It exists so that the apex NSEC/NSEC3 bitmap and the apex RRSIGs account
/// for the ZONEMD type; scheme, algorithm and digest are zeroed out and
/// replaced once the digest over the signed zone has been computed.
pub fn placeholder_record(
    apex: &ZoneName,
    class: Class,
    serial: Serial,
    ttl: Ttl,
) -> ZoneRecord {
    Record::new(
        apex.clone(),
        class,
        ttl,
        ZoneData::Zonemd(Zonemd::new(
            serial,
            ZonemdScheme::from_int(0),
            ZonemdAlgorithm::from_int(0),
            Bytes::default(),
        )),
    )
}

/// The final ZONEMD record carrying the computed digest.
pub fn zonemd_record(
    apex: &ZoneName,
    class: Class,
    serial: Serial,
    ttl: Ttl,
    algorithm: ZonemdAlgorithm,
    digest: Vec<u8>,
) -> ZoneRecord {
    Record::new(
        apex.clone(),
        class,
        ttl,
        ZoneData::Zonemd(Zonemd::new(
            serial,
            ZonemdScheme::SIMPLE,
            algorithm,
            Bytes::from(digest),
        )),
    )
}

/// Compute the zone digest for the SIMPLE scheme.
///
/// Per RFC 8976 section 3.3.1 the records are processed in DNSSEC canonical
/// on-the-wire form and order, with RRsets of one owner ordered by record
/// type. All records are included, even glue and occluded data, except the
/// apex ZONEMD RRset itself and the RRSIG covering it.
pub fn digest_simple(
    apex: &ZoneName,
    zone: &SortedZone,
    algorithm: ZonemdAlgorithm,
) -> Result<Vec<u8>> {
    let mut ctx = match algorithm {
        ZonemdAlgorithm::SHA384 => digest::Context::new(&digest::SHA384),
        ZonemdAlgorithm::SHA512 => digest::Context::new(&digest::SHA512),
        _ => {
            // Caught by the argument parsing, but in case.
            return Err(Error::config("unsupported ZONEMD hash algorithm"));
        }
    };

    let mut buf: Vec<u8> = Vec::new();
    for record in zone.iter() {
        if !record.owner().ends_with(apex) {
            continue;
        }
        if record.owner() == apex {
            if record.rtype() == Rtype::ZONEMD {
                continue;
            }
            if let ZoneData::Rrsig(rrsig) = record.data() {
                if rrsig.type_covered() == Rtype::ZONEMD {
                    continue;
                }
            }
        }

        buf.clear();
        with_infallible(|| record.compose_canonical(&mut buf));
        ctx.update(&buf);
    }

    Ok(ctx.finish().as_ref().to_vec())
}

//============ Tests =========================================================
