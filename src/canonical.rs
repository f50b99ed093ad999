//! Canonical wire images used as signing and digest input.

use domain::base::rdata::ComposeRecordData;
use domain::base::{CanonicalOrd, Record, ToName, Ttl};
use domain::rdata::dnssec::ProtoRrsig;
use domain::rdata::Dnskey;
use octseq::builder::with_infallible;
use ring::digest;

use crate::zone::{ZoneName, ZoneRecord};

/// Build the canonical signing input for one RRset.
///
/// This is the byte sequence an RRSIG signature is computed over per RFC
/// 4034 section 3.1.8.1: the RRSIG rdata without the signature field,
/// followed by every RR of the covered RRset in canonical form. Each RR is
/// rewritten to the original TTL from the RRSIG and the set is ordered by
/// its canonical rdata.
pub fn rrset_signing_input(
    rrsig: &ProtoRrsig<ZoneName>,
    rrset: &[ZoneRecord],
    original_ttl: Ttl,
    buf: &mut Vec<u8>,
) {
    buf.clear();
    with_infallible(|| rrsig.compose_canonical(buf));

    let mut records: Vec<ZoneRecord> = rrset
        .iter()
        .map(|rr| {
            Record::new(
                rr.owner().clone(),
                rr.class(),
                original_ttl,
                rr.data().clone(),
            )
        })
        .collect();
    records.sort_by(|a, b| a.data().canonical_cmp(b.data()));
    records.dedup_by(|a, b| a.data().canonical_cmp(b.data()).is_eq());

    for record in &records {
        with_infallible(|| record.compose_canonical(buf));
    }
}

/// Compute the SHA-256 digest of a DNSKEY as used in DS and CDS records.
///
/// The digest input is the canonical owner name followed by the canonical
/// DNSKEY rdata, per RFC 4034 section 5.1.4.
pub fn dnskey_digest(owner: &ZoneName, dnskey: &Dnskey<impl AsRef<[u8]>>) -> Vec<u8> {
    let mut buf = Vec::new();
    with_infallible(|| owner.compose_canonical(&mut buf));
    with_infallible(|| dnskey.compose_canonical_rdata(&mut buf));
    digest::digest(&digest::SHA256, &buf).as_ref().to_vec()
}

//============ Tests =========================================================
