//! Loading a zone file into canonically sorted records.

use std::cmp::{min, Ordering};
use std::fs::File;
use std::path::Path;

use bytes::Bytes;
use domain::base::iana::Class;
use domain::base::name::FlattenInto;
use domain::base::{CanonicalOrd, Name, Record, Rtype, Serial, Ttl};
use domain::rdata::ZoneRecordData;
use domain::zonefile::inplace::{self, Entry};
use rayon::slice::ParallelSliceMut;
use tracing::warn;

use crate::env::Env;
use crate::error::{Error, Result};

//------------ Type aliases --------------------------------------------------

/// An absolute owner name as stored in a loaded zone.
pub type ZoneName = Name<Bytes>;

/// The record data of a stored record.
pub type ZoneData = ZoneRecordData<Bytes, ZoneName>;

/// A record of a loaded zone.
pub type ZoneRecord = Record<ZoneName, ZoneData>;

//------------ SortedZone ----------------------------------------------------

/// The records of a zone in DNSSEC canonical order.
///
/// Records are kept sorted by owner name in canonical order, then class and
/// record type, then canonical record data. Exact duplicates are dropped on
/// construction and insertion. All records of an RRset carry the same TTL;
/// conflicting TTLs are rewritten to the minimum observed value.
#[derive(Clone, Debug, Default)]
pub struct SortedZone {
    records: Vec<ZoneRecord>,
}

impl SortedZone {
    /// Load a zone from a file in RFC 1035 master file format.
    ///
    /// Relative names are made absolute using `origin`. When `strip_dnssec`
    /// is set, RRSIG, NSEC, NSEC3 and NSEC3PARAM records found in the input
    /// are dropped so that a previously signed zone can be signed afresh.
    pub fn load_from_file(
        env: &impl Env,
        path: &Path,
        origin: ZoneName,
        strip_dnssec: bool,
    ) -> Result<Self> {
        let mut zone_file = File::open(env.in_cwd(&path)).map_err(|err| {
            Error::io(format!("cannot open zone file '{}': {err}", path.display()))
        })?;
        let mut reader = inplace::Zonefile::load(&mut zone_file).map_err(|err| {
            Error::io(format!("cannot read zone file '{}': {err}", path.display()))
        })?;
        reader.set_origin(origin);
        Self::from_reader(reader, strip_dnssec)
    }

    /// Build a zone from parsed zone file entries.
    pub fn from_reader(reader: inplace::Zonefile, strip_dnssec: bool) -> Result<Self> {
        let mut records = Vec::new();
        for entry in reader {
            let entry =
                entry.map_err(|err| Error::parse(format!("invalid zone file: {err}")))?;
            match entry {
                Entry::Record(record) => {
                    let record: ZoneRecord = record.flatten_into();
                    if strip_dnssec
                        && matches!(
                            record.rtype(),
                            Rtype::RRSIG | Rtype::NSEC | Rtype::NSEC3 | Rtype::NSEC3PARAM
                        )
                    {
                        continue;
                    }
                    records.push(record);
                }
                Entry::Include { .. } => {
                    return Err(Error::parse(
                        "invalid zone file: $INCLUDE directive is not supported",
                    ));
                }
            }
        }
        Ok(Self::from_vec(records))
    }

    /// Build a sorted zone from loose records.
    ///
    /// Sorts into canonical order, reconciles TTLs per RRset and drops
    /// exact duplicates.
    pub fn from_vec(mut records: Vec<ZoneRecord>) -> Self {
        records.par_sort_unstable_by(CanonicalOrd::canonical_cmp);

        // All records of an RRset must share a TTL. Rewrite to the minimum
        // observed value, with a warning, before duplicates are dropped so
        // that records differing only in TTL collapse into one.
        let mut start = 0;
        while start < records.len() {
            let mut end = start + 1;
            while end < records.len() && same_rrset(&records[start], &records[end]) {
                end += 1;
            }
            let run = &records[start..end];
            let min_ttl = run.iter().map(|rr| rr.ttl()).min().unwrap();
            if run.iter().any(|rr| rr.ttl() != min_ttl) {
                warn!(
                    "TTL mismatch in RRset {} {}, using minimum {}",
                    records[start].owner().fmt_with_dot(),
                    records[start].rtype(),
                    min_ttl.as_secs()
                );
                for rr in &mut records[start..end] {
                    rr.set_ttl(min_ttl);
                }
            }
            start = end;
        }

        records.dedup_by(|a, b| a.canonical_cmp(b) == Ordering::Equal);

        Self { records }
    }

    /// Insert a single record, keeping canonical order.
    ///
    /// Returns the record itself if an exact duplicate is already present.
    pub fn insert(&mut self, record: ZoneRecord) -> core::result::Result<(), ZoneRecord> {
        let idx = self
            .records
            .binary_search_by(|stored| stored.canonical_cmp(&record));
        match idx {
            Ok(_) => Err(record),
            Err(idx) => {
                self.records.insert(idx, record);
                Ok(())
            }
        }
    }

    /// Insert many records, silently skipping exact duplicates.
    pub fn extend(&mut self, records: impl IntoIterator<Item = ZoneRecord>) {
        for record in records {
            let _ = self.insert(record);
        }
    }

    /// Remove all records with the given owner and record type.
    ///
    /// Returns the number of records removed.
    pub fn remove_all_by_rtype(&mut self, owner: &ZoneName, rtype: Rtype) -> usize {
        let before = self.records.len();
        self.records
            .retain(|rr| !(rr.rtype() == rtype && rr.owner() == owner));
        before - self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ZoneRecord> {
        self.records.iter()
    }

    pub fn as_slice(&self) -> &[ZoneRecord] {
        &self.records
    }

    /// Iterate over all records grouped by owner name.
    pub fn owner_rrs(&self) -> OwnerRrsIter<'_> {
        OwnerRrsIter {
            slice: &self.records,
        }
    }

    /// Iterate over all RRsets.
    pub fn rrsets(&self) -> RrsetIter<'_> {
        RrsetIter {
            slice: &self.records,
        }
    }

    /// Find the SOA RRset.
    pub fn find_soa(&self) -> Option<Rrset<'_>> {
        self.rrsets().find(|rrset| rrset.rtype() == Rtype::SOA)
    }

    /// Locate the zone apex.
    ///
    /// Returns the apex owner name, the zone class, the TTL to use for
    /// NSEC and NSEC3 records per RFC 9077 and the SOA serial. Fails if
    /// there is no SOA RRset or if it holds more than one record.
    pub fn find_apex(&self) -> Result<(ZoneName, Class, Ttl, Serial)> {
        let soa = self
            .find_soa()
            .ok_or_else(|| Error::parse("invalid zone file: cannot find SOA record"))?;
        if soa.len() > 1 {
            return Err(Error::parse(
                "invalid zone file: more than one SOA record at the apex",
            ));
        }
        let soa_rr = soa.first();
        let ZoneData::Soa(soa_data) = soa_rr.data() else {
            unreachable!();
        };

        // RFC 9077 updated RFC 4034 (NSEC) and RFC 5155 (NSEC3) to say that
        // the "TTL of the NSEC(3) RR that is returned MUST be the lesser of
        // the MINIMUM field of the SOA record and the TTL of the SOA itself".
        let ttl = min(soa_data.minimum(), soa_rr.ttl());

        Ok((
            soa_rr.owner().clone(),
            soa_rr.class(),
            ttl,
            soa_data.serial(),
        ))
    }
}

impl From<Vec<ZoneRecord>> for SortedZone {
    fn from(records: Vec<ZoneRecord>) -> Self {
        Self::from_vec(records)
    }
}

impl FromIterator<ZoneRecord> for SortedZone {
    fn from_iter<T: IntoIterator<Item = ZoneRecord>>(iter: T) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

fn same_rrset(a: &ZoneRecord, b: &ZoneRecord) -> bool {
    a.owner() == b.owner() && a.class() == b.class() && a.rtype() == b.rtype()
}

//------------ Rrset ---------------------------------------------------------

/// A view of the records sharing owner, class and record type.
#[derive(Clone, Debug)]
pub struct Rrset<'a> {
    records: &'a [ZoneRecord],
}

impl<'a> Rrset<'a> {
    /// Create an RRset view over a non-empty run of records.
    pub fn new(records: &'a [ZoneRecord]) -> Option<Self> {
        if records.is_empty() {
            None
        } else {
            Some(Self { records })
        }
    }

    pub fn owner(&self) -> &'a ZoneName {
        self.records[0].owner()
    }

    pub fn class(&self) -> Class {
        self.records[0].class()
    }

    pub fn rtype(&self) -> Rtype {
        self.records[0].rtype()
    }

    pub fn ttl(&self) -> Ttl {
        self.records[0].ttl()
    }

    pub fn first(&self) -> &'a ZoneRecord {
        &self.records[0]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'a, ZoneRecord> {
        self.records.iter()
    }

    pub fn as_slice(&self) -> &'a [ZoneRecord] {
        self.records
    }
}

//------------ OwnerRrs ------------------------------------------------------

/// A view of all records at one owner name.
#[derive(Clone, Debug)]
pub struct OwnerRrs<'a> {
    records: &'a [ZoneRecord],
}

impl<'a> OwnerRrs<'a> {
    pub fn owner(&self) -> &'a ZoneName {
        self.records[0].owner()
    }

    pub fn class(&self) -> Class {
        self.records[0].class()
    }

    pub fn records(&self) -> std::slice::Iter<'a, ZoneRecord> {
        self.records.iter()
    }

    pub fn rrsets(&self) -> RrsetIter<'a> {
        RrsetIter {
            slice: self.records,
        }
    }

    /// Whether this owner is the parent side of a zone cut.
    pub fn is_zone_cut(&self, apex: &ZoneName) -> bool {
        self.owner() != apex
            && self
                .records()
                .any(|record| record.rtype() == Rtype::NS)
    }

    /// Whether this owner name lies at or below the apex.
    pub fn is_in_zone(&self, apex: &ZoneName) -> bool {
        self.owner().ends_with(apex)
    }
}

//------------ Iterators -----------------------------------------------------

/// An iterator over the owner name groups of a sorted zone.
#[derive(Clone, Debug)]
pub struct OwnerRrsIter<'a> {
    slice: &'a [ZoneRecord],
}

impl<'a> Iterator for OwnerRrsIter<'a> {
    type Item = OwnerRrs<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.slice.first()?;
        let mut end = 1;
        while let Some(rr) = self.slice.get(end) {
            if rr.owner() != first.owner() {
                break;
            }
            end += 1;
        }
        let (head, tail) = self.slice.split_at(end);
        self.slice = tail;
        Some(OwnerRrs { records: head })
    }
}

/// An iterator over the RRsets of a sorted zone.
#[derive(Clone, Debug)]
pub struct RrsetIter<'a> {
    slice: &'a [ZoneRecord],
}

impl<'a> Iterator for RrsetIter<'a> {
    type Item = Rrset<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.slice.first()?;
        let mut end = 1;
        while let Some(rr) = self.slice.get(end) {
            if !same_rrset(first, rr) {
                break;
            }
            end += 1;
        }
        let (head, tail) = self.slice.split_at(end);
        self.slice = tail;
        Some(Rrset { records: head })
    }
}

//============ Test support ==================================================


//============ Tests =========================================================
