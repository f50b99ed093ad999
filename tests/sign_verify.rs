//! End-to-end signing and verification through the real CLI.

mod common;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use common::FakeCmd;
use domain::base::iana::Rtype;
use domain::crypto::sign::{generate, GenerateParams};
use domain::rdata::ZoneRecordData;
use domain::zonefile::inplace::Zonefile;
use zonesign::zone::SortedZone;

const ZONE: &str = "\
example.   3600 IN SOA a.example. admin.example. 17 3600 900 86400 300
example.   3600 IN NS  a.example.
a.example. 3600 IN A   192.0.2.1
b.example. 3600 IN A   192.0.2.2
";

const DELEGATED_ZONE: &str = "\
example.        3600 IN SOA a.example. admin.example. 17 3600 900 86400 300
example.        3600 IN NS  a.example.
a.example.      3600 IN A   192.0.2.1
b.example.      3600 IN A   192.0.2.2
sub.example.    3600 IN NS  ns.sub.example.
ns.sub.example. 3600 IN A   192.0.2.53
";

/// Generate a ZSK/KSK pair and write the BIND format key files.
///
/// Returns the two base paths to pass on the command line.
fn write_keys(dir: &Path, params: GenerateParams) -> (PathBuf, PathBuf) {
    let mut bases = Vec::new();
    for (flags, which) in [(256, "zsk"), (257, "ksk")] {
        let (secret, public) = generate(params.clone(), flags).unwrap();
        let base = dir.join(format!("Kexample.+{which}"));
        let base_str = base.to_string_lossy();

        let mut private = File::create(format!("{base_str}.private")).unwrap();
        write!(private, "{}", secret.display_as_bind()).unwrap();
        let mut public_file = File::create(format!("{base_str}.key")).unwrap();
        writeln!(public_file, "example. IN DNSKEY {public}").unwrap();

        bases.push(base);
    }
    (bases.remove(0), bases.remove(0))
}

fn write_zone(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("example.zone");
    std::fs::write(&path, contents).unwrap();
    path
}

fn load_signed(path: &Path) -> SortedZone {
    let mut file = File::open(path).unwrap();
    let reader = Zonefile::load(&mut file).unwrap();
    SortedZone::from_reader(reader, false).unwrap()
}

fn count_rtype(zone: &SortedZone, rtype: Rtype) -> usize {
    zone.iter().filter(|rr| rr.rtype() == rtype).count()
}

fn sign_cmd(
    zone_path: &Path,
    out_path: &Path,
    zsk: &Path,
    ksk: &Path,
    algorithm: &str,
) -> FakeCmd {
    FakeCmd::new(["zonesign", "sign", "file"]).args([
        "-z",
        "example.",
        "-f",
        &zone_path.display().to_string(),
        "-o",
        &out_path.display().to_string(),
        "--zsk",
        &zsk.display().to_string(),
        "--ksk",
        &ksk.display().to_string(),
        "-a",
        algorithm,
    ])
}

fn verify_cmd(path: &Path) -> FakeCmd {
    FakeCmd::new(["zonesign", "verify"]).args([
        "-z",
        "example.",
        "-f",
        &path.display().to_string(),
    ])
}

#[test]
fn rsa_nsec_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (zsk, ksk) = write_keys(dir.path(), GenerateParams::RsaSha256 { bits: 2048 });
    let zone_path = write_zone(dir.path(), ZONE);
    let out_path = dir.path().join("example.zone.signed");

    let res = sign_cmd(&zone_path, &out_path, &zsk, &ksk, "RSASHA256").run();
    assert_eq!(res.exit_code, 0, "signing failed");

    let signed = load_signed(&out_path);
    assert_eq!(count_rtype(&signed, Rtype::DNSKEY), 2);
    // One NSEC per owner name: example., a.example., b.example.
    assert_eq!(count_rtype(&signed, Rtype::NSEC), 3);
    // One RRSIG per RRset (SOA, NS, 2x A, 3x NSEC, DNSKEY, CDS, CDNSKEY)
    // plus the extra KSK signature over the DNSKEY RRset.
    assert_eq!(count_rtype(&signed, Rtype::RRSIG), 11);

    let res = verify_cmd(&out_path).run();
    assert_eq!(res.exit_code, 0, "verification failed: {}", res.stderr);
    assert!(res.stdout.contains("verified successfully"));
}

#[test]
fn ecdsa_nsec3_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (zsk, ksk) = write_keys(dir.path(), GenerateParams::EcdsaP256Sha256);
    let zone_path = write_zone(dir.path(), ZONE);
    let out_path = dir.path().join("example.zone.signed");

    let res = sign_cmd(&zone_path, &out_path, &zsk, &ksk, "ECDSAP256SHA256")
        .args(["-n", "-t", "0", "-s", "00"])
        .run();
    assert_eq!(res.exit_code, 0, "signing failed");

    let signed = load_signed(&out_path);
    assert_eq!(count_rtype(&signed, Rtype::NSEC3PARAM), 1);
    assert_eq!(count_rtype(&signed, Rtype::NSEC3), 3);
    assert_eq!(count_rtype(&signed, Rtype::NSEC), 0);

    // The chain must be a cycle: every next hashed owner name is the owner
    // hash of another NSEC3 in the zone.
    let owner_labels: Vec<String> = signed
        .iter()
        .filter(|rr| rr.rtype() == Rtype::NSEC3)
        .map(|rr| {
            rr.owner()
                .fmt_with_dot()
                .to_string()
                .split('.')
                .next()
                .unwrap()
                .to_string()
        })
        .collect();
    for rr in signed.iter() {
        if let ZoneRecordData::Nsec3(nsec3) = rr.data() {
            let next = nsec3.next_owner().to_string().to_lowercase();
            assert!(owner_labels.contains(&next));
        }
    }

    let res = verify_cmd(&out_path).run();
    assert_eq!(res.exit_code, 0, "verification failed: {}", res.stderr);
}

#[test]
fn nsec3_opt_out_skips_insecure_delegations() {
    let dir = tempfile::tempdir().unwrap();
    let (zsk, ksk) = write_keys(dir.path(), GenerateParams::EcdsaP256Sha256);
    let zone_path = write_zone(dir.path(), DELEGATED_ZONE);
    let out_path = dir.path().join("example.zone.signed");

    let res = sign_cmd(&zone_path, &out_path, &zsk, &ksk, "ECDSAP256SHA256")
        .args(["-n", "--opt-out", "-s", "00"])
        .run();
    assert_eq!(res.exit_code, 0, "signing failed");

    let signed = load_signed(&out_path);
    // Only example., a.example. and b.example. are represented; the
    // insecure delegation sub.example. is skipped.
    assert_eq!(count_rtype(&signed, Rtype::NSEC3), 3);
    for rr in signed.iter() {
        if let ZoneRecordData::Nsec3(nsec3) = rr.data() {
            assert!(nsec3.opt_out());
        }
    }
    // The delegation NS RRset is not signed.
    for rr in signed.iter() {
        if let ZoneRecordData::Rrsig(rrsig) = rr.data() {
            assert!(
                !(rrsig.type_covered() == Rtype::NS
                    && rr.owner().fmt_with_dot().to_string() == "sub.example."),
                "delegation NS RRset must not be signed"
            );
        }
    }

    let res = verify_cmd(&out_path).run();
    assert_eq!(res.exit_code, 0, "verification failed: {}", res.stderr);
}

#[test]
fn expired_signatures_sign_but_fail_verification() {
    let dir = tempfile::tempdir().unwrap();
    let (zsk, ksk) = write_keys(dir.path(), GenerateParams::EcdsaP256Sha256);
    let zone_path = write_zone(dir.path(), ZONE);
    let out_path = dir.path().join("example.zone.signed");

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let res = sign_cmd(&zone_path, &out_path, &zsk, &ksk, "ECDSAP256SHA256")
        .args([
            "-i",
            &(now - 2 * 31_536_000).to_string(),
            "-e",
            &(now - 31_536_000).to_string(),
        ])
        .run();
    assert_eq!(res.exit_code, 0, "signing must still succeed");

    let res = verify_cmd(&out_path).run();
    assert_eq!(res.exit_code, 1, "expired signatures must fail verification");
}

#[test]
fn zonemd_detects_post_signing_changes() {
    let dir = tempfile::tempdir().unwrap();
    let (zsk, ksk) = write_keys(dir.path(), GenerateParams::EcdsaP256Sha256);
    let zone_path = write_zone(dir.path(), ZONE);
    let out_path = dir.path().join("example.zone.signed");

    let res = sign_cmd(&zone_path, &out_path, &zsk, &ksk, "ECDSAP256SHA256")
        .args(["--zonemd"])
        .run();
    assert_eq!(res.exit_code, 0, "signing failed");

    let signed = load_signed(&out_path);
    assert_eq!(count_rtype(&signed, Rtype::ZONEMD), 1);
    for rr in signed.iter() {
        if let ZoneRecordData::Zonemd(zonemd) = rr.data() {
            // SIMPLE scheme, SHA-384.
            assert_eq!(zonemd.scheme().to_int(), 1);
            assert_eq!(zonemd.algorithm().to_int(), 1);
            assert_eq!(zonemd.digest().len(), 48);
        }
    }

    let res = verify_cmd(&out_path).run();
    assert_eq!(res.exit_code, 0, "verification failed: {}", res.stderr);

    // A record added behind the signer's back leaves all RRSIGs intact but
    // must invalidate the digest.
    let mut text = std::fs::read_to_string(&out_path).unwrap();
    text.push_str("zz.example.\t3600\tIN\tTXT\t\"sneaky\"\n");
    std::fs::write(&out_path, text).unwrap();

    let res = verify_cmd(&out_path).run();
    assert_eq!(res.exit_code, 1);
}

#[test]
fn duplicate_rdata_is_collapsed() {
    let dir = tempfile::tempdir().unwrap();
    let (zsk, ksk) = write_keys(dir.path(), GenerateParams::EcdsaP256Sha256);
    let mut contents = ZONE.to_string();
    contents.push_str("b.example. 3600 IN A 192.0.2.2\n");
    let zone_path = write_zone(dir.path(), &contents);
    let out_path = dir.path().join("example.zone.signed");

    let res = sign_cmd(&zone_path, &out_path, &zsk, &ksk, "ECDSAP256SHA256").run();
    assert_eq!(res.exit_code, 0);

    let signed = load_signed(&out_path);
    let b_records = signed
        .iter()
        .filter(|rr| {
            rr.rtype() == Rtype::A
                && rr.owner().fmt_with_dot().to_string() == "b.example."
        })
        .count();
    assert_eq!(b_records, 1);

    let res = verify_cmd(&out_path).run();
    assert_eq!(res.exit_code, 0);
}

#[test]
fn rsa_signing_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let (zsk, ksk) = write_keys(dir.path(), GenerateParams::RsaSha256 { bits: 2048 });
    let zone_path = write_zone(dir.path(), ZONE);
    let out_a = dir.path().join("a.signed");
    let out_b = dir.path().join("b.signed");

    for out in [&out_a, &out_b] {
        let res = sign_cmd(&zone_path, out, &zsk, &ksk, "RSASHA256")
            .args(["-i", "1704067200", "-e", "1893456000"])
            .run();
        assert_eq!(res.exit_code, 0);
    }

    let a = std::fs::read(&out_a).unwrap();
    let b = std::fs::read(&out_b).unwrap();
    assert_eq!(a, b, "two runs with pinned timestamps must be byte-identical");
}
