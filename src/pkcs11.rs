//! PKCS#11 hardware security module support.
//!
//! The signer keys live on the token as two key pairs labelled
//! `dHSM-signer` whose `CKA_ID` is the literal `zsk` or `ksk`. Private key
//! material never leaves the device; signing goes through `C_Sign` with
//! `CKM_SHA256_RSA_PKCS` or `CKM_ECDSA_SHA256`. Key validity is expressed
//! through `CKA_START_DATE` and `CKA_END_DATE` as CK_DATE structures.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::{AuthPin, Date};
use domain::base::iana::SecurityAlgorithm;
use domain::crypto::common::rsa_encode;
use domain::crypto::sign::{SignError, SignRaw, Signature};
use domain::rdata::Dnskey;
use jiff::civil;
use jiff::{Span, Zoned};
use tracing::info;

use crate::error::{Error, Result};
use crate::keys::{SignerHandle, KSK_FLAGS, ZSK_FLAGS};
use crate::zone::ZoneName;

/// The label all signer key objects carry.
pub const KEY_LABEL: &[u8] = b"dHSM-signer";

/// The CKA_ID of the zone signing key pair.
pub const ZSK_ID: &[u8] = b"zsk";

/// The CKA_ID of the key signing key pair.
pub const KSK_ID: &[u8] = b"ksk";

/// DER encoded OID of the P-256 curve, for CKA_EC_PARAMS.
const P256_EC_PARAMS: &[u8] = &[
    0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07,
];

/// Guards against concurrent signing runs in the same process.
///
/// The PKCS#11 library is process wide state bracketed by Initialize and
/// Finalize, so only one module may be open at a time.
static MODULE_IN_USE: AtomicBool = AtomicBool::new(false);

//------------ HsmModule -----------------------------------------------------

/// A scoped handle on the loaded PKCS#11 module.
///
/// Dropping the handle finalizes the module and releases the process wide
/// guard, on every exit path.
pub struct HsmModule {
    ctx: Pkcs11,
}

impl HsmModule {
    /// Load and initialize the PKCS#11 module at the given path.
    pub fn open(lib_path: &Path) -> Result<Self> {
        if MODULE_IN_USE.swap(true, Ordering::SeqCst) {
            return Err(Error::hsm(
                "another signing run is already using the PKCS#11 module",
            ));
        }
        match Self::init(lib_path) {
            Ok(ctx) => Ok(Self { ctx }),
            Err(err) => {
                MODULE_IN_USE.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn init(lib_path: &Path) -> Result<Pkcs11> {
        let ctx = Pkcs11::new(lib_path).map_err(|err| {
            Error::hsm(format!(
                "cannot load PKCS#11 module '{}': {err}",
                lib_path.display()
            ))
        })?;
        ctx.initialize(CInitializeArgs::OsThreads)?;
        Ok(ctx)
    }

    /// Open a read-write session on the token with the given label and log
    /// in as the user.
    pub fn login(&self, token_label: &str, pin: &str) -> Result<Session> {
        for slot in self.ctx.get_slots_with_token()? {
            let token = self.ctx.get_token_info(slot)?;
            if token.label().trim_end() != token_label {
                continue;
            }
            let session = self.ctx.open_rw_session(slot)?;
            session
                .login(UserType::User, Some(&AuthPin::new(pin.into())))
                .map_err(|err| Error::key(format!("HSM login failed: {err}")))?;
            return Ok(session);
        }
        Err(Error::key(format!(
            "no token labelled '{token_label}' present"
        )))
    }
}

impl Drop for HsmModule {
    fn drop(&mut self) {
        MODULE_IN_USE.store(false, Ordering::SeqCst);
    }
}

//------------ HsmKeyPair ----------------------------------------------------

/// A key pair residing on the token.
///
/// Holds a back-reference to the session and the object handle of the
/// private key; the public half is read out once at construction so that
/// DNSKEY records can be produced without touching the device again.
#[derive(Debug)]
pub struct HsmKeyPair<'a> {
    session: &'a Session,
    private: ObjectHandle,
    algorithm: SecurityAlgorithm,
    dnskey: Dnskey<Vec<u8>>,
}

impl SignRaw for HsmKeyPair<'_> {
    fn algorithm(&self) -> SecurityAlgorithm {
        self.algorithm
    }

    fn dnskey(&self) -> Dnskey<Vec<u8>> {
        self.dnskey.clone()
    }

    fn sign_raw(&self, data: &[u8]) -> core::result::Result<Signature, SignError> {
        let mechanism = match self.algorithm {
            SecurityAlgorithm::RSASHA256 => Mechanism::Sha256RsaPkcs,
            SecurityAlgorithm::ECDSAP256SHA256 => Mechanism::EcdsaSha256,
            _ => return Err(SignError),
        };
        let sig = self
            .session
            .sign(&mechanism, self.private, data)
            .map_err(|_| SignError)?;
        match self.algorithm {
            SecurityAlgorithm::RSASHA256 => {
                Ok(Signature::RsaSha256(sig.into_boxed_slice()))
            }
            SecurityAlgorithm::ECDSAP256SHA256 => {
                let sig: Box<[u8; 64]> =
                    sig.into_boxed_slice().try_into().map_err(|_| SignError)?;
                Ok(Signature::EcdsaP256Sha256(sig))
            }
            _ => Err(SignError),
        }
    }
}

//------------ Key discovery and generation ----------------------------------

/// The object handles of one signer key pair on the token.
struct KeyPairHandles {
    public: ObjectHandle,
    private: ObjectHandle,
}

/// Obtain the ZSK and KSK signer handles from the token.
///
/// Searches the token for key objects following the signer convention whose
/// validity window covers today. When `create_keys` is set, missing pairs
/// are generated on the device with a one year validity window; otherwise a
/// missing pair is an error.
pub fn signer_handles<'a>(
    session: &'a Session,
    zone: &ZoneName,
    algorithm: SecurityAlgorithm,
    create_keys: bool,
) -> Result<(SignerHandle<HsmKeyPair<'a>>, SignerHandle<HsmKeyPair<'a>>)> {
    let zsk = key_pair_handles(session, ZSK_ID)?;
    let ksk = key_pair_handles(session, KSK_ID)?;

    let zsk = materialize(session, zone, algorithm, create_keys, ZSK_ID, zsk, ZSK_FLAGS)?;
    let ksk = materialize(session, zone, algorithm, create_keys, KSK_ID, ksk, KSK_FLAGS)?;

    Ok((zsk, ksk))
}

fn materialize<'a>(
    session: &'a Session,
    zone: &ZoneName,
    algorithm: SecurityAlgorithm,
    create_keys: bool,
    id: &[u8],
    found: Option<KeyPairHandles>,
    flags: u16,
) -> Result<SignerHandle<HsmKeyPair<'a>>> {
    let handles = match found {
        Some(handles) => handles,
        None if create_keys => {
            info!(
                "no valid {} on the token, generating a new key pair",
                String::from_utf8_lossy(id)
            );
            generate_key_pair(session, id, algorithm)?
        }
        None => {
            return Err(Error::key(format!(
                "no valid {} found on the token and key creation is disabled",
                String::from_utf8_lossy(id)
            )));
        }
    };

    let dnskey = dnskey_from_public(session, handles.public, algorithm, flags)?;
    Ok(SignerHandle::new(
        zone.clone(),
        flags,
        HsmKeyPair {
            session,
            private: handles.private,
            algorithm,
            dnskey,
        },
    ))
}

/// Find the valid public/private objects for one key id.
fn key_pair_handles(session: &Session, id: &[u8]) -> Result<Option<KeyPairHandles>> {
    let mut public = None;
    let mut private = None;
    let today = date_string(&ck_date(today())?);

    let objects = session.find_objects(&[
        Attribute::Label(KEY_LABEL.to_vec()),
        Attribute::Id(id.to_vec()),
    ])?;

    for object in objects {
        let attrs = session.get_attributes(
            object,
            &[
                AttributeType::Class,
                AttributeType::StartDate,
                AttributeType::EndDate,
            ],
        )?;

        let mut class = None;
        let mut start = None;
        let mut end = None;
        for attr in attrs {
            match attr {
                Attribute::Class(value) => class = Some(value),
                Attribute::StartDate(value) => start = Some(date_string(&value)),
                Attribute::EndDate(value) => end = Some(date_string(&value)),
                _ => {}
            }
        }

        // CKA_START_DATE <= today <= CKA_END_DATE; an absent date leaves
        // that side of the window open.
        let valid = start.as_deref().map_or(true, |start| start <= &*today)
            && end.as_deref().map_or(true, |end| &*today <= end);
        if !valid {
            continue;
        }

        if class == Some(ObjectClass::PUBLIC_KEY) {
            public = Some(object);
        } else if class == Some(ObjectClass::PRIVATE_KEY) {
            private = Some(object);
        }
    }

    match (public, private) {
        (Some(public), Some(private)) => Ok(Some(KeyPairHandles { public, private })),
        _ => Ok(None),
    }
}

/// Generate a key pair on the token with a one year validity window.
fn generate_key_pair(
    session: &Session,
    id: &[u8],
    algorithm: SecurityAlgorithm,
) -> Result<KeyPairHandles> {
    let start = ck_date(today())?;
    let end = ck_date(today().saturating_add(Span::new().years(1)))?;

    let mut public_template = vec![
        Attribute::Label(KEY_LABEL.to_vec()),
        Attribute::Id(id.to_vec()),
        Attribute::Token(true),
        Attribute::Verify(true),
        Attribute::StartDate(start.clone()),
        Attribute::EndDate(end.clone()),
    ];
    let private_template = vec![
        Attribute::Label(KEY_LABEL.to_vec()),
        Attribute::Id(id.to_vec()),
        Attribute::Token(true),
        Attribute::Sign(true),
        Attribute::Sensitive(true),
        Attribute::StartDate(start),
        Attribute::EndDate(end),
    ];

    let mechanism = match algorithm {
        SecurityAlgorithm::RSASHA256 => {
            public_template.push(Attribute::PublicExponent(vec![0x01, 0x00, 0x01]));
            public_template.push(Attribute::ModulusBits(2048_u64.into()));
            Mechanism::RsaPkcsKeyPairGen
        }
        SecurityAlgorithm::ECDSAP256SHA256 => {
            public_template.push(Attribute::EcParams(P256_EC_PARAMS.to_vec()));
            Mechanism::EccKeyPairGen
        }
        _ => {
            return Err(Error::sign(format!(
                "unsupported algorithm {algorithm} for HSM key generation"
            )));
        }
    };

    let (public, private) =
        session.generate_key_pair(&mechanism, &public_template, &private_template)?;
    Ok(KeyPairHandles { public, private })
}

/// Assemble the DNSKEY record data for a public key object.
fn dnskey_from_public(
    session: &Session,
    public: ObjectHandle,
    algorithm: SecurityAlgorithm,
    flags: u16,
) -> Result<Dnskey<Vec<u8>>> {
    let key = match algorithm {
        SecurityAlgorithm::RSASHA256 => {
            let attrs = session.get_attributes(
                public,
                &[AttributeType::PublicExponent, AttributeType::Modulus],
            )?;
            let mut exponent = None;
            let mut modulus = None;
            for attr in attrs {
                match attr {
                    Attribute::PublicExponent(value) => exponent = Some(value),
                    Attribute::Modulus(value) => modulus = Some(value),
                    _ => {}
                }
            }
            let (Some(exponent), Some(modulus)) = (exponent, modulus) else {
                return Err(Error::hsm("public key object lacks RSA components"));
            };
            rsa_encode(&exponent, &modulus)
        }
        SecurityAlgorithm::ECDSAP256SHA256 => {
            let attrs =
                session.get_attributes(public, &[AttributeType::EcPoint])?;
            let Some(Attribute::EcPoint(point)) = attrs.into_iter().next() else {
                return Err(Error::hsm("public key object lacks an EC point"));
            };
            ec_point_to_dnskey(&point)?
        }
        _ => {
            return Err(Error::sign(format!(
                "unsupported algorithm {algorithm} for HSM keys"
            )));
        }
    };

    Dnskey::new(flags, 3, algorithm, key)
        .map_err(|err| Error::hsm(format!("bad public key on token: {err}")))
}

/// Unwrap a CKA_EC_POINT value into the DNSKEY key field.
///
/// The attribute is a DER octet string wrapping the SEC 1 uncompressed
/// point `04 | X | Y`; DNSKEY stores the bare `X | Y`.
fn ec_point_to_dnskey(point: &[u8]) -> Result<Vec<u8>> {
    if point.len() == 67 && point[0] == 0x04 && point[1] == 0x41 && point[2] == 0x04 {
        Ok(point[3..].to_vec())
    } else if point.len() == 65 && point[0] == 0x04 {
        // Some tokens return the bare uncompressed point.
        Ok(point[1..].to_vec())
    } else {
        Err(Error::hsm("unexpected CKA_EC_POINT encoding"))
    }
}

//------------ Maintenance operations ----------------------------------------

/// Destroy every signer key object on the token.
///
/// Returns the number of objects destroyed.
pub fn destroy_signer_keys(session: &Session) -> Result<usize> {
    let objects = session.find_objects(&[Attribute::Label(KEY_LABEL.to_vec())])?;
    let count = objects.len();
    for object in objects {
        session.destroy_object(object)?;
    }
    Ok(count)
}

/// Expire every signer key object by dating its validity window to
/// yesterday.
///
/// Returns the number of objects updated.
pub fn expire_signer_keys(session: &Session) -> Result<usize> {
    let yesterday = ck_date(today().saturating_sub(Span::new().days(1)))?;
    let objects = session.find_objects(&[Attribute::Label(KEY_LABEL.to_vec())])?;
    let count = objects.len();
    for object in objects {
        session.update_attributes(object, &[Attribute::EndDate(yesterday.clone())])?;
    }
    Ok(count)
}

//------------ Date handling -------------------------------------------------

fn today() -> civil::Date {
    Zoned::now().date()
}

/// Render a civil date as a CK_DATE structure.
fn ck_date(date: civil::Date) -> Result<Date> {
    Date::new_from_str_slice(
        &format!("{:04}", date.year()),
        &format!("{:02}", date.month()),
        &format!("{:02}", date.day()),
    )
    .map_err(|err| Error::hsm(format!("invalid CK_DATE: {err}")))
}

/// Render a CK_DATE as `YYYYMMDD` for comparison.
fn date_string(date: &Date) -> String {
    let year = String::from_utf8_lossy(&date.year).into_owned();
    let month = String::from_utf8_lossy(&date.month).into_owned();
    let day = String::from_utf8_lossy(&date.day).into_owned();
    format!("{year}{month}{day}")
}

//============ Tests =========================================================
