//! Shared X.509 building blocks: times, algorithm identifiers, public
//! keys, serial numbers and distinguished names.
//!
//! Certificates and CRLs both parse with these; the CMS layer reuses the
//! algorithm checks. The profile is deliberately narrow: RSA with SHA-256
//! is the only signature suite the RPKI allows, so anything else is
//! rejected as [`ObjectError::UnknownProfile`] at the call sites.

use bcder::decode::{self, DecodeError, Source};
use bcder::{BitString, Mode, Oid, Tag};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};

use super::oid;
use super::ObjectError;

/// An X.509 serial number, kept as its canonical DER integer octets.
///
/// RPKI serials may be up to twenty octets, so they do not fit a machine
/// word; DER guarantees a canonical encoding, which makes byte equality
/// the correct comparison for CRL matching.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Serial(Bytes);

impl Serial {
    /// Takes a serial number from the beginning of a constructed value.
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_primitive_if(Tag::INTEGER, |prim| prim.take_all().map(Serial))
    }

    /// Hex form for log messages.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// A distinguished name, kept as its raw DER encoding.
///
/// The profile only requires names for issuer/subject linkage, and DER
/// makes byte comparison sufficient for that.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Name(Bytes);

impl Name {
    /// Captures a name without interpreting it.
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        let captured = cons.capture_one()?;
        Ok(Name(Bytes::copy_from_slice(captured.as_slice())))
    }
}

/// A moment in time from a `UTCTime` or `GeneralizedTime` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Takes a time value from the beginning of a constructed value.
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_primitive(|tag, prim| {
            let content = prim.take_all()?;
            let parsed = match tag {
                Tag::UTC_TIME => parse_utc_time(&content),
                Tag::GENERALIZED_TIME => parse_generalized_time(&content),
                _ => None,
            };
            match parsed {
                Some(time) => Ok(Time(time)),
                None => Err(prim.content_err("expected a valid time value")),
            }
        })
    }

    /// The underlying instant.
    #[must_use]
    pub fn to_date_time(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Time {
    fn from(value: DateTime<Utc>) -> Self {
        Time(value)
    }
}

/// A `notBefore`/`notAfter` (or `thisUpdate`/`nextUpdate`) window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validity {
    /// Start of the window, inclusive.
    pub not_before: Time,
    /// End of the window, inclusive.
    pub not_after: Time,
}

impl Validity {
    /// Creates a window from its endpoints.
    #[must_use]
    pub fn new(not_before: Time, not_after: Time) -> Self {
        Self {
            not_before,
            not_after,
        }
    }

    /// Takes a `Validity` sequence from a certificate.
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            Ok(Validity {
                not_before: Time::take_from(cons)?,
                not_after: Time::take_from(cons)?,
            })
        })
    }

    /// Whether `at` lies inside the window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.not_before.0 <= at && at <= self.not_after.0
    }
}

fn digits(bytes: &[u8]) -> Option<u32> {
    let mut value = 0u32;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add(u32::from(b - b'0'))?;
    }
    Some(value)
}

fn build_time(year: i32, rest: &[u8]) -> Option<DateTime<Utc>> {
    let month = digits(rest.get(0..2)?)?;
    let day = digits(rest.get(2..4)?)?;
    let hour = digits(rest.get(4..6)?)?;
    let minute = digits(rest.get(6..8)?)?;
    let second = digits(rest.get(8..10)?)?;
    if rest.get(10..) != Some(&b"Z"[..]) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)
        .map(|naive| naive.and_utc())
}

/// `YYMMDDHHMMSSZ`; two-digit years below 50 are 20xx, the rest 19xx.
fn parse_utc_time(content: &[u8]) -> Option<DateTime<Utc>> {
    if content.len() != 13 {
        return None;
    }
    let yy = digits(&content[..2])?;
    let year = if yy < 50 { 2000 + yy } else { 1900 + yy };
    build_time(year as i32, &content[2..])
}

/// `YYYYMMDDHHMMSSZ`.
fn parse_generalized_time(content: &[u8]) -> Option<DateTime<Utc>> {
    if content.len() != 15 {
        return None;
    }
    let year = digits(&content[..4])?;
    build_time(year as i32, &content[4..])
}

/// Which algorithm an `AlgorithmIdentifier` named.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    /// `sha256WithRSAEncryption`, the only permitted signature algorithm.
    Sha256WithRsa,
    /// `rsaEncryption`, the only permitted subject key algorithm.
    Rsa,
    /// `id-sha256`, the only permitted digest algorithm.
    Sha256,
}

impl Algorithm {
    /// Takes an `AlgorithmIdentifier` and maps it into the profile.
    ///
    /// Anything outside the three recognized algorithms is a content
    /// error; parameters must be absent or NULL.
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let alg_oid = Oid::take_from(cons)?;
            cons.take_opt_primitive_if(Tag::NULL, |_| Ok(()))?;
            if alg_oid == oid::SHA256_WITH_RSA {
                Ok(Algorithm::Sha256WithRsa)
            } else if alg_oid == oid::RSA_ENCRYPTION {
                Ok(Algorithm::Rsa)
            } else if alg_oid == oid::SHA256 {
                Ok(Algorithm::Sha256)
            } else {
                Err(cons.content_err("algorithm outside the RPKI profile"))
            }
        })
    }
}

/// A `SubjectPublicKeyInfo`.
///
/// Keeps both the full DER encoding (what a TAL pins, byte for byte) and
/// the inner `RSAPublicKey` octets (what ring verifies against).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyInfo {
    raw: Bytes,
    key_bits: Bytes,
}

impl PublicKeyInfo {
    /// Takes a `SubjectPublicKeyInfo` from a constructed value.
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        let captured = cons.capture_one()?;
        let raw = Bytes::copy_from_slice(captured.as_slice());
        let key_bits = Mode::Der
            .decode(raw.clone(), |cons| {
                cons.take_sequence(|cons| {
                    let algorithm = Algorithm::take_from(cons)?;
                    if algorithm != Algorithm::Rsa {
                        return Err(cons.content_err("subject key is not an RSA key"));
                    }
                    let bits = BitString::take_from(cons)?;
                    if bits.unused() != 0 {
                        return Err(cons.content_err("subject key has partial octets"));
                    }
                    Ok(bits.octet_bytes())
                })
            })
            .map_err(DecodeError::convert)?;
        Ok(Self { raw, key_bits })
    }

    /// The full DER `SubjectPublicKeyInfo` encoding.
    #[must_use]
    pub fn raw_der(&self) -> &Bytes {
        &self.raw
    }

    /// Verifies an RSA PKCS#1 v1.5 / SHA-256 signature made by this key.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectError::SignatureInvalid`] when verification fails.
    pub fn verify_signature(
        &self,
        what: &'static str,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), ObjectError> {
        ring::signature::UnparsedPublicKey::new(
            &ring::signature::RSA_PKCS1_2048_8192_SHA256,
            self.key_bits.as_ref(),
        )
        .verify(message, signature)
        .map_err(|_| ObjectError::SignatureInvalid { what })
    }
}

/// Extracts the octets of a BIT STRING signature value.
pub(crate) fn signature_bytes<S: Source>(
    cons: &mut decode::Constructed<S>,
) -> Result<Bytes, DecodeError<S::Error>> {
    let bits = BitString::take_from(cons)?;
    if bits.unused() != 0 {
        return Err(cons.content_err("signature with partial octets"));
    }
    Ok(bits.octet_bytes())
}
