//! Certificate revocation lists (RFC 5280, RPKI profile of RFC 6487).

use bcder::decode::{self, DecodeError, Source};
use bcder::{Mode, OctetString, Oid, Tag};
use bytes::Bytes;

use super::oid;
use super::x509::{signature_bytes, Algorithm, Name, PublicKeyInfo, Serial, Time, Validity};
use super::ObjectError;

/// A decoded CRL.
#[derive(Clone, Debug)]
pub struct Crl {
    tbs_raw: Bytes,
    signature: Bytes,
    issuer: Name,
    validity: Validity,
    revoked: Vec<Serial>,
    aki: Option<Bytes>,
}

impl Crl {
    /// Decodes a DER-encoded CRL.
    ///
    /// # Errors
    ///
    /// [`ObjectError::Malformed`] on parse failure.
    pub fn decode(bytes: Bytes) -> Result<Self, ObjectError> {
        Mode::Der
            .decode(bytes, |cons| Self::take_from(cons))
            .map_err(|err| ObjectError::malformed("CRL", err))
    }

    fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let tbs_captured = cons.capture_one()?;
            let tbs_raw = Bytes::copy_from_slice(tbs_captured.as_slice());
            let outer_alg = Algorithm::take_from(cons)?;
            if outer_alg != Algorithm::Sha256WithRsa {
                return Err(cons.content_err("CRL signed with foreign algorithm"));
            }
            let signature = signature_bytes(cons)?;
            let mut crl = Mode::Der
                .decode(tbs_raw.clone(), |cons| Self::take_tbs(cons))
                .map_err(DecodeError::convert)?;
            crl.tbs_raw = tbs_raw;
            crl.signature = signature;
            Ok(crl)
        })
    }

    fn take_tbs<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            // version: v2.
            cons.skip_u8_if(1)?;
            let tbs_alg = Algorithm::take_from(cons)?;
            if tbs_alg != Algorithm::Sha256WithRsa {
                return Err(cons.content_err("CRL signed with foreign algorithm"));
            }
            let issuer = Name::take_from(cons)?;
            let this_update = Time::take_from(cons)?;
            let next_update = Time::take_from(cons)?;

            let mut revoked = Vec::new();
            cons.take_opt_sequence(|cons| {
                while let Some(serial) = cons.take_opt_sequence(|cons| {
                    let serial = Serial::take_from(cons)?;
                    let _date = Time::take_from(cons)?;
                    // crlEntryExtensions are outside the profile but
                    // harmless; skip whatever remains of the entry.
                    cons.skip_all()?;
                    Ok(serial)
                })? {
                    revoked.push(serial);
                }
                Ok(())
            })?;

            // crlExtensions [0]: AKI and CRL number.
            let mut aki = None;
            cons.take_opt_constructed_if(Tag::CTX_0, |cons| {
                cons.take_sequence(|cons| {
                    while let Some(()) = cons.take_opt_sequence(|cons| {
                        let ext_id = Oid::take_from(cons)?;
                        // critical flag: CRL extensions in the profile are
                        // non-critical, tolerate either.
                        let _ = cons.take_opt_primitive_if(Tag::BOOLEAN, |prim| {
                            prim.take_all()
                        })?;
                        let value = OctetString::take_from(cons)?.to_bytes();
                        if ext_id == oid::CE_AUTHORITY_KEY_ID {
                            aki = Mode::Der
                                .decode(value, |cons| {
                                    cons.take_sequence(|cons| {
                                        let key_id = cons.take_opt_primitive_if(
                                            Tag::CTX_0,
                                            |prim| prim.take_all(),
                                        )?;
                                        cons.skip_all()?;
                                        Ok(key_id)
                                    })
                                })
                                .map_err(DecodeError::convert)?;
                        }
                        Ok(())
                    })? {}
                    Ok(())
                })
            })?;

            Ok(Crl {
                tbs_raw: Bytes::new(),
                signature: Bytes::new(),
                issuer,
                validity: Validity::new(this_update, next_update),
                revoked,
                aki,
            })
        })
    }

    /// Verifies the CRL's signature with the issuing CA's key.
    ///
    /// # Errors
    ///
    /// [`ObjectError::SignatureInvalid`] when verification fails.
    pub fn verify_signature(&self, issuer_key: &PublicKeyInfo) -> Result<(), ObjectError> {
        issuer_key.verify_signature("CRL", &self.tbs_raw, &self.signature)
    }

    /// The raw DER issuer name.
    #[must_use]
    pub fn issuer(&self) -> &Name {
        &self.issuer
    }

    /// The `thisUpdate`/`nextUpdate` window.
    #[must_use]
    pub fn validity(&self) -> &Validity {
        &self.validity
    }

    /// The authority key identifier, if present.
    #[must_use]
    pub fn aki(&self) -> Option<&Bytes> {
        self.aki.as_ref()
    }

    /// Whether `serial` is revoked.
    #[must_use]
    pub fn contains(&self, serial: &Serial) -> bool {
        self.revoked.iter().any(|s| s == serial)
    }

    /// The number of revoked serials.
    #[must_use]
    pub fn revoked_count(&self) -> usize {
        self.revoked.len()
    }
}
