//! RPKI resource certificates (RFC 6487).
//!
//! One type covers both CA certificates and the EE certificates embedded
//! in signed objects; the validator distinguishes them via
//! [`Cert::is_ca`] and the SIA accessors. Decoding keeps the raw DER of
//! the to-be-signed part so verification is a byte-exact operation over
//! what the issuer actually signed.

use bcder::decode::{self, DecodeError, Source};
use bcder::{Mode, OctetString, Oid, Tag};
use bytes::Bytes;

use crate::uri::{HttpsUri, RsyncUri};

use super::oid;
use super::resources::{AsResources, IpResources};
use super::x509::{signature_bytes, Algorithm, Name, PublicKeyInfo, Serial, Time, Validity};
use super::ObjectError;

/// The Subject Information Access entries of a certificate.
#[derive(Clone, Debug, Default)]
pub struct Sia {
    /// `caRepository`: the rsync publication point of a CA.
    pub ca_repository: Option<RsyncUri>,
    /// `rpkiManifest`: the manifest of a CA.
    pub rpki_manifest: Option<RsyncUri>,
    /// `signedObject`: the object an EE certificate signs.
    pub signed_object: Option<RsyncUri>,
    /// `rpkiNotify`: the RRDP notification document.
    pub rpki_notify: Option<HttpsUri>,
}

/// A decoded resource certificate.
#[derive(Clone, Debug)]
pub struct Cert {
    tbs_raw: Bytes,
    signature: Bytes,
    serial: Serial,
    issuer: Name,
    subject: Name,
    validity: Validity,
    spki: PublicKeyInfo,
    basic_ca: bool,
    ski: Option<Bytes>,
    aki: Option<Bytes>,
    sia: Sia,
    crl_uri: Option<RsyncUri>,
    ip_resources: IpResources,
    as_resources: AsResources,
    unknown_critical: Option<String>,
}

impl Cert {
    /// Decodes a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// [`ObjectError::Malformed`] on parse failure,
    /// [`ObjectError::UnknownProfile`] when an unrecognized critical
    /// extension is present.
    pub fn decode(bytes: Bytes) -> Result<Self, ObjectError> {
        let cert = Mode::Der
            .decode(bytes, |cons| Self::take_from(cons))
            .map_err(|err| ObjectError::malformed("certificate", err))?;
        if let Some(ext) = &cert.unknown_critical {
            return Err(ObjectError::profile(
                "certificate",
                format!("unrecognized critical extension {ext}"),
            ));
        }
        Ok(cert)
    }

    /// Takes a certificate from the beginning of a constructed value.
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let tbs_captured = cons.capture_one()?;
            let tbs_raw = Bytes::copy_from_slice(tbs_captured.as_slice());
            let outer_alg = Algorithm::take_from(cons)?;
            if outer_alg != Algorithm::Sha256WithRsa {
                return Err(cons.content_err("certificate signed with foreign algorithm"));
            }
            let signature = signature_bytes(cons)?;
            let mut cert = Mode::Der
                .decode(tbs_raw.clone(), |cons| Self::take_tbs(cons))
                .map_err(DecodeError::convert)?;
            cert.tbs_raw = tbs_raw;
            cert.signature = signature;
            Ok(cert)
        })
    }

    /// Parses the `TBSCertificate` sequence.
    fn take_tbs<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            // version [0] EXPLICIT INTEGER: must be v3.
            cons.take_constructed_if(Tag::CTX_0, |cons| cons.skip_u8_if(2))?;
            let serial = Serial::take_from(cons)?;
            let tbs_alg = Algorithm::take_from(cons)?;
            if tbs_alg != Algorithm::Sha256WithRsa {
                return Err(cons.content_err("certificate signed with foreign algorithm"));
            }
            let issuer = Name::take_from(cons)?;
            let validity = Validity::take_from(cons)?;
            let subject = Name::take_from(cons)?;
            let spki = PublicKeyInfo::take_from(cons)?;

            let mut cert = Cert {
                tbs_raw: Bytes::new(),
                signature: Bytes::new(),
                serial,
                issuer,
                subject,
                validity,
                spki,
                basic_ca: false,
                ski: None,
                aki: None,
                sia: Sia::default(),
                crl_uri: None,
                ip_resources: IpResources::default(),
                as_resources: AsResources::default(),
                unknown_critical: None,
            };

            // extensions [3] EXPLICIT SEQUENCE OF Extension.
            cons.take_constructed_if(Tag::CTX_3, |cons| {
                cons.take_sequence(|cons| {
                    while let Some(()) = cons.take_opt_sequence(|cons| {
                        cert.take_extension(cons)
                    })? {}
                    Ok(())
                })
            })?;

            Ok(cert)
        })
    }

    fn take_extension<S: Source>(
        &mut self,
        cons: &mut decode::Constructed<S>,
    ) -> Result<(), DecodeError<S::Error>> {
        let ext_id = Oid::take_from(cons)?;
        let critical = take_opt_bool(cons)?.unwrap_or(false);
        let value = OctetString::take_from(cons)?.to_bytes();

        if ext_id == oid::CE_BASIC_CONSTRAINTS {
            self.basic_ca = Mode::Der
                .decode(value, |cons| {
                    cons.take_sequence(|cons| {
                        let ca = take_opt_bool(cons)?.unwrap_or(false);
                        // pathLenConstraint, tolerated though the profile
                        // forbids it.
                        cons.take_opt_primitive_if(Tag::INTEGER, |prim| prim.skip_all())?;
                        Ok(ca)
                    })
                })
                .map_err(DecodeError::convert)?;
        } else if ext_id == oid::CE_SUBJECT_KEY_ID {
            self.ski = Some(
                Mode::Der
                    .decode(value, |cons| {
                        OctetString::take_from(cons).map(|os| os.to_bytes())
                    })
                    .map_err(DecodeError::convert)?,
            );
        } else if ext_id == oid::CE_AUTHORITY_KEY_ID {
            self.aki = Mode::Der
                .decode(value, |cons| {
                    cons.take_sequence(|cons| {
                        let key_id = cons
                            .take_opt_primitive_if(Tag::CTX_0, |prim| prim.take_all())?;
                        cons.skip_all()?;
                        Ok(key_id)
                    })
                })
                .map_err(DecodeError::convert)?;
        } else if ext_id == oid::PE_SUBJECT_INFO_ACCESS {
            self.sia = Mode::Der
                .decode(value, |cons| take_sia(cons))
                .map_err(DecodeError::convert)?;
        } else if ext_id == oid::CE_CRL_DISTRIBUTION_POINTS {
            self.crl_uri = Mode::Der
                .decode(value, |cons| take_crl_uri(cons))
                .map_err(DecodeError::convert)?;
        } else if ext_id == oid::PE_IP_ADDR_BLOCKS {
            self.ip_resources = Mode::Der
                .decode(value, |cons| IpResources::take_from(cons))
                .map_err(DecodeError::convert)?;
        } else if ext_id == oid::PE_AUTONOMOUS_SYS_IDS {
            self.as_resources = Mode::Der
                .decode(value, |cons| AsResources::take_from(cons))
                .map_err(DecodeError::convert)?;
        } else if ext_id == oid::CE_KEY_USAGE
            || ext_id == oid::CE_EXTENDED_KEY_USAGE
            || ext_id == oid::CE_CERTIFICATE_POLICIES
            || ext_id == oid::PE_AUTHORITY_INFO_ACCESS
        {
            // Recognized but not needed for the walk; contents already
            // consumed with the extension value.
        } else if critical && self.unknown_critical.is_none() {
            self.unknown_critical = Some(ext_id.to_string());
        }
        Ok(())
    }

    /// Verifies this certificate's signature with the issuer's key.
    ///
    /// # Errors
    ///
    /// [`ObjectError::SignatureInvalid`] when verification fails.
    pub fn verify_signature(&self, issuer_key: &PublicKeyInfo) -> Result<(), ObjectError> {
        issuer_key.verify_signature("certificate", &self.tbs_raw, &self.signature)
    }

    /// Verifies the self-signature of a trust-anchor certificate.
    ///
    /// # Errors
    ///
    /// [`ObjectError::SignatureInvalid`] when verification fails.
    pub fn verify_self_signed(&self) -> Result<(), ObjectError> {
        self.verify_signature(&self.spki)
    }

    /// Whether the basic-constraints extension marks this as a CA.
    #[must_use]
    pub fn is_ca(&self) -> bool {
        self.basic_ca
    }

    /// The certificate serial number.
    #[must_use]
    pub fn serial(&self) -> &Serial {
        &self.serial
    }

    /// The raw DER issuer name.
    #[must_use]
    pub fn issuer(&self) -> &Name {
        &self.issuer
    }

    /// The raw DER subject name.
    #[must_use]
    pub fn subject(&self) -> &Name {
        &self.subject
    }

    /// The validity window.
    #[must_use]
    pub fn validity(&self) -> &Validity {
        &self.validity
    }

    /// The subject public key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKeyInfo {
        &self.spki
    }

    /// The subject key identifier extension, if present.
    #[must_use]
    pub fn ski(&self) -> Option<&Bytes> {
        self.ski.as_ref()
    }

    /// The authority key identifier extension, if present.
    #[must_use]
    pub fn aki(&self) -> Option<&Bytes> {
        self.aki.as_ref()
    }

    /// The SIA entries.
    #[must_use]
    pub fn sia(&self) -> &Sia {
        &self.sia
    }

    /// The CRL distribution point, if present.
    #[must_use]
    pub fn crl_uri(&self) -> Option<&RsyncUri> {
        self.crl_uri.as_ref()
    }

    /// The declared IP resources.
    #[must_use]
    pub fn ip_resources(&self) -> &IpResources {
        &self.ip_resources
    }

    /// The declared AS resources.
    #[must_use]
    pub fn as_resources(&self) -> &AsResources {
        &self.as_resources
    }
}

/// Takes an optional BOOLEAN primitive.
fn take_opt_bool<S: Source>(
    cons: &mut decode::Constructed<S>,
) -> Result<Option<bool>, DecodeError<S::Error>> {
    cons.take_opt_primitive_if(Tag::BOOLEAN, |prim| {
        let content = prim.take_all()?;
        match content.as_ref() {
            [b] => Ok(*b != 0),
            _ => Err(prim.content_err("boolean with bad length")),
        }
    })
}

/// Parses the SIA access-description list.
fn take_sia<S: Source>(
    cons: &mut decode::Constructed<S>,
) -> Result<Sia, DecodeError<S::Error>> {
    cons.take_sequence(|cons| {
        let mut sia = Sia::default();
        while let Some(()) = cons.take_opt_sequence(|cons| {
            let method = Oid::take_from(cons)?;
            // accessLocation: only the URI form [6] is interesting; other
            // GeneralName alternatives are skipped.
            let Some(uri) = cons.take_opt_primitive_if(Tag::CTX_6, |prim| prim.take_all())?
            else {
                cons.capture_one()?;
                return Ok(());
            };
            let text = match std::str::from_utf8(uri.as_ref()) {
                Ok(text) => text,
                // A bad URI only disables this access entry.
                Err(_) => return Ok(()),
            };
            // The first entry of each access method wins.
            if method == oid::AD_CA_REPOSITORY {
                sia.ca_repository = sia.ca_repository.take().or_else(|| RsyncUri::parse(text).ok());
            } else if method == oid::AD_RPKI_MANIFEST {
                sia.rpki_manifest = sia.rpki_manifest.take().or_else(|| RsyncUri::parse(text).ok());
            } else if method == oid::AD_SIGNED_OBJECT {
                sia.signed_object = sia.signed_object.take().or_else(|| RsyncUri::parse(text).ok());
            } else if method == oid::AD_RPKI_NOTIFY {
                sia.rpki_notify = sia.rpki_notify.take().or_else(|| HttpsUri::parse(text).ok());
            }
            Ok(())
        })? {}
        Ok(sia)
    })
}

/// Extracts the first rsync URI from a CRL distribution points extension.
fn take_crl_uri<S: Source>(
    cons: &mut decode::Constructed<S>,
) -> Result<Option<RsyncUri>, DecodeError<S::Error>> {
    cons.take_sequence(|cons| {
        let mut found = None;
        while let Some(()) = cons.take_opt_sequence(|cons| {
            // distributionPoint [0] { fullName [0] { GeneralName } }
            cons.take_opt_constructed_if(Tag::CTX_0, |cons| {
                cons.take_opt_constructed_if(Tag::CTX_0, |cons| {
                    while let Some(uri) =
                        cons.take_opt_primitive_if(Tag::CTX_6, |prim| prim.take_all())?
                    {
                        if found.is_none() {
                            if let Ok(text) = std::str::from_utf8(uri.as_ref()) {
                                found = RsyncUri::parse(text).ok();
                            }
                        }
                    }
                    cons.skip_all()
                })?;
                cons.skip_all()
            })?;
            cons.skip_all()
        })? {}
        Ok(found)
    })
}
