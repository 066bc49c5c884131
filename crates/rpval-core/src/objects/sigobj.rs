//! The CMS envelope shared by manifests and ROAs (RFC 6488).
//!
//! An RPKI signed object is a `SignedData` with exactly one embedded EE
//! certificate and exactly one `SignerInfo` keyed by that certificate's
//! subject key identifier. [`SignedObject::decode`] takes the structure
//! apart; [`SignedObject::verify`] checks the digest of the payload, the
//! signature over the signed attributes, and the signer linkage. Chain
//! validation of the EE certificate itself is the validator's job.
//!
//! The `strict` flag selects DER-only decoding and enforces the canonical
//! ordering of the signed attributes; without it, BER constructions and
//! reordered attributes from sloppy producers are tolerated. Neither mode
//! ever skips a cryptographic check.

use bcder::decode::{self, DecodeError, Source};
use bcder::{Mode, OctetString, Oid, Tag};
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::cert::Cert;
use super::oid::{self, ConstOid};
use super::x509::Algorithm;
use super::ObjectError;

/// A decoded RPKI signed object.
#[derive(Clone, Debug)]
pub struct SignedObject {
    content: Bytes,
    cert: Cert,
    sid: Bytes,
    signed_attrs: Bytes,
    message_digest: Bytes,
    signature: Bytes,
}

impl SignedObject {
    /// Decodes a signed object, requiring the given eContentType.
    ///
    /// # Errors
    ///
    /// [`ObjectError::Malformed`] on parse failure and
    /// [`ObjectError::UnknownProfile`] on a foreign content type or
    /// profile violation.
    pub fn decode(
        bytes: Bytes,
        content_type: &ConstOid,
        strict: bool,
    ) -> Result<Self, ObjectError> {
        let mode = if strict { Mode::Der } else { Mode::Ber };
        let obj = mode
            .decode(bytes, |cons| Self::take_from(cons, content_type))
            .map_err(|err| ObjectError::malformed("signed object", err))?;
        if strict {
            obj.check_attr_order()?;
        }
        Ok(obj)
    }

    fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
        content_type: &ConstOid,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let outer_type = Oid::take_from(cons)?;
            if outer_type != oid::CT_SIGNED_DATA {
                return Err(cons.content_err("not a CMS signed-data object"));
            }
            cons.take_constructed_if(Tag::CTX_0, |cons| {
                Self::take_signed_data(cons, content_type)
            })
        })
    }

    fn take_signed_data<S: Source>(
        cons: &mut decode::Constructed<S>,
        content_type: &ConstOid,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            cons.skip_u8_if(3)?;

            // digestAlgorithms: exactly one, SHA-256.
            cons.take_constructed_if(Tag::SET, |cons| {
                if Algorithm::take_from(cons)? != Algorithm::Sha256 {
                    return Err(cons.content_err("digest algorithm is not SHA-256"));
                }
                Ok(())
            })?;

            // encapContentInfo.
            let content = cons.take_sequence(|cons| {
                let e_type = Oid::take_from(cons)?;
                if e_type != *content_type {
                    return Err(cons.content_err("unexpected encapsulated content type"));
                }
                cons.take_constructed_if(Tag::CTX_0, |cons| {
                    OctetString::take_from(cons).map(|os| os.to_bytes())
                })
            })?;

            // certificates [0]: exactly one EE certificate.
            let cert = cons.take_constructed_if(Tag::CTX_0, |cons| Cert::take_from(cons))?;

            // crls [1] must be absent.
            if cons
                .take_opt_constructed_if(Tag::CTX_1, |cons| cons.capture_all())?
                .is_some()
            {
                return Err(cons.content_err("CRLs inside a signed object"));
            }

            // signerInfos: exactly one.
            let (sid, signed_attrs, message_digest, signature) =
                cons.take_constructed_if(Tag::SET, |cons| {
                    cons.take_sequence(|cons| {
                        cons.skip_u8_if(3)?;
                        let sid =
                            cons.take_primitive_if(Tag::CTX_0, |prim| prim.take_all())?;
                        if Algorithm::take_from(cons)? != Algorithm::Sha256 {
                            return Err(
                                cons.content_err("signer digest algorithm is not SHA-256")
                            );
                        }
                        let signed_attrs = cons
                            .take_constructed_if(Tag::CTX_0, |cons| cons.capture_all())?;
                        let signed_attrs =
                            Bytes::copy_from_slice(signed_attrs.as_slice());
                        let message_digest = parse_signed_attrs(&signed_attrs, content_type)
                            .map_err(|msg| cons.content_err(msg))?;
                        let sig_alg = Algorithm::take_from(cons)?;
                        if sig_alg == Algorithm::Sha256 {
                            return Err(
                                cons.content_err("signature algorithm is a bare digest")
                            );
                        }
                        let signature =
                            OctetString::take_from(cons)?.to_bytes();
                        if cons
                            .take_opt_constructed_if(Tag::CTX_1, |cons| cons.capture_all())?
                            .is_some()
                        {
                            return Err(
                                cons.content_err("unsigned attributes outside the profile")
                            );
                        }
                        Ok((sid, signed_attrs, message_digest, signature))
                    })
                })?;

            Ok(SignedObject {
                content,
                cert,
                sid,
                signed_attrs,
                message_digest,
                signature,
            })
        })
    }

    /// Verifies the payload digest, the signer linkage, and the signature
    /// over the signed attributes with the EE certificate's key.
    ///
    /// # Errors
    ///
    /// [`ObjectError::SignatureInvalid`] on any mismatch.
    pub fn verify(&self) -> Result<(), ObjectError> {
        let digest = Sha256::digest(&self.content);
        if digest.as_slice() != self.message_digest.as_ref() {
            return Err(ObjectError::SignatureInvalid {
                what: "signed object digest",
            });
        }
        match self.cert.ski() {
            Some(ski) if *ski == self.sid => {}
            _ => {
                return Err(ObjectError::SignatureInvalid {
                    what: "signed object signer id",
                })
            }
        }
        let message = wrap_as_set(&self.signed_attrs);
        self.cert
            .public_key()
            .verify_signature("signed object", &message, &self.signature)
    }

    /// The DER-encoded payload.
    #[must_use]
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// The embedded EE certificate.
    #[must_use]
    pub fn ee_cert(&self) -> &Cert {
        &self.cert
    }

    /// Enforces the canonical SET OF ordering of the signed attributes.
    fn check_attr_order(&self) -> Result<(), ObjectError> {
        let values = split_der_values(&self.signed_attrs).ok_or_else(|| {
            ObjectError::malformed("signed attributes", "unreadable attribute encoding")
        })?;
        if values.windows(2).any(|w| w[0] > w[1]) {
            return Err(ObjectError::profile(
                "signed attributes",
                "attributes are not in canonical order",
            ));
        }
        Ok(())
    }
}

/// Parses the signed attributes, returning the messageDigest value.
///
/// The content-type attribute must match `content_type`; messageDigest is
/// mandatory; signingTime and binarySigningTime are tolerated; anything
/// else violates the profile. Duplicates are always rejected.
fn parse_signed_attrs(
    raw: &Bytes,
    content_type: &ConstOid,
) -> Result<Bytes, &'static str> {
    let mut message_digest = None;
    let mut seen_content_type = false;
    let mut seen_signing_time = false;
    let mut seen_binary_time = false;

    let values = split_der_values(raw).ok_or("unreadable signed attributes")?;
    for value in values {
        let parsed = Mode::Ber.decode(Bytes::copy_from_slice(value), |cons| {
            cons.take_sequence(|cons| {
                let attr_type = Oid::take_from(cons)?;
                let attr_value = cons.take_constructed_if(Tag::SET, |cons| {
                    let captured = cons.capture_one()?;
                    Ok(Bytes::copy_from_slice(captured.as_slice()))
                })?;
                Ok((attr_type, attr_value))
            })
        });
        let (attr_type, attr_value) = match parsed {
            Ok(pair) => pair,
            Err(_) => return Err("malformed signed attribute"),
        };
        if attr_type == oid::AA_CONTENT_TYPE {
            if seen_content_type {
                return Err("duplicate content-type attribute");
            }
            seen_content_type = true;
            let matches = Mode::Ber
                .decode(attr_value, |cons| Oid::take_from(cons))
                .map(|inner| inner == *content_type)
                .unwrap_or(false);
            if !matches {
                return Err("content-type attribute mismatch");
            }
        } else if attr_type == oid::AA_MESSAGE_DIGEST {
            if message_digest.is_some() {
                return Err("duplicate message-digest attribute");
            }
            let digest = Mode::Ber
                .decode(attr_value, |cons| {
                    OctetString::take_from(cons).map(|os| os.to_bytes())
                })
                .map_err(|_| "malformed message-digest attribute")?;
            message_digest = Some(digest);
        } else if attr_type == oid::AA_SIGNING_TIME {
            if seen_signing_time {
                return Err("duplicate signing-time attribute");
            }
            seen_signing_time = true;
        } else if attr_type == oid::AA_BINARY_SIGNING_TIME {
            if seen_binary_time {
                return Err("duplicate binary-signing-time attribute");
            }
            seen_binary_time = true;
        } else {
            return Err("signed attribute outside the profile");
        }
    }

    if !seen_content_type {
        return Err("missing content-type attribute");
    }
    message_digest.ok_or("missing message-digest attribute")
}

/// Re-tags the raw attribute content as the `SET OF` the signature covers.
fn wrap_as_set(content: &Bytes) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(0x31);
    encode_der_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

fn encode_der_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    #[allow(clippy::cast_possible_truncation)]
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Splits a concatenation of DER TLVs into the raw encoding of each value.
///
/// Returns `None` on truncated or indefinite-length input; attribute sets
/// re-encoded here are always definite length.
fn split_der_values(data: &[u8]) -> Option<Vec<&[u8]>> {
    let mut values = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let start = rest;
        let mut idx = 0;
        // Tag octets: a low-tag-number byte, or 0x1f marker plus base-128
        // continuation bytes.
        if *rest.get(idx)? & 0x1f == 0x1f {
            idx += 1;
            while *rest.get(idx)? & 0x80 != 0 {
                idx += 1;
            }
        }
        idx += 1;
        // Length octets.
        let first = *rest.get(idx)?;
        idx += 1;
        let len = if first < 0x80 {
            usize::from(first)
        } else {
            let count = usize::from(first & 0x7f);
            if count == 0 || count > core::mem::size_of::<usize>() {
                return None;
            }
            let mut value = 0usize;
            for _ in 0..count {
                value = value.checked_mul(256)?.checked_add(usize::from(*rest.get(idx)?))?;
                idx += 1;
            }
            value
        };
        let total = idx.checked_add(len)?;
        if rest.len() < total {
            return None;
        }
        values.push(&start[..total]);
        rest = &rest[total..];
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_der_values_walks_tlvs() {
        // Two small TLVs: OCTET STRING "ab", INTEGER 5.
        let data = [0x04, 0x02, b'a', b'b', 0x02, 0x01, 0x05];
        let values = split_der_values(&data).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], &[0x04, 0x02, b'a', b'b']);
        assert_eq!(values[1], &[0x02, 0x01, 0x05]);
    }

    #[test]
    fn split_der_values_long_form() {
        let mut data = vec![0x04, 0x81, 0x80];
        data.extend(std::iter::repeat(0u8).take(128));
        let values = split_der_values(&data).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].len(), 131);
    }

    #[test]
    fn split_der_values_rejects_truncation() {
        assert!(split_der_values(&[0x04, 0x05, 0x01]).is_none());
        assert!(split_der_values(&[0x04]).is_none());
    }

    #[test]
    fn wrap_as_set_short_and_long() {
        let short = wrap_as_set(&Bytes::from_static(b"abc"));
        assert_eq!(&short[..2], &[0x31, 0x03]);
        let long = wrap_as_set(&Bytes::from(vec![0u8; 200]));
        assert_eq!(&long[..3], &[0x31, 0x81, 200]);
    }
}
