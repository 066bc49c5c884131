//! Route Origin Authorizations (RFC 6482).

use bcder::decode::{self, DecodeError, Source};
use bcder::{Mode, Tag};
use bytes::Bytes;

use super::oid;
use super::resources::{take_u32, AddressFamily, Prefix, ResourceSet};
use super::sigobj::SignedObject;
use super::ObjectError;

/// One authorized prefix with its optional maxLength.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoaPrefix {
    /// The authorized prefix.
    pub prefix: Prefix,
    /// The longest announced length permitted; defaults to the prefix
    /// length when absent.
    pub max_length: Option<u8>,
}

impl RoaPrefix {
    /// The effective maxLength.
    #[must_use]
    pub fn effective_max_length(&self) -> u8 {
        self.max_length.unwrap_or_else(|| self.prefix.len())
    }
}

/// A decoded ROA.
#[derive(Clone, Debug)]
pub struct Roa {
    signed: SignedObject,
    asn: u32,
    prefixes: Vec<RoaPrefix>,
}

impl Roa {
    /// Decodes a ROA from its CMS encoding.
    ///
    /// Per-prefix bounds (prefix length within the family, maxLength
    /// between prefix length and the family maximum) are enforced here;
    /// coverage by the EE certificate happens in [`Roa::check_coverage`].
    ///
    /// # Errors
    ///
    /// Any [`ObjectError`] from the CMS layer or the content parse.
    pub fn decode(bytes: Bytes, strict: bool) -> Result<Self, ObjectError> {
        let signed = SignedObject::decode(bytes, &oid::CT_ROUTE_ORIGIN_AUTHZ, strict)?;
        let (asn, prefixes) = Mode::Der
            .decode(signed.content().clone(), |cons| take_content(cons))
            .map_err(|err| ObjectError::malformed("ROA content", err))?;
        Ok(Self {
            signed,
            asn,
            prefixes,
        })
    }

    /// The CMS envelope (EE certificate, signature verification).
    #[must_use]
    pub fn signed(&self) -> &SignedObject {
        &self.signed
    }

    /// The authorized AS number.
    #[must_use]
    pub fn asn(&self) -> u32 {
        self.asn
    }

    /// The authorized prefixes.
    #[must_use]
    pub fn prefixes(&self) -> &[RoaPrefix] {
        &self.prefixes
    }

    /// Checks that every prefix is covered by the EE certificate's
    /// effective IP resources.
    ///
    /// # Errors
    ///
    /// [`ObjectError::UnknownProfile`] naming the first uncovered prefix.
    pub fn check_coverage(&self, ee_resources: &ResourceSet) -> Result<(), ObjectError> {
        check_prefix_coverage(&self.prefixes, ee_resources)
    }
}

/// The coverage rule behind [`Roa::check_coverage`].
pub fn check_prefix_coverage(
    prefixes: &[RoaPrefix],
    ee_resources: &ResourceSet,
) -> Result<(), ObjectError> {
    for entry in prefixes {
        if !ee_resources.covers_prefix(entry.prefix) {
            return Err(ObjectError::profile(
                "ROA",
                format!("prefix {} not covered by EE certificate", entry.prefix),
            ));
        }
    }
    Ok(())
}

fn take_content<S: Source>(
    cons: &mut decode::Constructed<S>,
) -> Result<(u32, Vec<RoaPrefix>), DecodeError<S::Error>> {
    cons.take_sequence(|cons| {
        // version [0] EXPLICIT INTEGER DEFAULT 0.
        cons.take_opt_constructed_if(Tag::CTX_0, |cons| cons.skip_u8_if(0))?;
        let asn = take_u32(cons)?;
        let mut prefixes = Vec::new();
        cons.take_sequence(|cons| {
            let mut seen_v4 = false;
            let mut seen_v6 = false;
            while let Some(()) = cons.take_opt_sequence(|cons| {
                let family = AddressFamily::take_from(cons)?;
                let seen = match family {
                    AddressFamily::Ipv4 => &mut seen_v4,
                    AddressFamily::Ipv6 => &mut seen_v6,
                };
                if *seen {
                    return Err(cons.content_err("duplicate address family in ROA"));
                }
                *seen = true;
                cons.take_sequence(|cons| {
                    while let Some(entry) = cons.take_opt_sequence(|cons| {
                        let prefix = Prefix::take_from(cons, family)?;
                        let max_length = cons.take_opt_u8()?;
                        if let Some(max) = max_length {
                            if max > family.max_len() || max < prefix.len() {
                                return Err(
                                    cons.content_err("maxLength outside the valid range")
                                );
                            }
                        }
                        Ok(RoaPrefix { prefix, max_length })
                    })? {
                        prefixes.push(entry);
                    }
                    Ok(())
                })
            })? {}
            Ok(())
        })?;
        Ok((asn, prefixes))
    })
}
