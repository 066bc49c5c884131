//! Manifests (RFC 9286).
//!
//! A manifest lists every object a CA currently publishes together with
//! its SHA-256 hash. The validity window uses `thisUpdate`/`nextUpdate`
//! rather than the EE certificate's lifetime, and the manifest number
//! lets a relying party notice replays; both are surfaced here, the
//! policy around them lives in the validator.

use bcder::decode::{self, DecodeError, Source};
use bcder::{Mode, Oid, Tag};
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::oid;
use super::sigobj::SignedObject;
use super::x509::{Time, Validity};
use super::ObjectError;

/// One `FileAndHash` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    /// The file name, relative to the publication point.
    pub name: String,
    /// The expected SHA-256 digest of the file.
    pub hash: Bytes,
}

impl FileEntry {
    /// Whether `data` hashes to this entry's digest.
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        Sha256::digest(data).as_slice() == self.hash.as_ref()
    }
}

/// A decoded manifest.
#[derive(Clone, Debug)]
pub struct Manifest {
    signed: SignedObject,
    number: Bytes,
    validity: Validity,
    files: Vec<FileEntry>,
}

impl Manifest {
    /// Decodes a manifest from its CMS encoding.
    ///
    /// # Errors
    ///
    /// Any [`ObjectError`] from the CMS layer or the content parse.
    pub fn decode(bytes: Bytes, strict: bool) -> Result<Self, ObjectError> {
        let signed = SignedObject::decode(bytes, &oid::CT_RPKI_MANIFEST, strict)?;
        let (number, validity, files) = Mode::Der
            .decode(signed.content().clone(), |cons| take_content(cons))
            .map_err(|err| ObjectError::malformed("manifest content", err))?;
        Ok(Self {
            signed,
            number,
            validity,
            files,
        })
    }

    /// The CMS envelope (EE certificate, signature verification).
    #[must_use]
    pub fn signed(&self) -> &SignedObject {
        &self.signed
    }

    /// The manifest number as canonical integer octets.
    #[must_use]
    pub fn number(&self) -> &Bytes {
        &self.number
    }

    /// The `thisUpdate`/`nextUpdate` window.
    #[must_use]
    pub fn validity(&self) -> &Validity {
        &self.validity
    }

    /// The listed files.
    #[must_use]
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Looks up an entry by file name.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }
}

type ManifestParts = (Bytes, Validity, Vec<FileEntry>);

fn take_content<S: Source>(
    cons: &mut decode::Constructed<S>,
) -> Result<ManifestParts, DecodeError<S::Error>> {
    cons.take_sequence(|cons| {
        // version [0] EXPLICIT INTEGER DEFAULT 0.
        cons.take_opt_constructed_if(Tag::CTX_0, |cons| cons.skip_u8_if(0))?;
        let number =
            cons.take_primitive_if(Tag::INTEGER, |prim| prim.take_all())?;
        let this_update = Time::take_from(cons)?;
        let next_update = Time::take_from(cons)?;
        let hash_alg = Oid::take_from(cons)?;
        if hash_alg != oid::SHA256 {
            return Err(cons.content_err("manifest hash algorithm is not SHA-256"));
        }
        let mut files = Vec::new();
        cons.take_sequence(|cons| {
            while let Some(entry) = cons.take_opt_sequence(|cons| {
                let name = cons.take_primitive_if(Tag::IA5_STRING, |prim| {
                    let raw = prim.take_all()?;
                    match std::str::from_utf8(raw.as_ref()) {
                        Ok(name) => Ok(name.to_string()),
                        Err(_) => Err(prim.content_err("file name is not ASCII")),
                    }
                })?;
                let hash = cons.take_primitive_if(Tag::BIT_STRING, |prim| {
                    let content = prim.take_all()?;
                    match content.split_first() {
                        Some((0, octets)) if octets.len() == 32 => {
                            Ok(Bytes::copy_from_slice(octets))
                        }
                        _ => Err(prim.content_err("file hash is not a SHA-256 digest")),
                    }
                })?;
                Ok(FileEntry { name, hash })
            })? {
                files.push(entry);
            }
            Ok(())
        })?;
        Ok((number, Validity::new(this_update, next_update), files))
    })
}
