//! Object identifiers used by the RPKI profile.
//!
//! Encoded forms only; the comment on each constant gives the dotted
//! notation.

use bcder::Oid;

/// A const-friendly OID over a static byte slice.
pub type ConstOid = Oid<&'static [u8]>;

// --- Access descriptions (RFC 6487) ---

/// `id-ad-caRepository` (1.3.6.1.5.5.7.48.5), the rsync publication point.
pub const AD_CA_REPOSITORY: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 48, 5]);

/// `id-ad-rpkiManifest` (1.3.6.1.5.5.7.48.10), the manifest of a CA.
pub const AD_RPKI_MANIFEST: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 48, 10]);

/// `id-ad-signedObject` (1.3.6.1.5.5.7.48.11), an EE certificate's object.
pub const AD_SIGNED_OBJECT: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 48, 11]);

/// `id-ad-rpkiNotify` (1.3.6.1.5.5.7.48.13), the RRDP notification URI.
pub const AD_RPKI_NOTIFY: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 48, 13]);

/// `id-ad-caIssuers` (1.3.6.1.5.5.7.48.2), parent certificate location.
pub const AD_CA_ISSUERS: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 48, 2]);

// --- Certificate extensions ---

/// `basicConstraints` (2.5.29.19).
pub const CE_BASIC_CONSTRAINTS: ConstOid = Oid(&[85, 29, 19]);

/// `subjectKeyIdentifier` (2.5.29.14).
pub const CE_SUBJECT_KEY_ID: ConstOid = Oid(&[85, 29, 14]);

/// `authorityKeyIdentifier` (2.5.29.35).
pub const CE_AUTHORITY_KEY_ID: ConstOid = Oid(&[85, 29, 35]);

/// `keyUsage` (2.5.29.15).
pub const CE_KEY_USAGE: ConstOid = Oid(&[85, 29, 15]);

/// `extendedKeyUsage` (2.5.29.37).
pub const CE_EXTENDED_KEY_USAGE: ConstOid = Oid(&[85, 29, 37]);

/// `cRLDistributionPoints` (2.5.29.31).
pub const CE_CRL_DISTRIBUTION_POINTS: ConstOid = Oid(&[85, 29, 31]);

/// `certificatePolicies` (2.5.29.32).
pub const CE_CERTIFICATE_POLICIES: ConstOid = Oid(&[85, 29, 32]);

/// `cRLNumber` (2.5.29.20).
pub const CE_CRL_NUMBER: ConstOid = Oid(&[85, 29, 20]);

/// `authorityInfoAccess` (1.3.6.1.5.5.7.1.1).
pub const PE_AUTHORITY_INFO_ACCESS: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 1, 1]);

/// `subjectInfoAccess` (1.3.6.1.5.5.7.1.11).
pub const PE_SUBJECT_INFO_ACCESS: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 1, 11]);

/// `ipAddrBlocks` (1.3.6.1.5.5.7.1.7), RFC 3779 IP resources.
pub const PE_IP_ADDR_BLOCKS: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 1, 7]);

/// `autonomousSysIds` (1.3.6.1.5.5.7.1.8), RFC 3779 AS resources.
pub const PE_AUTONOMOUS_SYS_IDS: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 1, 8]);

// --- Algorithms ---

/// `rsaEncryption` (1.2.840.113549.1.1.1).
pub const RSA_ENCRYPTION: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 1]);

/// `sha256WithRSAEncryption` (1.2.840.113549.1.1.11).
pub const SHA256_WITH_RSA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 11]);

/// `id-sha256` (2.16.840.1.101.3.4.2.1).
pub const SHA256: ConstOid = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 1]);

// --- CMS (RFC 5652 / RFC 6488) ---

/// `id-data` (1.2.840.113549.1.7.1).
pub const CT_DATA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 7, 1]);

/// `id-signedData` (1.2.840.113549.1.7.2).
pub const CT_SIGNED_DATA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 7, 2]);

/// `id-contentType` signed attribute (1.2.840.113549.1.9.3).
pub const AA_CONTENT_TYPE: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 3]);

/// `id-messageDigest` signed attribute (1.2.840.113549.1.9.4).
pub const AA_MESSAGE_DIGEST: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 4]);

/// `id-signingTime` signed attribute (1.2.840.113549.1.9.5).
pub const AA_SIGNING_TIME: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 5]);

/// `id-aa-binarySigningTime` (1.2.840.113549.1.9.16.2.46).
pub const AA_BINARY_SIGNING_TIME: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 16, 2, 46]);

/// `id-ct-routeOriginAuthz` (1.2.840.113549.1.9.16.1.24).
pub const CT_ROUTE_ORIGIN_AUTHZ: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 16, 1, 24]);

/// `id-ct-rpkiManifest` (1.2.840.113549.1.9.16.1.26).
pub const CT_RPKI_MANIFEST: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 16, 1, 26]);

/// `id-ct-rpkiGhostbusters` (1.2.840.113549.1.9.16.1.35).
pub const CT_RPKI_GHOSTBUSTERS: ConstOid =
    Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 16, 1, 35]);
