//! RFC 3779 IP and AS resource extensions and their containment algebra.
//!
//! Certificates carry per-family prefix/range sets (or the `inherit`
//! marker); validation needs exactly two operations over them: resolving
//! a child's declared resources against the parent's effective set, and
//! checking that a ROA prefix is covered. Addresses are normalized to
//! inclusive `[min, max]` ranges over a `u128`, left-aligned within the
//! family's bit width, which makes both operations interval arithmetic.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bcder::decode::{self, DecodeError, Source};
use bcder::{BitString, OctetString, Tag};

/// The two address families of the RPKI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4, 32-bit addresses.
    Ipv4,
    /// IPv6, 128-bit addresses.
    Ipv6,
}

impl AddressFamily {
    /// The maximum prefix length of the family.
    #[must_use]
    pub fn max_len(self) -> u8 {
        match self {
            Self::Ipv4 => 32,
            Self::Ipv6 => 128,
        }
    }

    /// Takes the two-octet `addressFamily` value (SAFI octet rejected).
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        let family = OctetString::take_from(cons)?;
        match family.to_bytes().as_ref() {
            [0, 1] => Ok(Self::Ipv4),
            [0, 2] => Ok(Self::Ipv6),
            _ => Err(cons.content_err("unrecognized address family")),
        }
    }
}

/// Masks the low `n` bits of a `u128`.
fn mask_low(n: u32) -> u128 {
    if n >= 128 {
        u128::MAX
    } else {
        (1u128 << n) - 1
    }
}

/// An address prefix within one family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Prefix {
    family: AddressFamily,
    /// Left-aligned within the family width, low bits zero.
    addr: u128,
    len: u8,
}

impl Prefix {
    /// Builds a prefix from raw parts, zeroing any bits below the length.
    #[must_use]
    pub fn new(family: AddressFamily, addr: u128, len: u8) -> Self {
        let len = len.min(family.max_len());
        let keep = u32::from(family.max_len() - len);
        Self {
            family,
            addr: addr & !mask_low(keep),
            len,
        }
    }

    /// Builds an IPv4 prefix from its address.
    #[must_use]
    pub fn from_v4(addr: Ipv4Addr, len: u8) -> Self {
        Self::new(AddressFamily::Ipv4, u128::from(u32::from(addr)), len)
    }

    /// Builds an IPv6 prefix from its address.
    #[must_use]
    pub fn from_v6(addr: Ipv6Addr, len: u8) -> Self {
        Self::new(AddressFamily::Ipv6, u128::from(addr), len)
    }

    /// Decodes the BIT STRING form: the prefix bits, high bit first.
    ///
    /// Returns `None` when the bits exceed the family width.
    #[must_use]
    pub fn from_bits(
        family: AddressFamily,
        octets: &[u8],
        unused: u8,
    ) -> Option<Self> {
        let total = octets.len().checked_mul(8)?.checked_sub(usize::from(unused))?;
        if total > usize::from(family.max_len()) || octets.len() > 16 {
            return None;
        }
        let mut value: u128 = 0;
        for &b in octets {
            value = (value << 8) | u128::from(b);
        }
        value >>= u32::from(unused);
        let addr = if total == 0 {
            0
        } else {
            value << (u32::from(family.max_len()) - total as u32)
        };
        #[allow(clippy::cast_possible_truncation)]
        Some(Self::new(family, addr, total as u8))
    }

    /// Takes one `IPAddress` BIT STRING from a constructed value.
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
        family: AddressFamily,
    ) -> Result<Self, DecodeError<S::Error>> {
        let bits = BitString::take_from(cons)?;
        Self::from_bits(family, bits.octet_bytes().as_ref(), bits.unused())
            .ok_or_else(|| cons.content_err("address bits exceed family width"))
    }

    /// The family of the prefix.
    #[must_use]
    pub fn family(self) -> AddressFamily {
        self.family
    }

    /// The prefix length.
    #[must_use]
    pub fn len(self) -> u8 {
        self.len
    }

    /// The lowest address of the prefix.
    #[must_use]
    pub fn min(self) -> u128 {
        self.addr
    }

    /// The highest address of the prefix.
    #[must_use]
    pub fn max(self) -> u128 {
        self.addr | mask_low(u32::from(self.family.max_len() - self.len))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            AddressFamily::Ipv4 => {
                #[allow(clippy::cast_possible_truncation)]
                let addr = Ipv4Addr::from(self.addr as u32);
                write!(f, "{addr}/{}", self.len)
            }
            AddressFamily::Ipv6 => {
                let addr = Ipv6Addr::from(self.addr);
                write!(f, "{addr}/{}", self.len)
            }
        }
    }
}

/// An inclusive address range within one family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpRange {
    /// Lowest covered address.
    pub min: u128,
    /// Highest covered address.
    pub max: u128,
}

impl IpRange {
    fn covers(&self, other: &IpRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

/// One family's declared resources: either `inherit` or a range list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpChoice {
    /// Propagate the issuer's resources unchanged.
    Inherit,
    /// An explicit, sorted, merged list of ranges.
    Blocks(Vec<IpRange>),
}

/// The `IPAddrBlocks` extension content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpResources {
    /// IPv4 declaration, if the family is present.
    pub v4: Option<IpChoice>,
    /// IPv6 declaration, if the family is present.
    pub v6: Option<IpChoice>,
}

impl IpResources {
    /// Takes the extension content (the outer SEQUENCE OF family blocks).
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let mut res = IpResources::default();
            while let Some(()) = cons.take_opt_sequence(|cons| {
                let family = AddressFamily::take_from(cons)?;
                let choice = Self::take_choice(cons, family)?;
                let slot = match family {
                    AddressFamily::Ipv4 => &mut res.v4,
                    AddressFamily::Ipv6 => &mut res.v6,
                };
                if slot.is_some() {
                    return Err(cons.content_err("duplicate address family block"));
                }
                *slot = Some(choice);
                Ok(())
            })? {}
            Ok(res)
        })
    }

    fn take_choice<S: Source>(
        cons: &mut decode::Constructed<S>,
        family: AddressFamily,
    ) -> Result<IpChoice, DecodeError<S::Error>> {
        if cons.take_opt_primitive_if(Tag::NULL, |_| Ok(()))?.is_some() {
            return Ok(IpChoice::Inherit);
        }
        let mut ranges = Vec::new();
        cons.take_sequence(|cons| {
            loop {
                // addressPrefix: a bare BIT STRING. The first content
                // octet is the unused-bit count.
                let prefix = cons.take_opt_primitive_if(Tag::BIT_STRING, |prim| {
                    let content = prim.take_all()?;
                    let (&unused, octets) = content
                        .split_first()
                        .ok_or_else(|| prim.content_err("empty bit string"))?;
                    Prefix::from_bits(family, octets, unused)
                        .ok_or_else(|| prim.content_err("address bits exceed family width"))
                })?;
                if let Some(prefix) = prefix {
                    ranges.push(IpRange {
                        min: prefix.min(),
                        max: prefix.max(),
                    });
                    continue;
                }
                // addressRange: min padded with zeros, max padded with ones.
                let range = cons.take_opt_sequence(|cons| {
                    let min = Prefix::take_from(cons, family)?;
                    let max = Prefix::take_from(cons, family)?;
                    Ok(IpRange {
                        min: min.min(),
                        max: max.max(),
                    })
                })?;
                match range {
                    Some(range) => ranges.push(range),
                    None => break,
                }
            }
            Ok(())
        })?;
        Ok(IpChoice::Blocks(normalize_ranges(ranges)))
    }
}

/// Sorts and merges overlapping or adjacent ranges.
fn normalize_ranges(mut ranges: Vec<IpRange>) -> Vec<IpRange> {
    ranges.sort();
    let mut merged: Vec<IpRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if let Some(last) = merged.last_mut() {
            if range.min <= last.max.saturating_add(1) {
                last.max = last.max.max(range.max);
                continue;
            }
        }
        merged.push(range);
    }
    merged
}

/// An inclusive AS number range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AsRange {
    /// Lowest covered AS number.
    pub min: u32,
    /// Highest covered AS number.
    pub max: u32,
}

/// The AS side of the resource declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AsChoice {
    /// Propagate the issuer's AS resources unchanged.
    Inherit,
    /// An explicit, sorted, merged list of ranges.
    Blocks(Vec<AsRange>),
}

/// The `ASIdentifiers` extension content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AsResources {
    /// The `asnum` declaration, if present.
    pub asnum: Option<AsChoice>,
}

pub(crate) fn take_u32<S: Source>(
    cons: &mut decode::Constructed<S>,
) -> Result<u32, DecodeError<S::Error>> {
    cons.take_primitive_if(Tag::INTEGER, |prim| {
        let bytes = prim.take_all()?;
        int_bytes_to_u32(&bytes).ok_or_else(|| prim.content_err("AS number out of range"))
    })
}

fn take_opt_u32<S: Source>(
    cons: &mut decode::Constructed<S>,
) -> Result<Option<u32>, DecodeError<S::Error>> {
    cons.take_opt_primitive_if(Tag::INTEGER, |prim| {
        let bytes = prim.take_all()?;
        int_bytes_to_u32(&bytes).ok_or_else(|| prim.content_err("AS number out of range"))
    })
}

/// Converts canonical DER INTEGER octets to a `u32`.
fn int_bytes_to_u32(bytes: &[u8]) -> Option<u32> {
    let bytes = match bytes {
        [] => return None,
        // A leading zero octet only carries the sign for values with the
        // top bit set.
        [0, rest @ ..] => rest,
        [first, ..] if *first & 0x80 != 0 => return None,
        other => other,
    };
    if bytes.len() > 4 {
        return None;
    }
    let mut value = 0u32;
    for &b in bytes {
        value = (value << 8) | u32::from(b);
    }
    Some(value)
}

impl AsResources {
    /// Takes the extension content.
    pub fn take_from<S: Source>(
        cons: &mut decode::Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let asnum = cons.take_opt_constructed_if(Tag::CTX_0, |cons| {
                if cons.take_opt_primitive_if(Tag::NULL, |_| Ok(()))?.is_some() {
                    return Ok(AsChoice::Inherit);
                }
                let mut ranges = Vec::new();
                cons.take_sequence(|cons| {
                    loop {
                        if let Some(id) = take_opt_u32(cons)? {
                            ranges.push(AsRange { min: id, max: id });
                            continue;
                        }
                        let range = cons.take_opt_sequence(|cons| {
                            let min = take_u32(cons)?;
                            let max = take_u32(cons)?;
                            Ok(AsRange { min, max })
                        })?;
                        match range {
                            Some(range) => ranges.push(range),
                            None => break,
                        }
                    }
                    Ok(())
                })?;
                Ok(AsChoice::Blocks(normalize_as_ranges(ranges)))
            })?;
            // rdi [1] is outside the RPKI profile.
            if cons
                .take_opt_constructed_if(Tag::CTX_1, |cons| cons.capture_all())?
                .is_some()
            {
                return Err(cons.content_err("rdi AS resources outside the RPKI profile"));
            }
            Ok(AsResources { asnum })
        })
    }
}

fn normalize_as_ranges(mut ranges: Vec<AsRange>) -> Vec<AsRange> {
    ranges.sort();
    let mut merged: Vec<AsRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if let Some(last) = merged.last_mut() {
            if range.min <= last.max.saturating_add(1) {
                last.max = last.max.max(range.max);
                continue;
            }
        }
        merged.push(range);
    }
    merged
}

/// A fully resolved resource set: inheritance already applied.
///
/// This is what the validator threads down the chain; the root starts
/// from the trust anchor's declared resources (or, for a
/// zero-information anchor, [`ResourceSet::all`]).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceSet {
    /// IPv4 ranges.
    pub v4: Vec<IpRange>,
    /// IPv6 ranges.
    pub v6: Vec<IpRange>,
    /// AS number ranges.
    pub asns: Vec<AsRange>,
}

impl ResourceSet {
    /// The set covering every address and AS number.
    #[must_use]
    pub fn all() -> Self {
        Self {
            v4: vec![IpRange {
                min: 0,
                max: mask_low(32),
            }],
            v6: vec![IpRange {
                min: 0,
                max: u128::MAX,
            }],
            asns: vec![AsRange {
                min: 0,
                max: u32::MAX,
            }],
        }
    }

    /// Resolves a child certificate's declaration against this set.
    ///
    /// `inherit` (and an absent family) propagates the corresponding part
    /// of `self`; explicit blocks must be subsets or the child over-claims
    /// and `None` is returned. An absent family in the child resolves to
    /// empty only when the child declared the other pieces explicitly —
    /// the RPKI treats a missing family block as "no resources of that
    /// family", never as an implicit inherit.
    #[must_use]
    pub fn resolve_child(
        &self,
        ip: &IpResources,
        asres: &AsResources,
    ) -> Option<ResourceSet> {
        let v4 = match &ip.v4 {
            None => Vec::new(),
            Some(IpChoice::Inherit) => self.v4.clone(),
            Some(IpChoice::Blocks(blocks)) => {
                if !ranges_subset(blocks, &self.v4) {
                    return None;
                }
                blocks.clone()
            }
        };
        let v6 = match &ip.v6 {
            None => Vec::new(),
            Some(IpChoice::Inherit) => self.v6.clone(),
            Some(IpChoice::Blocks(blocks)) => {
                if !ranges_subset(blocks, &self.v6) {
                    return None;
                }
                blocks.clone()
            }
        };
        let asns = match &asres.asnum {
            None => Vec::new(),
            Some(AsChoice::Inherit) => self.asns.clone(),
            Some(AsChoice::Blocks(blocks)) => {
                if !as_ranges_subset(blocks, &self.asns) {
                    return None;
                }
                blocks.clone()
            }
        };
        Some(ResourceSet { v4, v6, asns })
    }

    /// Whether a prefix of either family is covered by this set.
    #[must_use]
    pub fn covers_prefix(&self, prefix: Prefix) -> bool {
        let ranges = match prefix.family() {
            AddressFamily::Ipv4 => &self.v4,
            AddressFamily::Ipv6 => &self.v6,
        };
        let target = IpRange {
            min: prefix.min(),
            max: prefix.max(),
        };
        ranges.iter().any(|r| r.covers(&target))
    }
}

/// Every range in `inner` is covered by some range in `outer`.
///
/// Both lists are normalized, so a single covering range suffices per
/// element.
fn ranges_subset(inner: &[IpRange], outer: &[IpRange]) -> bool {
    inner
        .iter()
        .all(|i| outer.iter().any(|o| o.covers(i)))
}

fn as_ranges_subset(inner: &[AsRange], outer: &[AsRange]) -> bool {
    inner
        .iter()
        .all(|i| outer.iter().any(|o| o.min <= i.min && i.max <= o.max))
}
