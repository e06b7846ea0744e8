//! Fixed-width capability bit vectors (spec.md §3, "Capability set").
//!
//! A [`CapabilitySet`] is a fixed-width set of bits, one per storage
//! operation. Root contexts hold the maximal set; child contexts hold a
//! further reduction obtained by bitwise-AND with a caller-supplied mask.
//! The crate-wide invariant is that a child's capability set is always a
//! subset of its parent's.

use bit_vec::BitVec;

/// Number of distinct storage capability bits, one per data-service
/// operation named in spec.md §4.D plus the lifecycle operations of §4.D's
/// "Root/child lifecycle" paragraph.
pub const CAPABILITY_BITS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Capability {
    RootContextCreate = 0,
    RootContextReduceCaps = 1,
    ChildContextCreate = 2,
    ChildContextClose = 3,
    GlobalSettingRead = 4,
    GlobalSettingWrite = 5,
    TransactionSubmit = 6,
    TransactionGetFirst = 7,
    TransactionGet = 8,
    TransactionDrop = 9,
    TransactionPromote = 10,
    BlockMake = 11,
    BlockRead = 12,
    BlockIdByHeightRead = 13,
    LatestBlockIdRead = 14,
    BlockTransactionRead = 15,
    CanonizedTransactionRead = 16,
    ArtifactRead = 17,
}

/// A fixed-width bit vector of granted capabilities.
///
/// Cloning is cheap (a `BitVec` over `CAPABILITY_BITS` bits, one machine
/// word on 64-bit targets) so contexts can hold an owned copy rather than a
/// reference into their parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet(BitVec);

impl CapabilitySet {
    /// The empty set: no operation permitted.
    pub fn none() -> Self {
        Self(BitVec::from_elem(CAPABILITY_BITS, false))
    }

    /// The maximal set: every operation permitted. Used for the root
    /// context created by `ROOT_CONTEXT_CREATE`.
    pub fn all() -> Self {
        Self(BitVec::from_elem(CAPABILITY_BITS, true))
    }

    pub fn from_bits(bits: &[bool]) -> Self {
        let mut v = BitVec::from_elem(CAPABILITY_BITS, false);
        for (i, b) in bits.iter().enumerate().take(CAPABILITY_BITS) {
            v.set(i, *b);
        }
        Self(v)
    }

    /// Decode a capability mask from its wire form: a sequence of u32 words,
    /// little bit first, as sent by `ROOT_CONTEXT_REDUCE_CAPS` /
    /// `CHILD_CONTEXT_CREATE` (`original_source`'s `dataservice_api.h`
    /// `caps` out-parameter).
    pub fn from_words(words: &[u32]) -> Self {
        let mut v = BitVec::from_elem(CAPABILITY_BITS, false);
        for i in 0..CAPABILITY_BITS {
            let word = i / 32;
            let bit = i % 32;
            if let Some(w) = words.get(word) {
                if (w >> bit) & 1 == 1 {
                    v.set(i, true);
                }
            }
        }
        Self(v)
    }

    pub fn to_words(&self) -> Vec<u32> {
        let num_words = (CAPABILITY_BITS + 31) / 32;
        let mut words = vec![0u32; num_words];
        for i in 0..CAPABILITY_BITS {
            if self.0[i] {
                words[i / 32] |= 1 << (i % 32);
            }
        }
        words
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.0[cap as usize]
    }

    /// Reduce this set by bitwise-AND with `mask`, returning a new set.
    ///
    /// Invariant (spec.md §8): `reduce(reduce(caps, m1), m2) ==
    /// reduce(caps, m1 & m2)`, verified below.
    pub fn reduce(&self, mask: &CapabilitySet) -> Self {
        let mut v = self.0.clone();
        v.and(&mask.0);
        Self(v)
    }

    /// Whether `self` is a subset of `parent` — the invariant every child
    /// context must uphold with respect to its parent at all times.
    pub fn is_subset_of(&self, parent: &CapabilitySet) -> bool {
        let mut check = self.0.clone();
        check.and(&parent.0);
        check == self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_is_associative_with_and() {
        let caps = CapabilitySet::all();
        let m1 = CapabilitySet::from_words(&[0b1010_1010]);
        let m2 = CapabilitySet::from_words(&[0b1100_1100]);

        let lhs = caps.reduce(&m1).reduce(&m2);
        let combined = m1.reduce(&m2);
        let rhs = caps.reduce(&combined);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn reduced_set_is_subset_of_parent() {
        let caps = CapabilitySet::all();
        let mask = CapabilitySet::from_words(&[0xFF]);
        let child = caps.reduce(&mask);
        assert!(child.is_subset_of(&caps));
    }

    #[test]
    fn words_round_trip() {
        let words = [0xDEAD_BEEFu32, 0x1];
        let set = CapabilitySet::from_words(&words);
        // Only the first CAPABILITY_BITS bits survive the round trip.
        let back = set.to_words();
        let mask = CapabilitySet::from_words(&back);
        assert_eq!(set, mask);
    }

    #[test]
    fn capability_bit_is_queryable() {
        let all = CapabilitySet::all();
        assert!(all.has(Capability::BlockMake));
        let none = CapabilitySet::none();
        assert!(!none.has(Capability::BlockMake));
    }
}
