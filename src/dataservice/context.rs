//! Root and child context lifecycle (spec.md §3, §4.D "Root/child
//! lifecycle").

use std::collections::HashMap;

use crate::capability::CapabilitySet;
use crate::error::{CoreError, CoreResult};

/// Bounded pool size for child-context indices, matching spec.md §3's "a
/// small integer index from a bounded pool (O(100)s)".
pub const MAX_CHILD_CONTEXTS: u32 = 256;

/// One per data-service process. Owns the root capability bit vector;
/// reduced in place by `ROOT_CONTEXT_REDUCE_CAPS`, which is itself gated by
/// the `RootContextReduceCaps` capability so reduction is idempotent and
/// tamper-evident (spec.md §4.D).
#[derive(Debug)]
pub struct RootContext {
    pub caps: CapabilitySet,
}

impl RootContext {
    pub fn new() -> Self {
        Self {
            caps: CapabilitySet::all(),
        }
    }

    pub fn reduce_caps(&mut self, mask: &CapabilitySet) -> CoreResult<()> {
        if !self.caps.has(crate::capability::Capability::RootContextReduceCaps) {
            return Err(CoreError::from(crate::error::NOT_AUTHORIZED));
        }
        self.caps = self.caps.reduce(mask);
        Ok(())
    }
}

impl Default for RootContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A reduced-capability handle identified by a small integer index
/// (spec.md §3, "Child context").
#[derive(Debug, Clone)]
pub struct ChildContext {
    pub index: u32,
    pub caps: CapabilitySet,
}

/// Allocates and recycles child-context indices out of a bounded pool.
#[derive(Debug, Default)]
pub struct ContextPool {
    contexts: HashMap<u32, ChildContext>,
    free_list: Vec<u32>,
    next_fresh: u32,
}

impl ContextPool {
    pub fn new() -> Self {
        Self {
            contexts: HashMap::new(),
            free_list: Vec::new(),
            next_fresh: 0,
        }
    }

    /// Creates a child context whose capability set is the root's current
    /// caps reduced by `mask`. The new set is, by construction, always a
    /// subset of the root's (spec.md §8 invariant 3).
    pub fn create(&mut self, root: &RootContext, mask: &CapabilitySet) -> CoreResult<u32> {
        let index = if let Some(recycled) = self.free_list.pop() {
            recycled
        } else {
            if self.next_fresh >= MAX_CHILD_CONTEXTS {
                return Err(CoreError::status(
                    crate::error::ServiceTag::DataService,
                    0x0020,
                ));
            }
            let idx = self.next_fresh;
            self.next_fresh += 1;
            idx
        };

        let caps = root.caps.reduce(mask);
        debug_assert!(caps.is_subset_of(&root.caps));
        self.contexts.insert(
            index,
            ChildContext {
                index,
                caps: caps.clone(),
            },
        );
        Ok(index)
    }

    pub fn close(&mut self, index: u32) -> CoreResult<()> {
        if self.contexts.remove(&index).is_none() {
            return Err(CoreError::from(crate::error::NOT_FOUND));
        }
        self.free_list.push(index);
        Ok(())
    }

    pub fn get(&self, index: u32) -> CoreResult<&ChildContext> {
        self.contexts.get(&index).ok_or_else(|| CoreError::from(crate::error::NOT_FOUND))
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilitySet};

    #[test]
    fn child_caps_are_subset_of_root() {
        let root = RootContext::new();
        let mut pool = ContextPool::new();
        let mask = CapabilitySet::from_words(&[0x0F]);
        let idx = pool.create(&root, &mask).unwrap();
        let child = pool.get(idx).unwrap();
        assert!(child.caps.is_subset_of(&root.caps));
    }

    #[test]
    fn closed_index_is_recycled() {
        let root = RootContext::new();
        let mut pool = ContextPool::new();
        let mask = CapabilitySet::all();
        let first = pool.create(&root, &mask).unwrap();
        pool.close(first).unwrap();
        let second = pool.create(&root, &mask).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn closing_unknown_index_is_not_found() {
        let mut pool = ContextPool::new();
        assert!(pool.close(7).is_err());
    }

    #[test]
    fn root_reduce_caps_requires_its_own_capability() {
        let mut root = RootContext::new();
        root.caps = CapabilitySet::none();
        let mask = CapabilitySet::all();
        assert!(root.reduce_caps(&mask).is_err());
    }

    #[test]
    fn root_reduce_caps_shrinks_future_children() {
        let mut root = RootContext::new();
        let narrow = CapabilitySet::from_words(&[0x01]);
        root.reduce_caps(&narrow).unwrap();
        let mut pool = ContextPool::new();
        let idx = pool.create(&root, &CapabilitySet::all()).unwrap();
        let child = pool.get(idx).unwrap();
        assert!(!child.caps.has(Capability::BlockMake));
    }
}
