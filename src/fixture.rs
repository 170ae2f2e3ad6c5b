// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Benchmark fixtures: the same integer sequence materialized in two
//! physical layouts, a contiguous array and a chain of boxed nodes.

/// Canonical fixture length: the benchmark sums the squares of the first
/// million integers.
pub const FIXTURE_LEN: usize = 1_000_000;

/// The two fixture sequences for one measurement lifecycle.
///
/// Both containers hold identical contents (`0..len` in ascending order);
/// they differ only in physical layout and traversal cost profile. Fixtures
/// are immutable once built and shared read-only across all invocations of
/// the lifecycle.
pub struct Fixtures {
    /// Contiguous sequence with O(1) indexed access.
    pub array: Vec<i32>,
    /// Linked sequence supporting only sequential traversal.
    pub chain: ChainSequence,
}

impl Fixtures {
    /// Builds both sequences, appending the integers `0..len` in increasing
    /// order to each container.
    ///
    /// Construction cannot fail: running out of memory aborts the process,
    /// it isn't a reported error.
    pub fn build(len: usize) -> Self {
        log::debug!("[fixtures] building 2 sequences of {len} elements");
        let array = (0..len as i32).collect::<Vec<i32>>();
        let chain = (0..len as i32).collect::<ChainSequence>();
        Self { array, chain }
    }
}

/// An ordered sequence of integers stored as a chain of individually boxed
/// nodes.
///
/// Indexed access is O(n); the only efficient operation is walking the chain
/// front to back. This is the deliberately cache-unfriendly counterpart to
/// the array fixture.
pub struct ChainSequence {
    head: Option<Box<Node>>,
    len: usize,
}

struct Node {
    value: i32,
    next: Option<Box<Node>>,
}

impl ChainSequence {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Returns the number of nodes in the chain.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the chain contains no nodes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns an iterator over the values in the chain, front to back.
    pub fn iter(&self) -> ChainValues<'_> {
        ChainValues {
            node: self.head.as_deref(),
            remaining: self.len,
        }
    }

    /// Fans the chain out into at most `max_chunks` contiguous windows of
    /// near-equal length, covering the whole chain in order.
    ///
    /// Finding the window boundaries requires walking the entire chain once,
    /// an O(n) pointer chase. That cost is inherent to splitting a linked
    /// layout and is intentionally part of what parallel chain reductions
    /// measure.
    pub fn slices(&self, max_chunks: usize) -> Vec<ChainSlice<'_>> {
        assert!(max_chunks > 0, "cannot fan out into zero chunks");
        if self.len == 0 {
            return Vec::new();
        }
        let chunk_len = self.len.div_ceil(max_chunks);
        let mut slices = Vec::with_capacity(self.len.div_ceil(chunk_len));
        let mut cursor = self.head.as_deref();
        let mut remaining = self.len;
        while remaining > 0 {
            let len = chunk_len.min(remaining);
            slices.push(ChainSlice { head: cursor, len });
            for _ in 0..len {
                cursor = cursor.and_then(|node| node.next.as_deref());
            }
            remaining -= len;
        }
        slices
    }
}

impl Default for ChainSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<i32> for ChainSequence {
    /// Builds a chain by appending each value at the tail, preserving
    /// iteration order.
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        let mut chain = Self::new();
        let mut tail = &mut chain.head;
        for value in iter {
            let node = tail.insert(Box::new(Node { value, next: None }));
            tail = &mut node.next;
            chain.len += 1;
        }
        chain
    }
}

impl Drop for ChainSequence {
    /// Unlinks the nodes iteratively. The derived recursive drop would
    /// overflow the stack on a million-node chain.
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

/// A contiguous window into a [`ChainSequence`], produced by
/// [`ChainSequence::slices()`].
#[derive(Clone, Copy)]
pub struct ChainSlice<'a> {
    head: Option<&'a Node>,
    len: usize,
}

impl<'a> ChainSlice<'a> {
    /// Returns an iterator over the values in this window.
    pub fn values(&self) -> ChainValues<'a> {
        ChainValues {
            node: self.head,
            remaining: self.len,
        }
    }

    /// Returns the number of values in this window.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether this window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Iterator over the values of a chain or a chain window.
pub struct ChainValues<'a> {
    node: Option<&'a Node>,
    remaining: usize,
}

impl Iterator for ChainValues<'_> {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.node?;
        self.remaining -= 1;
        self.node = node.next.as_deref();
        Some(node.value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ChainValues<'_> {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fixtures_have_identical_contents() {
        for len in [0, 1, 2, 10, 1000] {
            let fixtures = Fixtures::build(len);
            assert_eq!(fixtures.array.len(), len);
            assert_eq!(fixtures.chain.len(), len);
            assert!(fixtures
                .array
                .iter()
                .copied()
                .eq(fixtures.chain.iter()));
        }
    }

    #[test]
    fn test_fixtures_are_ascending() {
        let fixtures = Fixtures::build(100);
        assert!(fixtures.array.iter().copied().eq(0..100));
        assert!(fixtures.chain.iter().eq(0..100));
    }

    #[test]
    fn test_chain_from_iterator_preserves_order() {
        let chain = [3, 1, 4, 1, 5].into_iter().collect::<ChainSequence>();
        assert_eq!(chain.len(), 5);
        assert_eq!(chain.iter().collect::<Vec<i32>>(), vec![3, 1, 4, 1, 5]);
    }

    #[test]
    fn test_empty_chain() {
        let chain = ChainSequence::new();
        assert!(chain.is_empty());
        assert_eq!(chain.iter().next(), None);
        assert_eq!(chain.slices(4).len(), 0);
    }

    #[test]
    fn test_chain_iterator_is_exact_size() {
        let chain = (0..10).collect::<ChainSequence>();
        let mut values = chain.iter();
        assert_eq!(values.len(), 10);
        values.next();
        assert_eq!(values.len(), 9);
    }

    #[test]
    fn test_slices_partition_the_chain() {
        let chain = (0..100).collect::<ChainSequence>();
        for max_chunks in [1, 2, 3, 4, 7, 99, 100, 1000] {
            let slices = chain.slices(max_chunks);
            assert!(slices.len() <= max_chunks);
            assert_eq!(slices.iter().map(ChainSlice::len).sum::<usize>(), 100);
            // Concatenating the windows in order yields the whole chain.
            assert!(slices
                .iter()
                .flat_map(ChainSlice::values)
                .eq(chain.iter()));
        }
    }

    #[test]
    fn test_slices_are_balanced() {
        let chain = (0..10).collect::<ChainSequence>();
        let slices = chain.slices(4);
        assert_eq!(
            slices.iter().map(ChainSlice::len).collect::<Vec<usize>>(),
            vec![3, 3, 3, 1]
        );
    }

    #[test]
    #[should_panic(expected = "cannot fan out into zero chunks")]
    fn test_slices_zero_chunks() {
        let chain = (0..10).collect::<ChainSequence>();
        chain.slices(0);
    }

    #[test]
    fn test_million_node_chain_drops_without_overflow() {
        // Exercises the iterative drop; a recursive drop would overflow the
        // stack long before a million nodes.
        let chain = (0..FIXTURE_LEN as i32).collect::<ChainSequence>();
        assert_eq!(chain.len(), FIXTURE_LEN);
        drop(chain);
    }
}
