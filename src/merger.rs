//! Binary heap merger.

use std::cmp::Ordering;
use std::collections::binary_heap::{BinaryHeap, PeekMut};

use crate::run::RunId;

/// Sorted source interface used by the merger.
/// A cursor exposes its current item and is consumed one item at a time.
pub trait MergeCursor {
    type Item: Ord;
    type Error;

    /// Identifier of the source. Equal items are emitted in ascending id order.
    fn id(&self) -> RunId;

    /// Returns the current item or [`None`] if the source is exhausted.
    fn peek(&self) -> Option<&Self::Item>;

    /// Returns the current item and moves to the next one.
    fn advance(&mut self) -> Result<Option<Self::Item>, Self::Error>;
}

// binary heap is max-heap by default so the order is reversed to convert it to min-heap
struct HeapEntry<C>(C);

impl<C: MergeCursor> Ord for HeapEntry<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.0.peek(), other.0.id()).cmp(&(self.0.peek(), self.0.id()))
    }
}

impl<C: MergeCursor> PartialOrd for HeapEntry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C: MergeCursor> PartialEq for HeapEntry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<C: MergeCursor> Eq for HeapEntry<C> {}

/// Binary heap merger implementation.
/// Merges multiple sorted cursors into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of cursors (inputs). Only the current item of every cursor is held in memory.
pub struct BinaryHeapMerger<C: MergeCursor> {
    cursors: BinaryHeap<HeapEntry<C>>,
    failed: bool,
}

impl<C: MergeCursor> BinaryHeapMerger<C> {
    /// Creates an instance of a binary heap merger using cursors as inputs.
    /// Cursor items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `cursors` - Cursors to be merged in a single sorted output
    pub fn new<I>(cursors: I) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let cursors = BinaryHeap::from_iter(
            cursors
                .into_iter()
                .filter(|cursor| cursor.peek().is_some())
                .map(HeapEntry),
        );

        return BinaryHeapMerger { cursors, failed: false };
    }

    /// Number of cursors that still have items.
    pub fn active(&self) -> usize {
        self.cursors.len()
    }
}

impl<C: MergeCursor> Iterator for BinaryHeapMerger<C> {
    type Item = Result<C::Item, C::Error>;

    /// Returns the next item from the inputs in ascending order.
    /// After an error is returned the merger yields nothing.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            let mut top = self.cursors.peek_mut()?;
            match top.0.advance() {
                Ok(Some(item)) => {
                    if top.0.peek().is_none() {
                        PeekMut::pop(top);
                    }
                    return Some(Ok(item));
                }
                Ok(None) => {
                    PeekMut::pop(top);
                }
                Err(err) => {
                    PeekMut::pop(top);
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
