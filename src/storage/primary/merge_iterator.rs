// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::cmp::Ordering;

use itertools::Itertools;

use super::primary_key_encoder::{EncodedKey, PrimaryKeyEncoder};
use crate::array::{ArrayBuilderImpl, ArrayImplBuilderPickExt, DataChunk};
use crate::storage::{ChunkIterator, StorageResult, TracedStorageError};

/// Largest batch a child of a merge iterator may return.
pub const MAX_CHILD_BATCH_ROWS: usize = 65536;

/// Where one merged row came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowSourceMask {
    /// Index of the child iterator.
    pub source: u16,
    /// Set when the row has the same key as the row before it.
    pub agg_flag: bool,
}

impl RowSourceMask {
    pub fn new(source: u16, agg_flag: bool) -> Self {
        Self { source, agg_flag }
    }
}

struct ChildBuffer {
    chunk: DataChunk,
    keys: Vec<EncodedKey>,
}

fn check_children(n: usize) -> StorageResult<()> {
    if n > u16::MAX as usize + 1 {
        return Err(TracedStorageError::invalid_argument(format!(
            "cannot merge {n} iterators"
        )));
    }
    Ok(())
}

fn check_batch(chunk: &DataChunk) -> StorageResult<()> {
    if chunk.cardinality() > MAX_CHILD_BATCH_ROWS {
        return Err(TracedStorageError::invalid_argument(format!(
            "child batch of {} rows exceeds {MAX_CHILD_BATCH_ROWS}",
            chunk.cardinality()
        )));
    }
    Ok(())
}

/// Build a chunk from `(buffer, row)` picks. Every referenced buffer must be present.
fn pick_chunk(buffers: &[Option<&DataChunk>], picks: &[(usize, usize)]) -> StorageResult<DataChunk> {
    // compact the present buffers so `pick_from_multiple` only sees real arrays
    let mut remap = vec![usize::MAX; buffers.len()];
    let mut present = vec![];
    for (i, chunk) in buffers.iter().enumerate() {
        if let Some(chunk) = chunk {
            remap[i] = present.len();
            present.push(*chunk);
        }
    }
    let Some(reference) = present.first() else {
        return Err(TracedStorageError::internal("merge without buffered data"));
    };
    let picks = picks.iter().map(|(i, row)| (remap[*i], *row)).collect_vec();
    Ok((0..reference.column_count())
        .map(|col| {
            let mut builder = ArrayBuilderImpl::from_type_of_array(reference.array_at(col));
            let arrays = present.iter().map(|c| c.array_at(col)).collect_vec();
            builder.pick_from_multiple(&arrays, &picks);
            builder.finish()
        })
        .collect())
}

/// Merges key-sorted children into one key-sorted stream.
///
/// Rows with equal keys are returned in child order.
pub struct HeapMergeIterator {
    children: Vec<Box<dyn ChunkIterator>>,

    buffers: Vec<Option<ChildBuffer>>,

    finished: Vec<bool>,

    num_key_columns: usize,

    /// The min-heap of all pending data. Each element is `(child, row)`, and there is
    /// at most one element per child.
    heap: Vec<(usize, usize)>,

    /// Key of the last row returned, to compute `agg_flag`.
    last_key: Option<EncodedKey>,
}

impl HeapMergeIterator {
    pub fn new(children: Vec<Box<dyn ChunkIterator>>, num_key_columns: usize) -> StorageResult<Self> {
        check_children(children.len())?;
        Ok(Self {
            buffers: (0..children.len()).map(|_| None).collect(),
            finished: vec![false; children.len()],
            children,
            num_key_columns,
            heap: vec![],
            last_key: None,
        })
    }

    fn key(&self, (child, row): (usize, usize)) -> &[u8] {
        self.buffers[child]
            .as_ref()
            .map_or(&[][..], |b| b.keys[row].as_slice())
    }

    fn compare_in_heap(&self, left: usize, right: usize) -> Ordering {
        let (l, r) = (self.heap[left], self.heap[right]);
        self.key(l).cmp(self.key(r)).then(l.0.cmp(&r.0))
    }

    fn add_pending_data(&mut self, item: (usize, usize)) {
        self.heap.push(item);
        let mut pos = self.heap.len() - 1;
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.compare_in_heap(parent, pos) == Ordering::Greater {
                self.heap.swap(parent, pos);
                pos = parent;
            } else {
                break;
            }
        }
    }

    /// Pop the root and insert `item`, sifting it down from the top. When children
    /// barely overlap the new item stays at the root and this costs two compares.
    fn replace_pending_data(&mut self, item: (usize, usize)) -> (usize, usize) {
        let popped = std::mem::replace(&mut self.heap[0], item);
        let mut pos = 0;
        loop {
            let left = pos * 2 + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut selected = left;
            if right < self.heap.len() && self.compare_in_heap(left, right) == Ordering::Greater {
                selected = right;
            }
            if self.compare_in_heap(pos, selected) != Ordering::Greater {
                break;
            }
            self.heap.swap(pos, selected);
            pos = selected;
        }
        popped
    }

    fn pop_pending_data(&mut self) -> Option<(usize, usize)> {
        let last = self.heap.pop()?;
        if self.heap.is_empty() {
            Some(last)
        } else {
            Some(self.replace_pending_data(last))
        }
    }

    /// Fill the buffer of `child`. Returns `false` once the child is drained.
    fn fill_buffer(&mut self, child: usize, expected_size: Option<usize>) -> StorageResult<bool> {
        while !self.finished[child] {
            match self.children[child].next_batch(expected_size)? {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => {
                    check_batch(&chunk)?;
                    let keys = PrimaryKeyEncoder::encode_chunk(&chunk, self.num_key_columns)?;
                    self.buffers[child] = Some(ChildBuffer { chunk, keys });
                    return Ok(true);
                }
                None => self.finished[child] = true,
            }
        }
        Ok(false)
    }

    /// Merge a batch from the children. A batch is returned when:
    ///
    /// * `expected_size` rows are fetched.
    /// * The buffered batch of any child has been consumed.
    ///
    /// When `masks` is given, the source of every returned row is appended to it.
    pub fn next_batch(
        &mut self,
        expected_size: Option<usize>,
        masks: Option<&mut Vec<RowSourceMask>>,
    ) -> StorageResult<Option<DataChunk>> {
        for child in 0..self.children.len() {
            if self.buffers[child].is_none() && self.fill_buffer(child, expected_size)? {
                self.add_pending_data((child, 0));
            }
        }
        if self.heap.is_empty() {
            return Ok(None);
        }

        let mut picks = vec![];
        let mut exhausted = None;
        loop {
            if expected_size.is_some_and(|size| picks.len() >= size) {
                break;
            }
            let (child, row) = self.heap[0];
            let len = self.buffers[child].as_ref().map_or(0, |b| b.keys.len());
            if row + 1 < len {
                picks.push(self.replace_pending_data((child, row + 1)));
            } else {
                picks.extend(self.pop_pending_data());
                exhausted = Some(child);
                break;
            }
        }

        if let Some(masks) = masks {
            for pick in &picks {
                let key = self.key(*pick).to_vec();
                let agg_flag = self.last_key.as_ref() == Some(&key);
                masks.push(RowSourceMask::new(pick.0 as u16, agg_flag));
                self.last_key = Some(key);
            }
        }

        let buffers = self
            .buffers
            .iter()
            .map(|b| b.as_ref().map(|b| &b.chunk))
            .collect_vec();
        let chunk = pick_chunk(&buffers, &picks)?;

        if let Some(child) = exhausted {
            self.buffers[child] = None;
        }
        Ok(Some(chunk))
    }
}

impl ChunkIterator for HeapMergeIterator {
    fn next_batch(&mut self, expected_size: Option<usize>) -> StorageResult<Option<DataChunk>> {
        HeapMergeIterator::next_batch(self, expected_size, None)
    }
}

/// Replays a recorded sequence of [`RowSourceMask`]s over the same children, e.g. to
/// read value columns in the order the key columns were merged.
pub struct MaskMergeIterator {
    children: Vec<Box<dyn ChunkIterator>>,
    /// Buffered batch and read position of each child.
    buffers: Vec<Option<(DataChunk, usize)>>,
    masks: Vec<RowSourceMask>,
    mask_pos: usize,
}

impl MaskMergeIterator {
    pub fn new(children: Vec<Box<dyn ChunkIterator>>, masks: Vec<RowSourceMask>) -> StorageResult<Self> {
        check_children(children.len())?;
        Ok(Self {
            buffers: (0..children.len()).map(|_| None).collect(),
            children,
            masks,
            mask_pos: 0,
        })
    }

    fn ensure_buffer(&mut self, child: usize, expected_size: Option<usize>) -> StorageResult<()> {
        if matches!(&self.buffers[child], Some((chunk, pos)) if *pos < chunk.cardinality()) {
            return Ok(());
        }
        loop {
            match self.children[child].next_batch(expected_size)? {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => {
                    check_batch(&chunk)?;
                    self.buffers[child] = Some((chunk, 0));
                    return Ok(());
                }
                None => {
                    return Err(TracedStorageError::invalid_argument(format!(
                        "mask {} refers to drained source {child}",
                        self.mask_pos
                    )))
                }
            }
        }
    }
}

impl ChunkIterator for MaskMergeIterator {
    fn next_batch(&mut self, expected_size: Option<usize>) -> StorageResult<Option<DataChunk>> {
        let mut picks = vec![];
        let mut exhausted = None;
        while self.mask_pos < self.masks.len() {
            if expected_size.is_some_and(|size| picks.len() >= size) {
                break;
            }
            let child = self.masks[self.mask_pos].source as usize;
            if child >= self.children.len() {
                return Err(TracedStorageError::invalid_argument(format!(
                    "mask source {child} out of {} children",
                    self.children.len()
                )));
            }
            self.ensure_buffer(child, expected_size)?;
            let Some((chunk, pos)) = &mut self.buffers[child] else {
                return Err(TracedStorageError::internal("mask merge lost its buffer"));
            };
            picks.push((child, *pos));
            *pos += 1;
            self.mask_pos += 1;
            if *pos == chunk.cardinality() {
                exhausted = Some(child);
                break;
            }
        }
        if picks.is_empty() {
            return Ok(None);
        }

        let buffers = self
            .buffers
            .iter()
            .map(|b| b.as_ref().map(|(chunk, _)| chunk))
            .collect_vec();
        let chunk = pick_chunk(&buffers, &picks)?;
        if let Some(child) = exhausted {
            self.buffers[child] = None;
        }
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayImpl, ArrayToVecExt, I32Array};
    use crate::storage::primary::test_util::TestIterator;

    fn keys(v: &[i32]) -> DataChunk {
        [ArrayImpl::Int32(v.iter().copied().collect())].into_iter().collect()
    }

    fn rows(v: &[(i32, i32)]) -> DataChunk {
        [
            ArrayImpl::Int32(v.iter().map(|r| r.0).collect()),
            ArrayImpl::Int32(v.iter().map(|r| r.1).collect()),
        ]
        .into_iter()
        .collect()
    }

    fn to_vec(chunk: &DataChunk, col: usize) -> Vec<i32> {
        let array: &I32Array = chunk.array_at(col).try_into().unwrap();
        array.to_vec().into_iter().flatten().collect()
    }

    #[test]
    fn test_merge_iterator_one_iter() {
        let iter = TestIterator::new(vec![keys(&[1, 2, 3]), keys(&[6])]);
        let mut merge = HeapMergeIterator::new(vec![Box::new(iter)], 1).unwrap();
        let batch = merge.next_batch(Some(1), None).unwrap().unwrap();
        assert_eq!(to_vec(&batch, 0), vec![1]);
        let batch = merge.next_batch(Some(2), None).unwrap().unwrap();
        assert_eq!(to_vec(&batch, 0), vec![2, 3]);
        let batch = merge.next_batch(None, None).unwrap().unwrap();
        assert_eq!(to_vec(&batch, 0), vec![6]);
        assert!(merge.next_batch(None, None).unwrap().is_none());
    }

    #[test]
    fn test_merge_iterator_two_iter_with_masks() {
        let iter1 = TestIterator::new(vec![keys(&[1, 2, 4, 6]), keys(&[8])]);
        let iter2 = TestIterator::new(vec![keys(&[3, 4, 5]), keys(&[7, 9])]);
        let mut merge = HeapMergeIterator::new(vec![Box::new(iter1), Box::new(iter2)], 1).unwrap();
        let mut masks = vec![];
        let answers = vec![vec![1, 2, 3, 4, 4, 5], vec![6], vec![7, 8], vec![9]];
        for answer in answers {
            let batch = merge.next_batch(None, Some(&mut masks)).unwrap().unwrap();
            assert_eq!(to_vec(&batch, 0), answer);
        }
        assert!(merge.next_batch(None, Some(&mut masks)).unwrap().is_none());
        let sources = masks.iter().map(|m| m.source).collect_vec();
        assert_eq!(sources, vec![0, 0, 1, 0, 1, 1, 0, 1, 0, 1]);
        assert!(masks[4].agg_flag);
        assert_eq!(masks.iter().filter(|m| m.agg_flag).count(), 1);
    }

    #[test]
    fn test_mask_merge_replays_order() {
        let children = || -> Vec<Box<dyn ChunkIterator>> {
            vec![
                Box::new(TestIterator::new(vec![rows(&[(1, 10), (4, 40)])])),
                Box::new(TestIterator::new(vec![rows(&[(2, 20)]), rows(&[(3, 30)])])),
            ]
        };
        let mut merge = HeapMergeIterator::new(children(), 1).unwrap();
        let mut masks = vec![];
        while merge.next_batch(None, Some(&mut masks)).unwrap().is_some() {}

        let mut replay = MaskMergeIterator::new(children(), masks).unwrap();
        let mut values = vec![];
        while let Some(batch) = replay.next_batch(Some(3)).unwrap() {
            values.extend(to_vec(&batch, 1));
        }
        assert_eq!(values, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_reject_oversized_child_batch() {
        let big = keys(&(0..MAX_CHILD_BATCH_ROWS as i32 + 1).collect_vec());
        let mut merge = HeapMergeIterator::new(vec![Box::new(TestIterator::new(vec![big]))], 1).unwrap();
        assert!(merge.next_batch(None, None).is_err());
    }
}
