use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::b_tree_key::KeySlot;
use crate::block_file::BlockPtr;
use crate::data_types::KeyCodec;

/// Locator of a stored row, payload of every leaf entry.
pub type RecordPtr = BlockPtr;

#[derive(Error, Debug)]
pub enum BTreeNodeError {
    #[error("corrupt B-tree node detected: {reason}")]
    CorruptNode { reason: String },
    #[error("key is {actual} bytes long, expected {expected}")]
    KeyWidthMismatch { expected: usize, actual: usize },
    #[error("failed to (de)serialize node: {0}")]
    Serialization(#[from] io::Error),
}

/// Single entry of a leaf node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LeafEntry {
    pub key: KeySlot,
    pub record: RecordPtr,
}

/// Child pointer of an internal node together with its low key: the smallest key in the child's
/// subtree that is strictly greater than every key stored to the left of it ([`KeySlot::Empty`] when
/// the subtree holds nothing but duplicates of that maximum).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChildRef {
    pub low: KeySlot,
    pub ptr: BlockPtr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LeafNode {
    pub entries: Vec<LeafEntry>,
    /// Next leaf in key order.
    pub sibling: Option<BlockPtr>,
}

/// Internal node. `children` always holds `count + 1` items: `count` (separator, child) pairs plus the
/// trailing "last" child, each with its own key slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct InternalNode {
    pub children: Vec<ChildRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

/// Inserts `item` at `pos`, splitting `items` when it already holds `capacity` items. The left part keeps
/// `split_at` items, the returned right part receives the remainder.
fn insert_or_split<T>(
    items: &mut Vec<T>,
    capacity: usize,
    split_at: usize,
    pos: usize,
    item: T,
) -> Option<Vec<T>> {
    items.insert(pos, item);
    if items.len() <= capacity {
        return None;
    }
    Some(items.split_off(split_at))
}

impl LeafNode {
    /// Position of the first entry strictly greater than `key`.
    pub fn upper_bound<C: KeyCodec + ?Sized>(&self, key: &KeySlot, codec: &C) -> usize {
        self.entries
            .iter()
            .position(|entry| key.lt(&entry.key, codec))
            .unwrap_or(self.entries.len())
    }

    /// Position of the first entry not less than `key`.
    pub fn lower_bound<C: KeyCodec + ?Sized>(&self, key: &KeySlot, codec: &C) -> usize {
        self.entries
            .iter()
            .position(|entry| !entry.key.lt(key, codec))
            .unwrap_or(self.entries.len())
    }

    /// Inserts `entry` at `pos`. When the leaf already holds `degree` entries it is split: this node keeps
    /// `degree / 2 + 1` entries and the returned sibling receives the rest along with this node's sibling
    /// link. Linking this node to the new sibling is left to the caller, who allocates its block.
    pub fn insert(&mut self, pos: usize, entry: LeafEntry, degree: usize) -> Option<LeafNode> {
        insert_or_split(&mut self.entries, degree, degree / 2 + 1, pos, entry).map(|entries| {
            LeafNode {
                entries,
                sibling: self.sibling,
            }
        })
    }

    pub fn first_key(&self) -> Option<&KeySlot> {
        self.entries.first().map(|entry| &entry.key)
    }

    pub fn last_key(&self) -> Option<&KeySlot> {
        self.entries.last().map(|entry| &entry.key)
    }

    /// Key pushed to the parent after a split: the first key of `right` that differs from the last key
    /// kept in `self`, skipping the duplicate run the two halves share. `Empty` when `right` is one
    /// duplicate run.
    pub fn propagation_key<C: KeyCodec + ?Sized>(&self, right: &LeafNode, codec: &C) -> KeySlot {
        let Some(last) = self.last_key() else {
            return right.first_key().cloned().unwrap_or(KeySlot::Empty);
        };
        right
            .entries
            .iter()
            .map(|entry| &entry.key)
            .find(|key| key.compare(last, codec) != Some(std::cmp::Ordering::Equal))
            .cloned()
            .unwrap_or(KeySlot::Empty)
    }
}

impl InternalNode {
    /// Number of (separator, child) pairs, the trailing child excluded.
    pub fn count(&self) -> usize {
        self.children.len().saturating_sub(1)
    }

    /// Index of the child to descend into for `key`: the rightmost child whose non-empty low key is
    /// less than or equal to `key`, or the first child when there is none.
    pub fn child_index<C: KeyCodec + ?Sized>(&self, key: &KeySlot, codec: &C) -> usize {
        self.children
            .iter()
            .rposition(|child| !child.low.is_empty() && child.low.le(key, codec))
            .unwrap_or(0)
    }

    /// Inserts `child` at `pos`. When the node already holds `degree` pairs it is split: this node keeps
    /// `degree / 2 + 1` children (the last of them becoming its trailing child) and the returned node
    /// receives the rest, including the original trailing child.
    pub fn insert(&mut self, pos: usize, child: ChildRef, degree: usize) -> Option<InternalNode> {
        insert_or_split(&mut self.children, degree + 1, degree / 2 + 1, pos, child)
            .map(|children| InternalNode { children })
    }

    /// Low key of the whole node: its first non-empty key slot.
    pub fn first_low_key(&self) -> KeySlot {
        self.children
            .iter()
            .map(|child| &child.low)
            .find(|low| !low.is_empty())
            .cloned()
            .unwrap_or(KeySlot::Empty)
    }
}

/// Translates nodes to and from blocks. Every block is sized for `degree` entries regardless of how many
/// are in use.
///
/// Block layout (big-endian):
/// - `is_leaf` (1 byte)
/// - `count` (2 bytes) - entries of a leaf, (separator, child) pairs of an internal node
/// - `trailing` (8 bytes) - sibling pointer of a leaf, last child of an internal node, 0 when none
/// - `pointers` (`degree` * 8 bytes) - record locators of a leaf, children of an internal node
/// - `options` (`degree + 1` bytes) - [`KeySlot`] tags
/// - `keys` (`(degree + 1) * key_width` bytes) - zeroed for slots without a real key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NodeLayout {
    degree: usize,
    key_width: usize,
}

impl NodeLayout {
    const HEADER_SIZE: usize = 1 + 2 + 8;
    const POINTER_SIZE: usize = 8;

    pub fn new(degree: usize, key_width: usize) -> Self {
        Self { degree, key_width }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn key_width(&self) -> usize {
        self.key_width
    }

    pub fn block_size(&self) -> usize {
        Self::HEADER_SIZE
            + self.degree * Self::POINTER_SIZE
            + (self.degree + 1) * (1 + self.key_width)
    }

    fn corrupt(reason: impl Into<String>) -> BTreeNodeError {
        BTreeNodeError::CorruptNode {
            reason: reason.into(),
        }
    }

    pub fn encode(&self, node: &Node) -> Result<Vec<u8>, BTreeNodeError> {
        let slots = self.degree + 1;
        let (is_leaf, count, trailing, pointers, keys): (u8, usize, BlockPtr, Vec<BlockPtr>, Vec<&KeySlot>) =
            match node {
                Node::Leaf(leaf) => {
                    if leaf.entries.len() > self.degree {
                        return Err(Self::corrupt("leaf holds more entries than its degree"));
                    }
                    (
                        1,
                        leaf.entries.len(),
                        leaf.sibling.into(),
                        leaf.entries.iter().map(|e| e.record).collect(),
                        leaf.entries.iter().map(|e| &e.key).collect(),
                    )
                }
                Node::Internal(internal) => {
                    let count = internal.count();
                    if internal.children.is_empty() || count > self.degree {
                        return Err(Self::corrupt("internal node has invalid child count"));
                    }
                    (
                        0,
                        count,
                        internal.children[count].ptr,
                        internal.children[..count].iter().map(|c| c.ptr).collect(),
                        internal.children.iter().map(|c| &c.low).collect(),
                    )
                }
            };

        let mut buffer = Vec::with_capacity(self.block_size());
        buffer.write_u8(is_leaf)?;
        buffer.write_u16::<BigEndian>(count as u16)?;
        buffer.write_u64::<BigEndian>(trailing.offset())?;
        for i in 0..self.degree {
            let ptr = pointers.get(i).copied().unwrap_or(BlockPtr::NULL);
            buffer.write_u64::<BigEndian>(ptr.offset())?;
        }
        for i in 0..slots {
            let tag = keys.get(i).map_or(KeySlot::TAG_EMPTY, |k| k.tag());
            buffer.write_u8(tag)?;
        }
        for i in 0..slots {
            match keys.get(i) {
                Some(KeySlot::Real(bytes)) => {
                    if bytes.len() != self.key_width {
                        return Err(BTreeNodeError::KeyWidthMismatch {
                            expected: self.key_width,
                            actual: bytes.len(),
                        });
                    }
                    buffer.write_all(bytes)?;
                }
                _ => buffer.write_all(&vec![0u8; self.key_width])?,
            }
        }
        Ok(buffer)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Node, BTreeNodeError> {
        if bytes.len() < self.block_size() {
            return Err(Self::corrupt(format!(
                "block is {} bytes long, expected {}",
                bytes.len(),
                self.block_size()
            )));
        }
        let slots = self.degree + 1;
        let mut cursor = Cursor::new(bytes);
        let is_leaf = match cursor.read_u8()? {
            0 => false,
            1 => true,
            other => return Err(Self::corrupt(format!("invalid leaf flag {other}"))),
        };
        let count = cursor.read_u16::<BigEndian>()? as usize;
        if count > self.degree {
            return Err(Self::corrupt(format!(
                "count {count} exceeds degree {}",
                self.degree
            )));
        }
        let trailing = BlockPtr::new(cursor.read_u64::<BigEndian>()?);
        let mut pointers = Vec::with_capacity(self.degree);
        for _ in 0..self.degree {
            pointers.push(BlockPtr::new(cursor.read_u64::<BigEndian>()?));
        }
        let mut tags = vec![0u8; slots];
        cursor.read_exact(&mut tags)?;
        let used_slots = if is_leaf { count } else { count + 1 };
        let mut keys = Vec::with_capacity(used_slots);
        let mut key = vec![0u8; self.key_width];
        for &tag in tags.iter().take(used_slots) {
            cursor.read_exact(&mut key)?;
            keys.push(match tag {
                KeySlot::TAG_NONE => KeySlot::Real(key.clone()),
                KeySlot::TAG_EMPTY => KeySlot::Empty,
                KeySlot::TAG_INFINITY => KeySlot::Infinity,
                other => return Err(Self::corrupt(format!("invalid key option {other}"))),
            });
        }

        if is_leaf {
            let entries = keys
                .into_iter()
                .zip(pointers)
                .map(|(key, record)| LeafEntry { key, record })
                .collect();
            return Ok(Node::Leaf(LeafNode {
                entries,
                sibling: trailing.non_null(),
            }));
        }

        if trailing.is_null() {
            return Err(Self::corrupt("internal node without a last child"));
        }
        let children = keys
            .into_iter()
            .zip(pointers.into_iter().take(count).chain(std::iter::once(trailing)))
            .map(|(low, ptr)| ChildRef { low, ptr })
            .collect();
        Ok(Node::Internal(InternalNode { children }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::DataType;

    const DEGREE: usize = 4;

    fn int(v: i32) -> KeySlot {
        KeySlot::real(DataType::Int.parse(&v.to_string()).unwrap())
    }

    fn leaf_of(keys: &[i32]) -> LeafNode {
        LeafNode {
            entries: keys
                .iter()
                .enumerate()
                .map(|(i, k)| LeafEntry {
                    key: int(*k),
                    record: BlockPtr::new(100 + i as u64),
                })
                .collect(),
            sibling: None,
        }
    }

    fn keys_of(leaf: &LeafNode) -> Vec<KeySlot> {
        leaf.entries.iter().map(|e| e.key.clone()).collect()
    }

    fn child(low: KeySlot, ptr: u64) -> ChildRef {
        ChildRef {
            low,
            ptr: BlockPtr::new(ptr),
        }
    }

    #[test]
    fn block_size_accounts_for_extra_key_slot() {
        let layout = NodeLayout::new(4, 8);

        assert_eq!(layout.block_size(), 11 + 4 * 8 + 5 * 9);
    }

    #[test]
    fn leaf_encode_decode_preserves_entries_and_sibling() {
        // given a partially filled leaf ending with the sentinel
        let layout = NodeLayout::new(DEGREE, 4);
        let mut leaf = leaf_of(&[1, 5]);
        leaf.entries.push(LeafEntry {
            key: KeySlot::Infinity,
            record: RecordPtr::NULL,
        });
        leaf.sibling = Some(BlockPtr::new(4242));
        let node = Node::Leaf(leaf);

        // when encoding and decoding it
        let bytes = layout.encode(&node).unwrap();
        let decoded = layout.decode(&bytes).unwrap();

        // then the block has the full size and the node is unchanged
        assert_eq!(bytes.len(), layout.block_size());
        assert_eq!(decoded, node);
    }

    #[test]
    fn internal_encode_decode_keeps_trailing_child_and_empty_slots() {
        // given an internal node with an empty low key in the middle
        let layout = NodeLayout::new(DEGREE, 4);
        let node = Node::Internal(InternalNode {
            children: vec![child(int(1), 10), child(KeySlot::Empty, 20), child(int(9), 30)],
        });

        // when encoding and decoding it
        let decoded = layout.decode(&layout.encode(&node).unwrap()).unwrap();

        // then the node is unchanged
        assert_eq!(decoded, node);
    }

    #[test]
    fn decode_rejects_count_above_degree() {
        let layout = NodeLayout::new(DEGREE, 4);
        let mut bytes = layout.encode(&Node::Leaf(leaf_of(&[1]))).unwrap();
        bytes[1..3].copy_from_slice(&(DEGREE as u16 + 1).to_be_bytes());

        assert!(matches!(
            layout.decode(&bytes),
            Err(BTreeNodeError::CorruptNode { .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_key_option() {
        let layout = NodeLayout::new(DEGREE, 4);
        let mut bytes = layout.encode(&Node::Leaf(leaf_of(&[1]))).unwrap();
        let options_start = 11 + DEGREE * 8;
        bytes[options_start] = 7;

        assert!(matches!(
            layout.decode(&bytes),
            Err(BTreeNodeError::CorruptNode { .. })
        ));
    }

    #[test]
    fn encode_rejects_key_of_wrong_width() {
        let layout = NodeLayout::new(DEGREE, 8);

        assert!(matches!(
            layout.encode(&Node::Leaf(leaf_of(&[1]))),
            Err(BTreeNodeError::KeyWidthMismatch {
                expected: 8,
                actual: 4
            })
        ));
    }

    #[test]
    fn leaf_insert_without_split_shifts_entries() {
        let mut leaf = leaf_of(&[1, 3, 5]);

        let split = leaf.insert(
            1,
            LeafEntry {
                key: int(2),
                record: BlockPtr::new(7),
            },
            DEGREE,
        );

        assert!(split.is_none());
        assert_eq!(keys_of(&leaf), vec![int(1), int(2), int(3), int(5)]);
    }

    #[test]
    fn leaf_split_is_balanced_for_every_insert_position() {
        for pos in 0..=DEGREE {
            // given a full leaf
            let mut leaf = leaf_of(&[10, 20, 30, 40]);
            leaf.sibling = Some(BlockPtr::new(999));
            let new_key = 5 + 10 * pos as i32;

            // when inserting a fifth entry at `pos`
            let right = leaf
                .insert(
                    pos,
                    LeafEntry {
                        key: int(new_key),
                        record: BlockPtr::new(1),
                    },
                    DEGREE,
                )
                .unwrap();

            // then the halves differ by at most one and stay ordered
            assert_eq!(leaf.entries.len(), DEGREE / 2 + 1, "pos {pos}");
            assert_eq!(right.entries.len(), DEGREE / 2, "pos {pos}");
            let codec = DataType::Int;
            assert!(leaf.last_key().unwrap().le(right.first_key().unwrap(), &codec));
            let all: Vec<_> = keys_of(&leaf).into_iter().chain(keys_of(&right)).collect();
            assert!(all.contains(&int(new_key)));
            // and the new sibling inherits the old sibling link
            assert_eq!(right.sibling, Some(BlockPtr::new(999)));
        }
    }

    #[test]
    fn propagation_key_skips_duplicate_run() {
        let codec = DataType::Int;
        let left = leaf_of(&[1, 42, 42]);
        let right = leaf_of(&[42, 50]);

        assert_eq!(left.propagation_key(&right, &codec), int(50));
        assert_eq!(left.propagation_key(&leaf_of(&[43, 50]), &codec), int(43));
    }

    #[test]
    fn propagation_key_is_empty_for_pure_duplicate_run() {
        let codec = DataType::Int;
        let left = leaf_of(&[42, 42, 42]);
        let right = leaf_of(&[42, 42]);

        assert_eq!(left.propagation_key(&right, &codec), KeySlot::Empty);
    }

    #[test]
    fn child_index_skips_empty_slots() {
        let codec = DataType::Int;
        let node = InternalNode {
            children: vec![
                child(int(0), 1),
                child(int(10), 2),
                child(KeySlot::Empty, 3),
                child(int(30), 4),
            ],
        };

        assert_eq!(node.child_index(&int(-5), &codec), 0);
        assert_eq!(node.child_index(&int(10), &codec), 1);
        assert_eq!(node.child_index(&int(29), &codec), 1);
        assert_eq!(node.child_index(&int(30), &codec), 3);
        assert_eq!(node.child_index(&KeySlot::Infinity, &codec), 3);
    }

    #[test]
    fn internal_split_keeps_trailing_child_on_the_right() {
        // given a full internal node (four pairs plus the last child)
        let mut node = InternalNode {
            children: (0..5).map(|i| child(int(i * 10), i as u64 + 1)).collect(),
        };

        // when a sixth child is inserted
        let right = node.insert(2, child(int(15), 99), DEGREE).unwrap();

        // then both halves hold the same number of pairs
        assert_eq!(node.count(), 2);
        assert_eq!(right.count(), 2);
        assert_eq!(node.children[2].ptr, BlockPtr::new(99));
        assert_eq!(right.children.last().unwrap().ptr, BlockPtr::new(5));
        assert_eq!(right.first_low_key(), int(20));
    }

    #[test]
    fn first_low_key_skips_leading_empty_slots() {
        let node = InternalNode {
            children: vec![child(KeySlot::Empty, 1), child(KeySlot::Empty, 2), child(int(7), 3)],
        };

        assert_eq!(node.first_low_key(), int(7));
    }
}
