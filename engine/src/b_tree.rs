use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::b_tree_key::KeySlot;
use crate::b_tree_node::{
    BTreeNodeError, ChildRef, InternalNode, LeafEntry, LeafNode, Node, NodeLayout, RecordPtr,
};
use crate::block_file::{BlockFile, BlockFileError, BlockPtr};
use crate::data_types::KeyCodec;

#[derive(Debug, Error)]
pub enum BTreeError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("out of memory: no more blocks can be allocated")]
    OutOfMemory,
    #[error("block file error occurred: {0}")]
    IoError(BlockFileError),
    #[error("B-tree is corrupted: {reason}")]
    Corrupted { reason: String },
}

impl From<BlockFileError> for BTreeError {
    fn from(err: BlockFileError) -> Self {
        match err {
            BlockFileError::Exhausted { .. } => BTreeError::OutOfMemory,
            other => BTreeError::IoError(other),
        }
    }
}

impl From<BTreeNodeError> for BTreeError {
    fn from(err: BTreeNodeError) -> Self {
        BTreeError::Corrupted {
            reason: err.to_string(),
        }
    }
}

impl BTreeError {
    fn invalid(reason: impl Into<String>) -> Self {
        BTreeError::InvalidArgument {
            reason: reason.into(),
        }
    }

    fn corrupted(reason: impl Into<String>) -> Self {
        BTreeError::Corrupted {
            reason: reason.into(),
        }
    }
}

/// Tunables of a single index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// Maximal number of entries in a leaf and of (separator, child) pairs in an internal node.
    pub degree: usize,
    /// Maximal number of blocks the index file may grow to, `None` when unlimited.
    pub max_blocks: Option<u64>,
}

impl IndexOptions {
    pub const DEFAULT_DEGREE: usize = 4;
    const MIN_DEGREE: usize = 3;

    fn validate(&self) -> Result<(), BTreeError> {
        if self.degree < Self::MIN_DEGREE || self.degree > u16::MAX as usize {
            return Err(BTreeError::invalid(format!(
                "degree must be between {} and {}, got {}",
                Self::MIN_DEGREE,
                u16::MAX,
                self.degree
            )));
        }
        Ok(())
    }
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            degree: Self::DEFAULT_DEGREE,
            max_blocks: None,
        }
    }
}

/// Internal node visited on the way down together with the index of the child that was followed.
struct PathStep {
    ptr: BlockPtr,
    node: InternalNode,
    index: usize,
}

/// Root-to-leaf path produced by [`BTree::descend`].
struct Descent {
    path: Vec<PathStep>,
    leaf_ptr: BlockPtr,
    leaf: LeafNode,
}

/// Where a new entry goes.
enum Placement {
    /// Into the descended leaf at `pos`.
    Here {
        descent: Descent,
        pos: usize,
        /// Whether the new key is strictly greater than the entry preceding it.
        lowers: bool,
    },
    /// Into a leaf only reachable through the sibling chain. Descending again with `dominating_key`
    /// leads straight to it.
    Redirect {
        dominating_key: KeySlot,
        lowers: bool,
    },
}

/// What a child reports to its parent after absorbing an insert.
struct ChildReport {
    /// New low key of the child (the left half when it split).
    low: KeySlot,
    /// Node created by splitting the child.
    split: Option<ChildRef>,
}

/// Disk-resident B+Tree mapping fixed-width keys to record locators.
///
/// Each [`BTree`] instance corresponds to a single physical file. The root always lives in the first
/// block of the file; when it splits, its content is moved to a fresh block and the first block is
/// rewritten with a new, taller root. The rightmost leaf always ends with an `Infinity` sentinel entry
/// whose locator is [`RecordPtr::NULL`].
///
/// Duplicate keys are allowed and kept in insertion order. A run of duplicates may span several
/// leaves; separators in internal nodes are the low keys of their children (see [`ChildRef`]).
pub struct BTree<C: KeyCodec> {
    file: BlockFile,
    codec: C,
    layout: NodeLayout,
    root: BlockPtr,
}

impl<C: KeyCodec> BTree<C> {
    /// Upper bound on tree height, anything deeper means the pointers form a cycle.
    const MAX_HEIGHT: usize = 64;

    /// Path of the index file for `column` of table `table_name` inside `dir`.
    pub fn index_path(dir: impl AsRef<Path>, table_name: &str, column: &str) -> PathBuf {
        dir.as_ref().join(format!("{table_name}_{column}.idx"))
    }

    /// Creates a new index file at `path`, holding a single leaf with the sentinel entry.
    pub fn create(
        path: impl AsRef<Path>,
        codec: C,
        options: IndexOptions,
    ) -> Result<Self, BTreeError> {
        options.validate()?;
        let layout = Self::layout_for(&codec, &options)?;
        let block_size = u32::try_from(layout.block_size())
            .map_err(|_| BTreeError::invalid("node does not fit in a block"))?;
        let mut file = BlockFile::create(&path, block_size)?;
        file.set_block_limit(options.max_blocks);
        let root = file.allocate_block()?;
        if root != file.first_block_offset() {
            return Err(BTreeError::corrupted("root is not the first block of the file"));
        }

        let mut tree = Self {
            file,
            codec,
            layout,
            root,
        };
        let sentinel = LeafNode {
            entries: vec![LeafEntry {
                key: KeySlot::Infinity,
                record: RecordPtr::NULL,
            }],
            sibling: None,
        };
        tree.write_node(root, &Node::Leaf(sentinel))?;
        log::info!(
            "created index {} (degree {}, key width {})",
            path.as_ref().display(),
            layout.degree(),
            layout.key_width()
        );
        Ok(tree)
    }

    /// Opens an existing index file. The block size stored in the file must match the node size implied
    /// by `options.degree` and the codec's key width.
    pub fn open(
        path: impl AsRef<Path>,
        codec: C,
        options: IndexOptions,
    ) -> Result<Self, BTreeError> {
        options.validate()?;
        let layout = Self::layout_for(&codec, &options)?;
        let mut file = BlockFile::open(&path)?;
        if file.block_size() as usize != layout.block_size() {
            return Err(BTreeError::corrupted(format!(
                "block size {} does not match node size {} for degree {} and key width {}",
                file.block_size(),
                layout.block_size(),
                layout.degree(),
                layout.key_width()
            )));
        }
        if file.block_count() == 0 {
            return Err(BTreeError::corrupted("index file has no root block"));
        }
        file.set_block_limit(options.max_blocks);
        let root = file.first_block_offset();
        log::info!("opened index {}", path.as_ref().display());
        Ok(Self {
            file,
            codec,
            layout,
            root,
        })
    }

    /// Flushes and closes the index.
    pub fn close(self) -> Result<(), BTreeError> {
        let Self { mut file, .. } = self;
        file.flush()?;
        Ok(())
    }

    /// Block offset of the root. Never changes during the lifetime of the index.
    pub fn root_offset(&self) -> BlockPtr {
        self.root
    }

    /// Number of levels, 1 for a tree made of a single leaf.
    pub fn height(&mut self) -> Result<usize, BTreeError> {
        let mut height = 1;
        let mut ptr = self.root;
        while let Node::Internal(node) = self.read_node(ptr)? {
            height += 1;
            if height > Self::MAX_HEIGHT {
                return Err(BTreeError::corrupted("tree is deeper than the height limit"));
            }
            ptr = node.children[0].ptr;
        }
        Ok(height)
    }

    /// Inserts `record` under `key`. Duplicate keys are kept after the existing ones.
    ///
    /// On failure the index may be left partially updated.
    pub fn insert(&mut self, key: &[u8], record: RecordPtr) -> Result<(), BTreeError> {
        self.check_key(key)?;
        if record.is_null() {
            return Err(BTreeError::invalid("record locator must not be null"));
        }
        let key = KeySlot::real(key);

        // The second pass only happens after a redirect, with the key that routes to the right leaf.
        let mut route = key.clone();
        let mut lowers_hint = None;
        for _ in 0..2 {
            let descent = self.descend(&route)?;
            match self.place(descent, &key, lowers_hint)? {
                Placement::Here {
                    descent,
                    pos,
                    lowers,
                } => return self.insert_at(descent, pos, lowers, key, record),
                Placement::Redirect {
                    dominating_key,
                    lowers,
                } => {
                    log::debug!("duplicate run of {key} crosses leaves, redirecting via {dominating_key}");
                    route = dominating_key;
                    lowers_hint = Some(lowers);
                }
            }
        }
        Err(BTreeError::corrupted(format!(
            "redirected descent for {key} did not reach its leaf"
        )))
    }

    /// Record locators of every entry stored under `key`, in insertion order.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<RecordPtr>, BTreeError> {
        self.scan(key, key)
    }

    /// Record locators of every entry whose key lies in `[start, end]`, ordered by key.
    pub fn scan(&mut self, start: &[u8], end: &[u8]) -> Result<Vec<RecordPtr>, BTreeError> {
        self.check_key(start)?;
        self.check_key(end)?;
        self.scan_slots(&KeySlot::real(start), &KeySlot::real(end))
    }

    /// Like [`BTree::scan`], with bounds that may be [`KeySlot::Infinity`]. A scan ending at infinity
    /// yields the sentinel's null locator last.
    pub fn scan_slots(
        &mut self,
        start: &KeySlot,
        end: &KeySlot,
    ) -> Result<Vec<RecordPtr>, BTreeError> {
        if start.is_empty() || end.is_empty() {
            return Err(BTreeError::invalid("scan bounds must not be empty"));
        }
        if end.lt(start, &self.codec) {
            return Err(BTreeError::invalid("scan start is greater than its end"));
        }

        let Descent { mut leaf, .. } = self.descend(start)?;
        let mut pos = leaf.lower_bound(start, &self.codec);
        let mut records = Vec::new();
        loop {
            for entry in &leaf.entries[pos..] {
                // Leaves holding a duplicate run may still precede the range.
                if entry.key.lt(start, &self.codec) {
                    continue;
                }
                if end.lt(&entry.key, &self.codec) {
                    return Ok(records);
                }
                records.push(entry.record);
            }
            match leaf.sibling {
                Some(next) => {
                    leaf = self.read_leaf(next)?;
                    pos = 0;
                }
                None => return Ok(records),
            }
        }
    }

    fn layout_for(codec: &C, options: &IndexOptions) -> Result<NodeLayout, BTreeError> {
        if codec.key_width() == 0 {
            return Err(BTreeError::invalid("key width must not be zero"));
        }
        Ok(NodeLayout::new(options.degree, codec.key_width()))
    }

    fn check_key(&self, key: &[u8]) -> Result<(), BTreeError> {
        if key.len() != self.layout.key_width() {
            return Err(BTreeError::invalid(format!(
                "key is {} bytes long, expected {}",
                key.len(),
                self.layout.key_width()
            )));
        }
        Ok(())
    }

    fn read_node(&mut self, ptr: BlockPtr) -> Result<Node, BTreeError> {
        let mut buffer = vec![0u8; self.layout.block_size()];
        self.file.read_block(ptr, &mut buffer)?;
        Ok(self.layout.decode(&buffer)?)
    }

    fn read_leaf(&mut self, ptr: BlockPtr) -> Result<LeafNode, BTreeError> {
        match self.read_node(ptr)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(BTreeError::corrupted(format!(
                "sibling link {ptr} points to an internal node"
            ))),
        }
    }

    fn write_node(&mut self, ptr: BlockPtr, node: &Node) -> Result<(), BTreeError> {
        let bytes = self.layout.encode(node)?;
        self.file.write_block(ptr, &bytes)?;
        Ok(())
    }

    fn allocate_node(&mut self, node: &Node) -> Result<BlockPtr, BTreeError> {
        let ptr = self.file.allocate_block()?;
        self.write_node(ptr, node)?;
        Ok(ptr)
    }

    /// Walks from the root to the leaf `route` belongs to, remembering every internal node on the way.
    fn descend(&mut self, route: &KeySlot) -> Result<Descent, BTreeError> {
        let mut path = Vec::new();
        let mut ptr = self.root;
        loop {
            match self.read_node(ptr)? {
                Node::Leaf(leaf) => {
                    return Ok(Descent {
                        path,
                        leaf_ptr: ptr,
                        leaf,
                    });
                }
                Node::Internal(node) => {
                    if path.len() >= Self::MAX_HEIGHT {
                        return Err(BTreeError::corrupted("tree is deeper than the height limit"));
                    }
                    let index = node.child_index(route, &self.codec);
                    let next = node.children[index].ptr;
                    path.push(PathStep { ptr, node, index });
                    ptr = next;
                }
            }
        }
    }

    /// Finds the position right after every entry `<= key`. When that position is past the end of the
    /// descended leaf, the sibling chain is followed, since duplicate runs may continue in later leaves.
    ///
    /// `lowers_hint` carries the result of the first pass into a redirected one.
    fn place(
        &mut self,
        descent: Descent,
        key: &KeySlot,
        lowers_hint: Option<bool>,
    ) -> Result<Placement, BTreeError> {
        let pos = descent.leaf.upper_bound(key, &self.codec);
        if let Some(lowers) = lowers_hint {
            if pos == descent.leaf.entries.len() {
                return Err(BTreeError::corrupted(format!(
                    "redirected descent for {key} reached the end of leaf {}",
                    descent.leaf_ptr
                )));
            }
            return Ok(Placement::Here {
                descent,
                pos,
                lowers,
            });
        }
        if pos < descent.leaf.entries.len() {
            let lowers = follows_smaller(&descent.leaf, pos, key, &self.codec);
            return Ok(Placement::Here {
                descent,
                pos,
                lowers,
            });
        }

        let mut last = descent.leaf.last_key().cloned();
        let mut next_ptr = descent.leaf.sibling;
        let mut walked = false;
        while let Some(ptr) = next_ptr {
            let next = self.read_leaf(ptr)?;
            let Some(first) = next.first_key() else {
                return Err(BTreeError::corrupted(format!("leaf {ptr} is empty")));
            };
            let lowers = last
                .as_ref()
                .is_none_or(|last| last.lt(key, &self.codec));
            if key.lt(first, &self.codec) {
                if !walked {
                    return Ok(Placement::Here {
                        descent,
                        pos,
                        lowers,
                    });
                }
                return Ok(Placement::Redirect {
                    dominating_key: first.clone(),
                    lowers,
                });
            }
            let next_pos = next.upper_bound(key, &self.codec);
            if next_pos < next.entries.len() {
                return Ok(Placement::Redirect {
                    dominating_key: next.entries[next_pos].key.clone(),
                    lowers: follows_smaller(&next, next_pos, key, &self.codec),
                });
            }
            last = next.last_key().cloned();
            next_ptr = next.sibling;
            walked = true;
        }

        if walked {
            return Err(BTreeError::corrupted("sentinel entry is missing"));
        }
        let lowers = follows_smaller(&descent.leaf, pos, key, &self.codec);
        Ok(Placement::Here {
            descent,
            pos,
            lowers,
        })
    }

    /// Inserts the entry into the descended leaf and propagates splits and low keys up the path.
    fn insert_at(
        &mut self,
        descent: Descent,
        pos: usize,
        lowers: bool,
        key: KeySlot,
        record: RecordPtr,
    ) -> Result<(), BTreeError> {
        let Descent {
            mut path,
            leaf_ptr,
            mut leaf,
        } = descent;
        let degree = self.layout.degree();
        let candidate = if lowers {
            key.clone()
        } else {
            KeySlot::Empty
        };
        let stored_low = path
            .last()
            .map(|step| step.node.children[step.index].low.clone());

        let mut report = match leaf.insert(pos, LeafEntry { key, record }, degree) {
            None => {
                self.write_node(leaf_ptr, &Node::Leaf(leaf))?;
                let Some(low) = stored_low else {
                    return Ok(());
                };
                ChildReport {
                    low: low.min_low(&candidate, &self.codec),
                    split: None,
                }
            }
            Some(right) => {
                let right_low = leaf.propagation_key(&right, &self.codec);
                let right_ptr = self.allocate_node(&Node::Leaf(right))?;
                leaf.sibling = Some(right_ptr);
                let left_low = match stored_low {
                    Some(low) => {
                        let low = low.min_low(&candidate, &self.codec);
                        match leaf.last_key() {
                            Some(last) if low.le(last, &self.codec) => low,
                            _ => KeySlot::Empty,
                        }
                    }
                    None => leaf.first_key().cloned().unwrap_or(KeySlot::Empty),
                };
                log::debug!("split leaf {leaf_ptr}, new sibling {right_ptr} starts at {right_low}");
                let split = ChildRef {
                    low: right_low,
                    ptr: right_ptr,
                };
                if leaf_ptr == self.root {
                    return self.grow_root(Node::Leaf(leaf), left_low, split);
                }
                self.write_node(leaf_ptr, &Node::Leaf(leaf))?;
                ChildReport {
                    low: left_low,
                    split: Some(split),
                }
            }
        };

        while let Some(PathStep {
            ptr,
            mut node,
            index,
        }) = path.pop()
        {
            let mut changed = node.children[index].low != report.low;
            node.children[index].low = report.low;
            let split = match report.split {
                Some(child) => {
                    changed = true;
                    node.insert(index + 1, child, degree)
                }
                None => None,
            };
            // Ancestors hold this node's first low key, which is unchanged.
            if !changed {
                return Ok(());
            }

            report = match split {
                None => {
                    let low = node.first_low_key();
                    self.write_node(ptr, &Node::Internal(node))?;
                    ChildReport { low, split: None }
                }
                Some(right) => {
                    let right_low = right.first_low_key();
                    let right_ptr = self.allocate_node(&Node::Internal(right))?;
                    let left_low = node.first_low_key();
                    log::debug!("split internal node {ptr}, new sibling {right_ptr} starts at {right_low}");
                    let split = ChildRef {
                        low: right_low,
                        ptr: right_ptr,
                    };
                    if ptr == self.root {
                        return self.grow_root(Node::Internal(node), left_low, split);
                    }
                    self.write_node(ptr, &Node::Internal(node))?;
                    ChildReport {
                        low: left_low,
                        split: Some(split),
                    }
                }
            };
        }
        Ok(())
    }

    /// Moves the split root's left half to a new block and writes a new root above both halves at the
    /// root's fixed offset.
    fn grow_root(
        &mut self,
        left: Node,
        left_low: KeySlot,
        right: ChildRef,
    ) -> Result<(), BTreeError> {
        let relocated = self.allocate_node(&left)?;
        let root = InternalNode {
            children: vec![
                ChildRef {
                    low: left_low,
                    ptr: relocated,
                },
                right,
            ],
        };
        self.write_node(self.root, &Node::Internal(root))?;
        log::debug!("root grew, old root content moved to {relocated}");
        Ok(())
    }
}

/// Whether `key` placed at `pos` of `leaf` is strictly greater than the entry before it. The first
/// position counts as such, since the entry before it lies in a leaf the descent ruled out.
fn follows_smaller<C: KeyCodec>(leaf: &LeafNode, pos: usize, key: &KeySlot, codec: &C) -> bool {
    pos == 0 || leaf.entries[pos - 1].key.lt(key, codec)
}
