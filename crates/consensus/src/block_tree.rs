//! Parent-linked tree of certified blocks.
//!
//! Holds every block that earned a quorum certificate (plus the committed
//! root), keyed by hash in an arena with child links stored as hashes.
//! Inserting a certificate surfaces the lock and commit candidates of the
//! 3-chain rule; committing prunes and re-roots the tree.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};
use trellis_types::{Block, BlockNumber, Hash, QuorumCert};

struct TreeNode {
    block: Block,
    qc: Option<QuorumCert>,
    children: Vec<Hash>,
}

/// Arena of certified blocks with parent/child linkage.
pub struct BlockTree {
    nodes: HashMap<Hash, TreeNode>,
    root: Hash,
    /// The commit candidate last surfaced, so unchanged candidates are
    /// reported as no progress.
    last_commit: Hash,
}

impl BlockTree {
    /// A tree rooted at the last committed block. The root's certificate
    /// is absent only for genesis.
    pub fn new(root: Block, qc: Option<QuorumCert>) -> Self {
        let root_hash = root.hash();
        let mut nodes = HashMap::new();
        nodes.insert(
            root_hash,
            TreeNode {
                block: root,
                qc,
                children: Vec::new(),
            },
        );
        BlockTree {
            nodes,
            root: root_hash,
            last_commit: root_hash,
        }
    }

    /// The current root block.
    pub fn root(&self) -> &Block {
        &self.nodes[&self.root].block
    }

    /// Number of blocks held.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when only the root remains.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Look up a block and its certificate by `(hash, number)`.
    pub fn find_block_and_qc(
        &self,
        hash: &Hash,
        number: BlockNumber,
    ) -> (Option<&Block>, Option<&QuorumCert>) {
        match self.nodes.get(hash) {
            Some(node) if node.block.number() == number => {
                (Some(&node.block), node.qc.as_ref())
            }
            _ => (None, None),
        }
    }

    /// Store a block with its certificate and surface the 3-chain
    /// candidates.
    ///
    /// The lock candidate is the parent of the inserted block, the commit
    /// candidate its grandparent, each provided it also holds a
    /// certificate. `(None, None)` means the commit candidate has not
    /// moved since the last call.
    pub fn insert_qc_block(
        &mut self,
        block: Block,
        qc: QuorumCert,
    ) -> (Option<Block>, Option<Block>) {
        let hash = block.hash();
        let parent_hash = block.parent_hash();

        let inserted = match self.nodes.entry(hash) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().qc.get_or_insert(qc);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(TreeNode {
                    block,
                    qc: Some(qc),
                    children: Vec::new(),
                });
                true
            }
        };
        if inserted {
            match self.nodes.get_mut(&parent_hash) {
                Some(parent) => {
                    if !parent.children.contains(&hash) {
                        parent.children.push(hash);
                    }
                }
                None => {
                    warn!(?hash, ?parent_hash, "inserted block with no parent in tree");
                }
            }
        }

        let lock_hash = parent_hash;
        let lock = match self.nodes.get(&lock_hash) {
            Some(node) if node.qc.is_some() => node.block.clone(),
            _ => return (None, None),
        };
        let commit_hash = lock.parent_hash();
        let commit = match self.nodes.get(&commit_hash) {
            Some(node) if node.qc.is_some() => node.block.clone(),
            _ => return (None, None),
        };

        if commit_hash == self.last_commit {
            return (None, None);
        }
        self.last_commit = commit_hash;
        debug!(lock = %lock, commit = %commit, "three-chain candidates advanced");
        (Some(lock), Some(commit))
    }

    /// Discard ancestors of the block at `(hash, number)` together with
    /// their other descendants. Blocks listed in `except` survive.
    pub fn prune_block(&mut self, hash: &Hash, number: BlockNumber, except: &[Hash]) {
        if self.find_block_and_qc(hash, number).0.is_none() {
            warn!(?hash, %number, "prune target not in tree");
            return;
        }
        let keep: HashSet<Hash> = self
            .reachable_from(hash)
            .into_iter()
            .chain(except.iter().copied())
            .collect();
        self.nodes.retain(|h, _| keep.contains(h));
        for node in self.nodes.values_mut() {
            node.children.retain(|child| keep.contains(child));
        }
    }

    /// Make `block` the logical root. Blocks unreachable from it are
    /// dropped.
    pub fn new_root(&mut self, block: &Block) {
        let hash = block.hash();
        if !self.nodes.contains_key(&hash) {
            warn!(block = %block, "new root not in tree");
            return;
        }
        self.root = hash;
        let keep = self.reachable_from(&hash);
        self.nodes.retain(|h, _| keep.contains(h));
    }

    fn reachable_from(&self, start: &Hash) -> HashSet<Hash> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*start]);
        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash) {
                continue;
            }
            if let Some(node) = self.nodes.get(&hash) {
                queue.extend(node.children.iter().copied());
            }
        }
        seen
    }
}

impl std::fmt::Debug for BlockTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTree")
            .field("root", &self.root)
            .field("blocks", &self.nodes.len())
            .finish()
    }
}
