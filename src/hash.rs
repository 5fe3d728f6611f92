//! Compute the root hash of some input, incrementally or all at once.
//!
//! Every node in the tree is hashed with BLAKE2b in tree mode. Chunks are
//! hashed with node depth 0 and parents with node depth 1, so that a chunk
//! which happens to contain two hashes can never collide with a parent node.
//! The root node additionally gets the total content length as a suffix and
//! the BLAKE2 last node flag, whether it's a chunk or a parent.

use arrayvec::ArrayVec;
use blake2b_simd;
use byteorder::{ByteOrder, LittleEndian};
use core::cmp;
use core::fmt;
use core::mem;
#[cfg(feature = "std")]
use rayon;
#[cfg(feature = "std")]
use std::io;

pub const HASH_SIZE: usize = 32;
pub const PARENT_SIZE: usize = 2 * HASH_SIZE;
pub const HEADER_SIZE: usize = 8;
pub const CHUNK_SIZE: usize = 4096;
// A 64-entry subtree stack is enough state for 2^64 - 1 bytes of input. Note
// that the array type needs to match one of the implementations of
// arrayvec::Array.
pub(crate) const MAX_DEPTH: usize = 64;
pub(crate) const MAX_SINGLE_THREADED: usize = 4 * CHUNK_SIZE;

pub type Hash = [u8; HASH_SIZE];
pub type ParentNode = [u8; PARENT_SIZE];

pub(crate) fn encode_len(len: u64) -> [u8; HEADER_SIZE] {
    debug_assert_eq!(mem::size_of_val(&len), HEADER_SIZE);
    let mut len_bytes = [0; HEADER_SIZE];
    LittleEndian::write_u64(&mut len_bytes, len);
    len_bytes
}

// Callers that pull a header off a stream must supply exactly HEADER_SIZE
// bytes, with read_exact or equivalent. The fixed-size argument type here is
// what rules out short headers, which would otherwise let an encoding claim a
// content length different from the one mixed into the root hash.
pub(crate) fn decode_len(len_bytes: &[u8; HEADER_SIZE]) -> u64 {
    LittleEndian::read_u64(len_bytes)
}

fn common_params() -> blake2b_simd::Params {
    let mut params = blake2b_simd::Params::new();
    params
        .hash_length(HASH_SIZE)
        .fanout(2)
        .max_depth(64)
        .max_leaf_length(CHUNK_SIZE as u32)
        .node_offset(0)
        .inner_hash_length(HASH_SIZE);
    params
}

pub(crate) fn new_chunk_state() -> blake2b_simd::State {
    common_params().node_depth(0).to_state()
}

pub(crate) fn new_parent_state() -> blake2b_simd::State {
    common_params().node_depth(1).to_state()
}

// The root node is hashed differently from interior nodes. It gets suffixed
// with the length of the entire input, and we set the Blake2 final node flag.
// That means that no root hash can ever collide with an interior hash, or with
// the root of a different size tree.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Finalization {
    NotRoot,
    Root(u64),
}
use self::Finalization::{NotRoot, Root};

pub(crate) fn finalize_hash(state: &mut blake2b_simd::State, finalization: Finalization) -> Hash {
    // For the root node, we hash in the length as a suffix, and we set the
    // Blake2 last node flag. One of the reasons for this design is that we
    // don't need to know a given node is the root until the very end, so we
    // don't always need a chunk buffer.
    if let Root(root_len) = finalization {
        state.update(&encode_len(root_len));
        state.set_last_node(true);
    }
    let blake_digest = state.finalize();
    *array_ref!(blake_digest.as_bytes(), 0, HASH_SIZE)
}

pub(crate) fn hash_chunk(chunk: &[u8], finalization: Finalization) -> Hash {
    debug_assert!(chunk.len() <= CHUNK_SIZE);
    let mut state = new_chunk_state();
    state.update(chunk);
    finalize_hash(&mut state, finalization)
}

pub(crate) fn hash_parent(left_hash: &Hash, right_hash: &Hash, finalization: Finalization) -> Hash {
    let mut state = new_parent_state();
    state.update(left_hash);
    state.update(right_hash);
    finalize_hash(&mut state, finalization)
}

// The same as hash_parent, but for the raw 64 bytes of a parent node as it
// appears in an encoded tree.
pub(crate) fn hash_parent_node(parent: &ParentNode, finalization: Finalization) -> Hash {
    let mut state = new_parent_state();
    state.update(parent);
    finalize_hash(&mut state, finalization)
}

// Find the largest power of two that's less than or equal to `n`. We use this
// for computing subtree sizes below.
pub(crate) fn largest_power_of_two_leq(n: u64) -> u64 {
    ((n / 2) + 1).next_power_of_two()
}

/// Given some content length larger than one chunk, the number of bytes that
/// go in the left subtree: the largest perfect tree of full chunks that
/// leaves at least one byte for the right side.
pub fn left_len(content_len: u64) -> u64 {
    debug_assert!(content_len > CHUNK_SIZE as u64);
    // Subtract 1 to reserve at least one byte for the right side.
    let full_chunks = (content_len - 1) / CHUNK_SIZE as u64;
    largest_power_of_two_leq(full_chunks) * CHUNK_SIZE as u64
}

/// The number of chunks in the tree for a given content length. The empty
/// tree still counts as one chunk.
pub fn count_chunks(content_len: u64) -> u64 {
    // Avoid the usual round-up addition, which would overflow for content
    // lengths near u64::MAX.
    let full = content_len / CHUNK_SIZE as u64;
    let partial = (content_len % CHUNK_SIZE as u64 != 0) as u64;
    cmp::max(1, full + partial)
}

fn hash_recurse(input: &[u8], finalization: Finalization) -> Hash {
    if input.len() <= CHUNK_SIZE {
        return hash_chunk(input, finalization);
    }
    // If we have more than one chunk of input, recursively hash the left and
    // right sides. The left_len() function determines the shape of the tree.
    let (left, right) = input.split_at(left_len(input.len() as u64) as usize);
    // Child nodes are never the root.
    let left_hash = hash_recurse(left, NotRoot);
    let right_hash = hash_recurse(right, NotRoot);
    hash_parent(&left_hash, &right_hash, finalization)
}

#[cfg(feature = "std")]
fn hash_recurse_rayon(input: &[u8], finalization: Finalization) -> Hash {
    if input.len() <= CHUNK_SIZE {
        return hash_chunk(input, finalization);
    }
    let (left, right) = input.split_at(left_len(input.len() as u64) as usize);
    let (left_hash, right_hash) = rayon::join(
        || hash_recurse_rayon(left, NotRoot),
        || hash_recurse_rayon(right, NotRoot),
    );
    hash_parent(&left_hash, &right_hash, finalization)
}

/// Hash a slice of input bytes all at once. Above a few chunks, this will
/// parallelize over subtrees using [Rayon](https://crates.io/crates/rayon).
pub fn hash(input: &[u8]) -> Hash {
    #[cfg(feature = "std")]
    {
        // Below a few chunks, the overhead of parallelizing isn't worth it.
        if input.len() <= MAX_SINGLE_THREADED {
            hash_recurse(input, Root(input.len() as u64))
        } else {
            hash_recurse_rayon(input, Root(input.len() as u64))
        }
    }
    #[cfg(not(feature = "std"))]
    {
        hash_recurse(input, Root(input.len() as u64))
    }
}

pub(crate) enum StateFinish {
    Parent(ParentNode),
    Root(Hash),
}

/// A minimal state object for incrementally hashing input. Most callers should
/// use the `Writer` interface instead.
///
/// This takes only subtree hashes as input, rather than raw input bytes, so
/// it could be fed by multiple threads hashing chunks in parallel. The
/// `merge_finish` interface also yields `ParentNode` bytes, for callers that
/// want to assemble an encoded tree incrementally.
#[derive(Clone)]
pub(crate) struct State {
    subtrees: ArrayVec<[Hash; MAX_DEPTH]>,
    total_len: u64,
}

impl State {
    pub fn new() -> Self {
        Self {
            subtrees: ArrayVec::new(),
            total_len: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.total_len
    }

    fn merge_inner(&mut self, finalization: Finalization) -> ParentNode {
        let right_child = self.subtrees.pop().unwrap();
        let left_child = self.subtrees.pop().unwrap();
        let mut parent_node = [0; PARENT_SIZE];
        parent_node[..HASH_SIZE].copy_from_slice(&left_child);
        parent_node[HASH_SIZE..].copy_from_slice(&right_child);
        let parent = hash_parent(&left_child, &right_child, finalization);
        self.subtrees.push(parent);
        parent_node
    }

    // We keep the subtree hashes in an array without storing their size, and
    // we use this cute trick to figure out when they should merge. Because
    // every subtree (prior to the finalization step) is a power of two times
    // the chunk size, adding a new subtree to the right/small end is a lot
    // like adding a 1 to a binary number, and merging subtrees is like
    // propagating the carry bit. Each carry represents a place where two
    // subtrees need to be merged, and the final number of 1 bits is the same
    // as the final number of subtrees.
    fn needs_merge(&self) -> bool {
        let chunks = self.total_len / CHUNK_SIZE as u64;
        self.subtrees.len() > chunks.count_ones() as usize
    }

    /// Add a subtree hash to the state.
    ///
    /// For most callers this is the hash of a `CHUNK_SIZE` chunk of input
    /// bytes, with the final chunk possibly having fewer bytes. Larger input
    /// subtrees also work, as long as their size is a power of 2 times
    /// `CHUNK_SIZE` and kept constant until the final subtree.
    ///
    /// In cases where the total input is a single chunk or less, including
    /// the case with no input bytes at all, callers are expected to finalize
    /// that chunk themselves and skip the state object entirely.
    pub fn push_subtree(&mut self, hash: &Hash, len: usize) {
        // Merge any subtrees that need to be merged before pushing. Merging
        // is deferred until the next push, because whether the last merge is
        // the root merge isn't known until the final subtree arrives.
        while self.needs_merge() {
            self.merge_inner(NotRoot);
        }
        self.subtrees.push(*hash);
        self.total_len += len as u64;
    }

    /// After the final call to `push_subtree`, drive this in a loop until it
    /// yields `StateFinish::Root`. The very last merge is the root merge, and
    /// it's finalized with the total content length.
    pub fn merge_finish(&mut self) -> StateFinish {
        if self.subtrees.len() > 2 {
            StateFinish::Parent(self.merge_inner(NotRoot))
        } else if self.subtrees.len() == 2 {
            let root_finalization = Root(self.total_len); // Appease borrowck.
            StateFinish::Parent(self.merge_inner(root_finalization))
        } else {
            StateFinish::Root(self.subtrees[0])
        }
    }

    /// A wrapper around `merge_finish` for callers who don't need the parent
    /// nodes.
    pub fn finish(&mut self) -> Hash {
        loop {
            match self.merge_finish() {
                StateFinish::Parent(_) => {} // ignored
                StateFinish::Root(root) => return root,
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Avoid printing hashes, they might be secret.
        write!(f, "State {{ ... }}")
    }
}

/// An incremental hasher. This is the `hash` function for callers who don't
/// have the whole input in memory, or who receive it over time.
///
/// It buffers at most one chunk of BLAKE2b state, so that it never has to
/// know whether a given chunk is the last one before `finish` gets called.
#[derive(Clone, Debug)]
pub struct Writer {
    chunk: blake2b_simd::State,
    state: State,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            chunk: new_chunk_state(),
            state: State::new(),
        }
    }

    /// This is equivalent to `write`, except that it's also available with
    /// `no_std`.
    pub fn update(&mut self, mut input: &[u8]) {
        while !input.is_empty() {
            // A full buffered chunk only gets finalized once we see more
            // input. Until then it might be the root.
            if self.chunk.count() as usize == CHUNK_SIZE {
                let hash = finalize_hash(&mut self.chunk, NotRoot);
                self.state.push_subtree(&hash, CHUNK_SIZE);
                self.chunk = new_chunk_state();
            }
            let want = CHUNK_SIZE - self.chunk.count() as usize;
            let take = cmp::min(want, input.len());
            self.chunk.update(&input[..take]);
            input = &input[take..];
        }
    }

    /// After feeding all the input bytes to `update` or `write`, return the
    /// root hash. The writer cannot be used after this.
    pub fn finish(&mut self) -> Hash {
        // The buffered chunk is the root iff nothing has been pushed yet.
        // Capture its length before finalize_hash, which appends the length
        // suffix to the state in the root case.
        let chunk_len = self.chunk.count() as usize;
        let finalization = if self.state.count() == 0 {
            Root(chunk_len as u64)
        } else {
            NotRoot
        };
        let hash = finalize_hash(&mut self.chunk, finalization);
        self.state.push_subtree(&hash, chunk_len);
        self.state.finish()
    }
}

#[cfg(feature = "std")]
impl io::Write for Writer {
    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        self.update(input);
        Ok(input.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// Interesting input lengths to run tests on.
#[cfg(test)]
pub(crate) const TEST_CASES: &[usize] = &[
    0,
    1,
    10,
    CHUNK_SIZE - 1,
    CHUNK_SIZE,
    CHUNK_SIZE + 1,
    2 * CHUNK_SIZE - 1,
    2 * CHUNK_SIZE,
    2 * CHUNK_SIZE + 1,
    3 * CHUNK_SIZE - 1,
    3 * CHUNK_SIZE,
    3 * CHUNK_SIZE + 1,
    4 * CHUNK_SIZE - 1,
    4 * CHUNK_SIZE,
    4 * CHUNK_SIZE + 1,
    16 * CHUNK_SIZE - 1,
    16 * CHUNK_SIZE,
    16 * CHUNK_SIZE + 1,
];

// A content pattern whose period doesn't line up with the chunk size, so that
// misplaced bytes show up in codec tests.
#[cfg(test)]
pub(crate) fn make_test_input(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
