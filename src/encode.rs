//! Produce the encoded form of some input: an 8-byte little-endian length
//! header, followed by the pre-order tree. Parent nodes come before the
//! subtrees they commit to, and each leaf subtree is the raw chunk bytes. In
//! outboard mode the chunk bytes are omitted, and the recipient supplies the
//! content from a separate stream at decode time.

use crate::hash::Finalization::{self, NotRoot, Root};
use crate::hash::{
    self, count_chunks, encode_len, left_len, Hash, CHUNK_SIZE, HASH_SIZE, HEADER_SIZE, PARENT_SIZE,
};
use rayon;
use std::io;
use std::io::prelude::*;

/// The number of tree bytes for a subtree of the given content length,
/// excluding the header. A subtree of N chunks always has N-1 parent nodes.
pub fn encoded_subtree_size(content_len: u64, outboard: bool) -> u128 {
    let parents_size = (count_chunks(content_len) - 1) as u128 * PARENT_SIZE as u128;
    if outboard {
        parents_size
    } else {
        parents_size + content_len as u128
    }
}

/// The total size of the combined encoding of an input of the given length.
/// The return type is u128, because the result can overflow u64 for content
/// lengths close to u64::MAX.
pub fn encoded_size(content_len: u64) -> u128 {
    HEADER_SIZE as u128 + encoded_subtree_size(content_len, false)
}

/// The total size of the outboard encoding of an input of the given length.
pub fn outboard_size(content_len: u64) -> u128 {
    HEADER_SIZE as u128 + encoded_subtree_size(content_len, true)
}

fn split_output_at<'a>(
    output: &'a mut [u8],
    left_content_len: u64,
    outboard: bool,
) -> (&'a mut [u8], &'a mut [u8]) {
    let left_output_len = encoded_subtree_size(left_content_len, outboard) as usize;
    output.split_at_mut(left_output_len)
}

fn encode_recurse(
    input: &[u8],
    output: &mut [u8],
    finalization: Finalization,
    outboard: bool,
) -> Hash {
    debug_assert_eq!(
        output.len() as u128,
        encoded_subtree_size(input.len() as u64, outboard),
    );
    if input.len() <= CHUNK_SIZE {
        if !outboard {
            output.copy_from_slice(input);
        }
        return hash::hash_chunk(input, finalization);
    }
    let (left_input, right_input) = input.split_at(left_len(input.len() as u64) as usize);
    let (parent_output, children_output) = output.split_at_mut(PARENT_SIZE);
    let (left_output, right_output) =
        split_output_at(children_output, left_input.len() as u64, outboard);
    // Child nodes are never the root.
    let left_hash = encode_recurse(left_input, left_output, NotRoot, outboard);
    let right_hash = encode_recurse(right_input, right_output, NotRoot, outboard);
    parent_output[..HASH_SIZE].copy_from_slice(&left_hash);
    parent_output[HASH_SIZE..].copy_from_slice(&right_hash);
    hash::hash_parent(&left_hash, &right_hash, finalization)
}

fn encode_recurse_rayon(
    input: &[u8],
    output: &mut [u8],
    finalization: Finalization,
    outboard: bool,
) -> Hash {
    debug_assert_eq!(
        output.len() as u128,
        encoded_subtree_size(input.len() as u64, outboard),
    );
    if input.len() <= CHUNK_SIZE {
        if !outboard {
            output.copy_from_slice(input);
        }
        return hash::hash_chunk(input, finalization);
    }
    let (left_input, right_input) = input.split_at(left_len(input.len() as u64) as usize);
    let (parent_output, children_output) = output.split_at_mut(PARENT_SIZE);
    let (left_output, right_output) =
        split_output_at(children_output, left_input.len() as u64, outboard);
    let (left_hash, right_hash) = rayon::join(
        || encode_recurse_rayon(left_input, left_output, NotRoot, outboard),
        || encode_recurse_rayon(right_input, right_output, NotRoot, outboard),
    );
    parent_output[..HASH_SIZE].copy_from_slice(&left_hash);
    parent_output[HASH_SIZE..].copy_from_slice(&right_hash);
    hash::hash_parent(&left_hash, &right_hash, finalization)
}

fn encode_inner(input: &[u8], output: &mut [u8], outboard: bool) -> Hash {
    let content_len = input.len() as u64;
    let (header, tree) = output.split_at_mut(HEADER_SIZE);
    header.copy_from_slice(&encode_len(content_len));
    if input.len() <= hash::MAX_SINGLE_THREADED {
        encode_recurse(input, tree, Root(content_len), outboard)
    } else {
        encode_recurse_rayon(input, tree, Root(content_len), outboard)
    }
}

/// Write the combined encoding of `input` into `output`, and return the root
/// hash. The caller must supply an output buffer of exactly
/// `encoded_size(input.len())` bytes.
pub fn encode(input: &[u8], output: &mut [u8]) -> Hash {
    assert_eq!(
        output.len() as u128,
        encoded_size(input.len() as u64),
        "output is the wrong length"
    );
    encode_inner(input, output, false)
}

/// Write the outboard encoding of `input` into `output`, and return the root
/// hash. The caller must supply an output buffer of exactly
/// `outboard_size(input.len())` bytes.
pub fn encode_outboard(input: &[u8], output: &mut [u8]) -> Hash {
    assert_eq!(
        output.len() as u128,
        outboard_size(input.len() as u64),
        "output is the wrong length"
    );
    encode_inner(input, output, true)
}

/// A convenience wrapper around `encode`, which allocates a new `Vec` to hold
/// the encoding.
pub fn encode_to_vec(input: &[u8]) -> (Vec<u8>, Hash) {
    let mut output = vec![0; encoded_size(input.len() as u64) as usize];
    let hash = encode(input, &mut output);
    (output, hash)
}

/// A convenience wrapper around `encode_outboard`, which allocates a new
/// `Vec` to hold the encoding.
pub fn encode_outboard_to_vec(input: &[u8]) -> (Vec<u8>, Hash) {
    let mut output = vec![0; outboard_size(input.len() as u64) as usize];
    let hash = encode_outboard(input, &mut output);
    (output, hash)
}

/// An incremental encoder implementing `std::io::Write`.
///
/// Like the reference implementation, this buffers the entire input in
/// memory, and it writes the whole encoding to the inner writer during
/// `finish`. (A two-pass implementation can avoid the input buffer by writing
/// the tree in post-order first and then flipping it to pre-order in place,
/// but the output bytes are identical, and the buffering strategy isn't part
/// of the encoding contract.)
#[derive(Clone, Debug)]
pub struct Writer<T: Write> {
    inner: T,
    buf: Vec<u8>,
    outboard: bool,
}

impl<T: Write> Writer<T> {
    /// Make a new `Writer` that produces a combined encoding.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            outboard: false,
        }
    }

    /// Make a new `Writer` that produces an outboard encoding.
    pub fn new_outboard(inner: T) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            outboard: true,
        }
    }

    /// After feeding all the input bytes to `write`, write out the encoding
    /// and return the root hash.
    pub fn finish(&mut self) -> io::Result<Hash> {
        let (encoded, hash) = if self.outboard {
            encode_outboard_to_vec(&self.buf)
        } else {
            encode_to_vec(&self.buf)
        };
        self.inner.write_all(&encoded)?;
        self.inner.flush()?;
        Ok(hash)
    }
}

impl<T: Write> Write for Writer<T> {
    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(input);
        Ok(input.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
