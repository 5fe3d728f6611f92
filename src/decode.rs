//! Verify an encoded stream against a known root hash, and emit the content.
//!
//! Decoding works through the tree top-down. The header claims a content
//! length, which fixes the entire tree shape, and the root node is verified
//! against the caller's hash with that length in the finalization. After
//! that, every parent node vouches for its two children, and no chunk byte is
//! emitted before the chunk it belongs to has been verified. The first
//! failure of any kind is fatal to the whole decode.
//!
//! This module also implements slices: `SliceExtractor` cuts a self-contained
//! sub-encoding out of a full encoding without verifying anything, and
//! `SliceReader` verifies such a slice against the same root hash the full
//! encoding has.

use constant_time_eq::constant_time_eq;
use rayon;
use std::cmp;
use std::io;
use std::io::prelude::*;
use std::io::SeekFrom;

use crate::encode::{encoded_size, encoded_subtree_size};
use crate::hash::Finalization::{self, NotRoot, Root};
use crate::hash::{
    self, decode_len, left_len, Hash, ParentNode, CHUNK_SIZE, HASH_SIZE, HEADER_SIZE, PARENT_SIZE,
};

fn hash_mismatch() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "hash mismatch")
}

// All hash comparisons go through these two functions. The constant-time
// comparison keeps a decoder from leaking how much of a forged node's hash
// happened to match.
pub(crate) fn verify_chunk(
    chunk: &[u8],
    expected_hash: &Hash,
    finalization: Finalization,
) -> io::Result<()> {
    let found_hash = hash::hash_chunk(chunk, finalization);
    if constant_time_eq(&found_hash, expected_hash) {
        Ok(())
    } else {
        Err(hash_mismatch())
    }
}

pub(crate) fn verify_parent(
    parent: &ParentNode,
    expected_hash: &Hash,
    finalization: Finalization,
) -> io::Result<()> {
    let found_hash = hash::hash_parent_node(parent, finalization);
    if constant_time_eq(&found_hash, expected_hash) {
        Ok(())
    } else {
        Err(hash_mismatch())
    }
}

fn read_header<T: Read + ?Sized>(reader: &mut T) -> io::Result<u64> {
    let mut bytes = [0; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;
    Ok(decode_len(&bytes))
}

fn read_parent<T: Read + ?Sized>(reader: &mut T) -> io::Result<ParentNode> {
    let mut bytes = [0; PARENT_SIZE];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn split_parent(parent: &ParentNode) -> (Hash, Hash) {
    let left_hash = *array_ref!(parent, 0, HASH_SIZE);
    let right_hash = *array_ref!(parent, HASH_SIZE, HASH_SIZE);
    (left_hash, right_hash)
}

/// Parse the header of a combined encoding, and confirm that the buffer is
/// exactly as long as the header claims. An encoding with any other length
/// has no valid interpretation, and accepting one would let two different
/// buffers decode under the same root hash.
pub fn parse_and_check_content_len(encoded: &[u8]) -> io::Result<u64> {
    if encoded.len() < HEADER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for header",
        ));
    }
    let content_len = decode_len(array_ref!(encoded, 0, HEADER_SIZE));
    if encoded.len() as u128 != encoded_size(content_len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "encoded length doesn't match header",
        ));
    }
    Ok(content_len)
}

fn decode_recurse(
    encoded: &[u8],
    output: &mut [u8],
    hash: &Hash,
    finalization: Finalization,
) -> io::Result<()> {
    debug_assert_eq!(
        encoded.len() as u128,
        encoded_subtree_size(output.len() as u64, false),
    );
    if output.len() <= CHUNK_SIZE {
        verify_chunk(encoded, hash, finalization)?;
        output.copy_from_slice(encoded);
        return Ok(());
    }
    let parent = array_ref!(encoded, 0, PARENT_SIZE);
    verify_parent(parent, hash, finalization)?;
    let (left_hash, right_hash) = split_parent(parent);
    let (left_output, right_output) = output.split_at_mut(left_len(output.len() as u64) as usize);
    let left_encoded_len = encoded_subtree_size(left_output.len() as u64, false) as usize;
    let (left_encoded, right_encoded) = encoded[PARENT_SIZE..].split_at(left_encoded_len);
    // Child nodes are never the root.
    decode_recurse(left_encoded, left_output, &left_hash, NotRoot)?;
    decode_recurse(right_encoded, right_output, &right_hash, NotRoot)
}

fn decode_recurse_rayon(
    encoded: &[u8],
    output: &mut [u8],
    hash: &Hash,
    finalization: Finalization,
) -> io::Result<()> {
    debug_assert_eq!(
        encoded.len() as u128,
        encoded_subtree_size(output.len() as u64, false),
    );
    if output.len() <= CHUNK_SIZE {
        verify_chunk(encoded, hash, finalization)?;
        output.copy_from_slice(encoded);
        return Ok(());
    }
    // The parent is verified before either child is looked at, so a forged
    // child subtree never gets decoded in parallel with anything.
    let parent = array_ref!(encoded, 0, PARENT_SIZE);
    verify_parent(parent, hash, finalization)?;
    let (left_hash, right_hash) = split_parent(parent);
    let (left_output, right_output) = output.split_at_mut(left_len(output.len() as u64) as usize);
    let left_encoded_len = encoded_subtree_size(left_output.len() as u64, false) as usize;
    let (left_encoded, right_encoded) = encoded[PARENT_SIZE..].split_at(left_encoded_len);
    let (left_result, right_result) = rayon::join(
        || decode_recurse_rayon(left_encoded, left_output, &left_hash, NotRoot),
        || decode_recurse_rayon(right_encoded, right_output, &right_hash, NotRoot),
    );
    left_result?;
    right_result
}

/// Verify a combined encoding against the root hash, writing the content
/// into `output`, which must be exactly the content length claimed by the
/// header. Returns the number of content bytes.
pub fn decode(encoded: &[u8], output: &mut [u8], hash: &Hash) -> io::Result<usize> {
    let content_len = parse_and_check_content_len(encoded)?;
    assert_eq!(
        output.len() as u64,
        content_len,
        "output is the wrong length"
    );
    let tree = &encoded[HEADER_SIZE..];
    if content_len <= hash::MAX_SINGLE_THREADED as u64 {
        decode_recurse(tree, output, hash, Root(content_len))?;
    } else {
        decode_recurse_rayon(tree, output, hash, Root(content_len))?;
    }
    Ok(content_len as usize)
}

/// A convenience wrapper around `decode`, which allocates a new `Vec` to hold
/// the content.
pub fn decode_to_vec(encoded: &[u8], hash: &Hash) -> io::Result<Vec<u8>> {
    let content_len = parse_and_check_content_len(encoded)?;
    let mut output = vec![0; content_len as usize];
    decode(encoded, &mut output, hash)?;
    Ok(output)
}

/// Recover the root hash from a combined encoding. Only the header and the
/// root node get read, so this doesn't verify any content. The returned hash
/// is what verification of the rest of the encoding would be against.
pub fn hash_from_encoded<T: Read>(reader: &mut T) -> io::Result<Hash> {
    let content_len = read_header(reader)?;
    if content_len <= CHUNK_SIZE as u64 {
        let mut chunk = [0; CHUNK_SIZE];
        let chunk = &mut chunk[..content_len as usize];
        reader.read_exact(chunk)?;
        Ok(hash::hash_chunk(chunk, Root(content_len)))
    } else {
        let parent = read_parent(reader)?;
        Ok(hash::hash_parent_node(&parent, Root(content_len)))
    }
}

/// The same as `hash_from_encoded`, but for an outboard tree with a separate
/// content stream. The content stream is only read in the single-chunk case,
/// where the root node is the content itself.
pub fn hash_from_outboard_encoded<T: Read, O: Read>(
    content: &mut T,
    outboard: &mut O,
) -> io::Result<Hash> {
    let content_len = read_header(outboard)?;
    if content_len <= CHUNK_SIZE as u64 {
        let mut chunk = [0; CHUNK_SIZE];
        let chunk = &mut chunk[..content_len as usize];
        content.read_exact(chunk)?;
        Ok(hash::hash_chunk(chunk, Root(content_len)))
    } else {
        let parent = read_parent(outboard)?;
        Ok(hash::hash_parent_node(&parent, Root(content_len)))
    }
}

/// An incremental verified decoder implementing `std::io::Read`.
///
/// The decoder walks the tree with an explicit stack of expected subtree
/// hashes, in place of the recursion the buffer-at-once `decode` uses. Every
/// parent and chunk is verified as it's read, and chunk bytes only become
/// readable after their hash checks out. Trailing bytes after the end of the
/// tree are never read.
pub struct Reader<T: Read, O: Read> {
    input: T,
    outboard: Option<O>,
    root_hash: Hash,
    header_read: bool,
    // The subtree stack, topmost entries at the back.
    stack: Vec<(Hash, u64, Finalization)>,
    out_buf: Vec<u8>,
}

impl<T: Read> Reader<T, T> {
    /// Make a new `Reader` over a combined encoding.
    pub fn new(inner: T, hash: &Hash) -> Self {
        Self::new_inner(inner, None, hash)
    }
}

impl<T: Read, O: Read> Reader<T, O> {
    /// Make a new `Reader` over an outboard tree and a separate content
    /// stream.
    pub fn new_outboard(inner: T, outboard: O, hash: &Hash) -> Self {
        Self::new_inner(inner, Some(outboard), hash)
    }

    fn new_inner(inner: T, outboard: Option<O>, hash: &Hash) -> Self {
        Self {
            input: inner,
            outboard,
            root_hash: *hash,
            header_read: false,
            stack: Vec::new(),
            out_buf: Vec::new(),
        }
    }

    fn tree_stream(&mut self) -> &mut dyn Read {
        match self.outboard {
            Some(ref mut outboard) => outboard,
            None => &mut self.input,
        }
    }

    // Read and verify the next chunk of the tree, leaving its bytes in
    // out_buf. Does nothing once the tree is exhausted.
    fn advance(&mut self) -> io::Result<()> {
        if !self.header_read {
            let content_len = read_header(self.tree_stream())?;
            self.stack
                .push((self.root_hash, content_len, Root(content_len)));
            self.header_read = true;
        }
        if self.stack.is_empty() {
            return Ok(());
        }
        // Descend through parent nodes until the top of the stack is a chunk.
        loop {
            let &(hash, subtree_len, finalization) = self.stack.last().unwrap();
            if subtree_len <= CHUNK_SIZE as u64 {
                break;
            }
            let parent = read_parent(self.tree_stream())?;
            verify_parent(&parent, &hash, finalization)?;
            let (left_hash, right_hash) = split_parent(&parent);
            let left = left_len(subtree_len);
            self.stack.pop();
            self.stack.push((right_hash, subtree_len - left, NotRoot));
            self.stack.push((left_hash, left, NotRoot));
        }
        let &(hash, chunk_len, finalization) = self.stack.last().unwrap();
        let mut chunk = [0; CHUNK_SIZE];
        let chunk = &mut chunk[..chunk_len as usize];
        self.input.read_exact(chunk)?;
        verify_chunk(chunk, &hash, finalization)?;
        // Only pop once the chunk has been verified, so that a failed call
        // fails again if it's retried.
        self.stack.pop();
        self.out_buf.extend_from_slice(chunk);
        Ok(())
    }
}

impl<T: Read, O: Read> Read for Reader<T, O> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.out_buf.is_empty() {
            self.advance()?;
        }
        // Emitting zero bytes with an empty stack is EOF.
        let take = cmp::min(self.out_buf.len(), buf.len());
        buf[..take].copy_from_slice(&self.out_buf[..take]);
        self.out_buf.drain(..take);
        Ok(take)
    }
}

fn invalid_range() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "slice range exceeds addressable bytes",
    )
}

fn skip_forward<T: Seek>(stream: &mut T, len: u64) -> io::Result<()> {
    if len > i64::max_value() as u64 {
        return Err(invalid_range());
    }
    stream.seek(SeekFrom::Current(len as i64))?;
    Ok(())
}

/// Extract the slice covering `[slice_start, slice_start + slice_len)` from a
/// full encoding, implementing `std::io::Read` over the resulting bytes.
///
/// The extractor is pure transport. It doesn't verify anything, and it
/// doesn't need the root hash; a tampered input produces a slice that
/// `SliceReader` will reject. The input must be seekable, to skip over the
/// subtrees that aren't part of the slice. The output is always a combined
/// encoding, even when the input is outboard.
///
/// The root node is always included in the slice, even when the requested
/// range is empty or past the end of the content, so that the recipient
/// always verifies the root hash and the length it commits to.
pub struct SliceExtractor<T: Read + Seek, O: Read + Seek> {
    input: T,
    outboard: Option<O>,
    slice_start: u64,
    slice_len: u64,
    header_read: bool,
    // (subtree_start, subtree_len, is_root), topmost entries at the back.
    stack: Vec<(u64, u64, bool)>,
    out_buf: Vec<u8>,
}

impl<T: Read + Seek> SliceExtractor<T, T> {
    /// Make a new `SliceExtractor` over a combined encoding.
    pub fn new(input: T, slice_start: u64, slice_len: u64) -> Self {
        Self::new_inner(input, None, slice_start, slice_len)
    }
}

impl<T: Read + Seek, O: Read + Seek> SliceExtractor<T, O> {
    /// Make a new `SliceExtractor` over an outboard tree and a separate
    /// content stream.
    pub fn new_outboard(input: T, outboard: O, slice_start: u64, slice_len: u64) -> Self {
        Self::new_inner(input, Some(outboard), slice_start, slice_len)
    }

    fn new_inner(input: T, outboard: Option<O>, slice_start: u64, slice_len: u64) -> Self {
        Self {
            input,
            outboard,
            slice_start,
            slice_len,
            header_read: false,
            stack: Vec::new(),
            out_buf: Vec::new(),
        }
    }

    fn tree_stream(&mut self) -> &mut dyn ReadSeek {
        match self.outboard {
            Some(ref mut outboard) => outboard,
            None => &mut self.input,
        }
    }

    // Stage the next piece of the slice into out_buf. A single call emits at
    // most one node; the caller loops.
    fn advance(&mut self) -> io::Result<()> {
        let slice_end = self
            .slice_start
            .checked_add(self.slice_len)
            .ok_or_else(invalid_range)?;
        if !self.header_read {
            let mut header = [0; HEADER_SIZE];
            self.tree_stream().read_exact(&mut header)?;
            let content_len = decode_len(&header);
            self.out_buf.extend_from_slice(&header);
            self.stack.push((0, content_len, true));
            self.header_read = true;
            return Ok(());
        }
        let (subtree_start, subtree_len, is_root) = match self.stack.pop() {
            Some(subtree) => subtree,
            None => return Ok(()), // done
        };
        let subtree_end = subtree_start + subtree_len;
        if subtree_end <= self.slice_start && !is_root {
            // This subtree is entirely before the slice. Seek past its parent
            // nodes in the tree stream and its content in the content stream.
            let parent_nodes_size = encoded_subtree_size(subtree_len, true) as u64;
            match self.outboard {
                Some(ref mut outboard) => {
                    skip_forward(outboard, parent_nodes_size)?;
                    skip_forward(&mut self.input, subtree_len)?;
                }
                None => {
                    skip_forward(&mut self.input, parent_nodes_size)?;
                    skip_forward(&mut self.input, subtree_len)?;
                }
            }
        } else if slice_end <= subtree_start && !is_root {
            // Everything in the slice has been emitted.
        } else if subtree_len <= CHUNK_SIZE as u64 {
            // The subtree is a single chunk. The recipient needs the whole
            // chunk to verify its hash, regardless of how much of it the
            // slice range covers.
            let mut chunk = [0; CHUNK_SIZE];
            let chunk = &mut chunk[..subtree_len as usize];
            self.input.read_exact(chunk)?;
            self.out_buf.extend_from_slice(chunk);
        } else {
            // Emit the parent node and recurse. Note that the children are
            // never the root.
            let mut parent = [0; PARENT_SIZE];
            self.tree_stream().read_exact(&mut parent)?;
            self.out_buf.extend_from_slice(&parent);
            let left = left_len(subtree_len);
            self.stack
                .push((subtree_start + left, subtree_len - left, false));
            self.stack.push((subtree_start, left, false));
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.header_read && self.stack.is_empty()
    }
}

// Object-safe Read + Seek, for the combined/outboard tree stream selection.
trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

impl<T: Read + Seek, O: Read + Seek> Read for SliceExtractor<T, O> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.out_buf.is_empty() && !self.done() {
            self.advance()?;
        }
        let take = cmp::min(self.out_buf.len(), buf.len());
        buf[..take].copy_from_slice(&self.out_buf[..take]);
        self.out_buf.drain(..take);
        Ok(take)
    }
}

/// Verify a slice produced by `SliceExtractor` against the root hash, and
/// emit the content bytes of `[slice_start, min(content_len, slice_start +
/// slice_len))`, implementing `std::io::Read`.
///
/// The caller must pass the same `slice_start` and `slice_len` the slice was
/// extracted with. The root node is always present and always verified, so
/// even an empty or past-the-end request confirms the root hash and the
/// content length.
pub struct SliceReader<T: Read> {
    input: T,
    root_hash: Hash,
    slice_start: u64,
    slice_len: u64,
    header_read: bool,
    // (subtree_start, subtree_len, expected hash, finalization), topmost
    // entries at the back.
    stack: Vec<(u64, u64, Hash, Finalization)>,
    out_buf: Vec<u8>,
}

impl<T: Read> SliceReader<T> {
    pub fn new(input: T, hash: &Hash, slice_start: u64, slice_len: u64) -> Self {
        Self {
            input,
            root_hash: *hash,
            slice_start,
            slice_len,
            header_read: false,
            stack: Vec::new(),
            out_buf: Vec::new(),
        }
    }

    // Verify the next node of the slice, staging any content bytes that fall
    // inside the requested range into out_buf.
    fn advance(&mut self) -> io::Result<()> {
        let slice_end = self
            .slice_start
            .checked_add(self.slice_len)
            .ok_or_else(invalid_range)?;
        if !self.header_read {
            let content_len = read_header(&mut self.input)?;
            self.stack
                .push((0, content_len, self.root_hash, Root(content_len)));
            self.header_read = true;
        }
        let (subtree_start, subtree_len, hash, finalization) = match self.stack.pop() {
            Some(subtree) => subtree,
            None => return Ok(()), // done
        };
        let is_root = match finalization {
            Root(_) => true,
            NotRoot => false,
        };
        let subtree_end = subtree_start + subtree_len;
        if subtree_end <= self.slice_start && !is_root {
            // This subtree is before the slice, and the extractor omitted it.
        } else if slice_end <= subtree_start && !is_root {
            // Everything in the slice has been verified.
        } else if subtree_len <= CHUNK_SIZE as u64 {
            // The subtree is a whole chunk in the slice. Verify all of it,
            // then emit the intersection with the requested range.
            let mut chunk = [0; CHUNK_SIZE];
            let chunk = &mut chunk[..subtree_len as usize];
            self.input.read_exact(chunk)?;
            verify_chunk(chunk, &hash, finalization)?;
            let chunk_start = cmp::min(subtree_len, self.slice_start.saturating_sub(subtree_start));
            let chunk_end = cmp::min(subtree_len, slice_end.saturating_sub(subtree_start));
            self.out_buf
                .extend_from_slice(&chunk[chunk_start as usize..chunk_end as usize]);
        } else {
            let parent = read_parent(&mut self.input)?;
            verify_parent(&parent, &hash, finalization)?;
            let (left_hash, right_hash) = split_parent(&parent);
            let left = left_len(subtree_len);
            self.stack
                .push((subtree_start + left, subtree_len - left, right_hash, NotRoot));
            self.stack.push((subtree_start, left, left_hash, NotRoot));
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.header_read && self.stack.is_empty()
    }
}

impl<T: Read> Read for SliceReader<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.out_buf.is_empty() && !self.done() {
            self.advance()?;
        }
        let take = cmp::min(self.out_buf.len(), buf.len());
        buf[..take].copy_from_slice(&self.out_buf[..take]);
        self.out_buf.drain(..take);
        Ok(take)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encode;
    use crate::hash::{make_test_input, TEST_CASES};
    use rand::prelude::*;
    use std::io::prelude::*;
    use std::io::Cursor;

    #[test]
    fn test_decode_round_trip() {
        for &case in TEST_CASES {
            let input = make_test_input(case);
            let (encoded, hash) = encode::encode_to_vec(&input);
            let output = decode_to_vec(&encoded, &hash).unwrap();
            assert_eq!(input, output, "case {}", case);
        }
    }

    #[test]
    fn test_reader_round_trip() {
        for &case in TEST_CASES {
            let input = make_test_input(case);
            let (encoded, hash) = encode::encode_to_vec(&input);
            let mut reader = Reader::new(&encoded[..], &hash);
            let mut output = Vec::new();
            reader.read_to_end(&mut output).unwrap();
            assert_eq!(input, output, "case {}", case);
        }
    }

    #[test]
    fn test_outboard_round_trip() {
        for &case in TEST_CASES {
            let input = make_test_input(case);
            let (outboard, hash) = encode::encode_outboard_to_vec(&input);
            let mut reader = Reader::new_outboard(&input[..], &outboard[..], &hash);
            let mut output = Vec::new();
            reader.read_to_end(&mut output).unwrap();
            assert_eq!(input, output, "case {}", case);
        }
    }

    #[test]
    fn test_reader_one_byte_at_a_time() {
        let input = make_test_input(2 * CHUNK_SIZE + 1);
        let (encoded, hash) = encode::encode_to_vec(&input);
        let mut reader = Reader::new(&encoded[..], &hash);
        let mut output = Vec::new();
        let mut byte = [0];
        loop {
            let n = reader.read(&mut byte).unwrap();
            if n == 0 {
                break;
            }
            output.push(byte[0]);
        }
        assert_eq!(input, output);
    }

    #[test]
    fn test_trailing_garbage_is_ignored() {
        // The reader never reads past the end of the tree, so bytes appended
        // to an encoding don't affect decoding.
        for &case in TEST_CASES {
            let input = make_test_input(case);
            let (mut encoded, hash) = encode::encode_to_vec(&input);
            encoded.extend_from_slice(b"trailing garbage");
            let mut reader = Reader::new(&encoded[..], &hash);
            let mut output = Vec::new();
            reader.read_to_end(&mut output).unwrap();
            assert_eq!(input, output, "case {}", case);
        }
    }

    #[test]
    fn test_hash_from_encoded() {
        for &case in TEST_CASES {
            let input = make_test_input(case);
            let (encoded, hash) = encode::encode_to_vec(&input);
            let found = hash_from_encoded(&mut &encoded[..]).unwrap();
            assert_eq!(hash, found, "case {}", case);

            let (outboard, _) = encode::encode_outboard_to_vec(&input);
            let found =
                hash_from_outboard_encoded(&mut &input[..], &mut &outboard[..]).unwrap();
            assert_eq!(hash, found, "case {}", case);
        }
    }

    #[test]
    fn test_wrong_hash_fails() {
        for &case in TEST_CASES {
            let input = make_test_input(case);
            let (encoded, hash) = encode::encode_to_vec(&input);
            let mut bad_hash = hash;
            bad_hash[0] ^= 1;
            let err = decode_to_vec(&encoded, &bad_hash).unwrap_err();
            assert_eq!(io::ErrorKind::InvalidData, err.kind(), "case {}", case);
        }
    }

    // Sample byte positions across an encoding, always including the first
    // and last. Flipping every single byte of the bigger cases would take too
    // long under the debug profile.
    fn corruption_offsets(len: usize) -> Vec<usize> {
        let mut offsets: Vec<usize> = (0..len).step_by(cmp::max(1, len / 37)).collect();
        offsets.push(len - 1);
        offsets
    }

    #[test]
    fn test_corrupted_encoding_fails() {
        for &case in TEST_CASES {
            let input = make_test_input(case);
            let (encoded, hash) = encode::encode_to_vec(&input);
            for &offset in &corruption_offsets(encoded.len()) {
                let mut corrupted = encoded.clone();
                corrupted[offset] ^= 1;
                // A corrupted header fails the length check; anything else is
                // a hash mismatch. Both are InvalidData.
                let err = decode_to_vec(&corrupted, &hash).unwrap_err();
                assert_eq!(
                    io::ErrorKind::InvalidData,
                    err.kind(),
                    "case {} offset {}",
                    case,
                    offset
                );

                let mut reader = Reader::new(&corrupted[..], &hash);
                let mut output = Vec::new();
                reader.read_to_end(&mut output).unwrap_err();
            }
        }
    }

    #[test]
    fn test_truncated_encoding_fails() {
        for &case in TEST_CASES {
            let input = make_test_input(case);
            let (encoded, hash) = encode::encode_to_vec(&input);
            let truncated = &encoded[..encoded.len() - 1];
            decode_to_vec(truncated, &hash).unwrap_err();
            let mut reader = Reader::new(truncated, &hash);
            let mut output = Vec::new();
            let err = reader.read_to_end(&mut output).unwrap_err();
            assert_eq!(io::ErrorKind::UnexpectedEof, err.kind(), "case {}", case);
        }
    }

    fn make_slice(
        encoded: &[u8],
        outboard_pair: Option<(&[u8], &[u8])>,
        slice_start: u64,
        slice_len: u64,
    ) -> Vec<u8> {
        let mut slice = Vec::new();
        match outboard_pair {
            Some((content, outboard)) => {
                let mut extractor = SliceExtractor::new_outboard(
                    Cursor::new(content),
                    Cursor::new(outboard),
                    slice_start,
                    slice_len,
                );
                extractor.read_to_end(&mut slice).unwrap();
            }
            None => {
                let mut extractor =
                    SliceExtractor::new(Cursor::new(encoded), slice_start, slice_len);
                extractor.read_to_end(&mut slice).unwrap();
            }
        }
        slice
    }

    fn decode_slice(slice: &[u8], hash: &Hash, slice_start: u64, slice_len: u64) -> io::Result<Vec<u8>> {
        let mut reader = SliceReader::new(slice, hash, slice_start, slice_len);
        let mut output = Vec::new();
        reader.read_to_end(&mut output)?;
        Ok(output)
    }

    #[test]
    fn test_slice_round_trip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        for &case in TEST_CASES {
            let input = make_test_input(case);
            let (encoded, hash) = encode::encode_to_vec(&input);
            let (outboard, _) = encode::encode_outboard_to_vec(&input);
            let mut params: Vec<(u64, u64)> = vec![
                (0, 0),
                (0, 1),
                (0, case as u64),
                (case as u64, 0),
                (case as u64 + 10, 100),
            ];
            for _ in 0..4 {
                let start = rng.gen_range(0, case as u64 + 2);
                let len = rng.gen_range(0, case as u64 + 2);
                params.push((start, len));
            }
            for &(slice_start, slice_len) in &params {
                let slice = make_slice(&encoded, None, slice_start, slice_len);
                // Slicing an outboard encoding produces the same bytes.
                let outboard_slice = make_slice(
                    &encoded,
                    Some((&input, &outboard)),
                    slice_start,
                    slice_len,
                );
                assert_eq!(slice, outboard_slice, "case {}", case);

                let output = decode_slice(&slice, &hash, slice_start, slice_len).unwrap();
                let expected_start = cmp::min(case as u64, slice_start) as usize;
                let expected_end =
                    cmp::min(case as u64, slice_start.saturating_add(slice_len)) as usize;
                assert_eq!(
                    &input[expected_start..cmp::max(expected_start, expected_end)],
                    &output[..],
                    "case {} start {} len {}",
                    case,
                    slice_start,
                    slice_len
                );
            }
        }
    }

    #[test]
    fn test_slice_exact_sizes() {
        // Three chunks plus one byte. Slicing the first byte takes the
        // header, the root parent, the left subtree's parent, and the first
        // chunk, and nothing else.
        let input = make_test_input(3 * CHUNK_SIZE + 1);
        let (encoded, hash) = encode::encode_to_vec(&input);
        let slice = make_slice(&encoded, None, 0, 1);
        assert_eq!(
            HEADER_SIZE + PARENT_SIZE + PARENT_SIZE + CHUNK_SIZE,
            slice.len()
        );
        let output = decode_slice(&slice, &hash, 0, 1).unwrap();
        assert_eq!(&input[..1], &output[..]);
    }

    #[test]
    fn test_slice_past_eof_verifies_root() {
        for &case in &[0, 1, CHUNK_SIZE, 3 * CHUNK_SIZE + 1] {
            let input = make_test_input(case);
            let (encoded, hash) = encode::encode_to_vec(&input);
            let slice_start = case as u64 + 10;
            let slice = make_slice(&encoded, None, slice_start, 100);
            // Past the end of content, the slice is the header and the root
            // node alone.
            let expected_len = if case <= CHUNK_SIZE {
                HEADER_SIZE + case
            } else {
                HEADER_SIZE + PARENT_SIZE
            };
            assert_eq!(expected_len, slice.len(), "case {}", case);
            let output = decode_slice(&slice, &hash, slice_start, 100).unwrap();
            assert!(output.is_empty(), "case {}", case);

            // The root is still verified. Tampering with the header or the
            // root node fails, even though no content is requested.
            for offset in 0..slice.len() {
                let mut corrupted = slice.clone();
                corrupted[offset] ^= 1;
                decode_slice(&corrupted, &hash, slice_start, 100).unwrap_err();
            }
        }
    }

    #[test]
    fn test_corrupted_slice_fails() {
        let input = make_test_input(8 * CHUNK_SIZE + 1);
        let (encoded, hash) = encode::encode_to_vec(&input);
        let slice_start = CHUNK_SIZE as u64;
        let slice_len = 2 * CHUNK_SIZE as u64;
        let slice = make_slice(&encoded, None, slice_start, slice_len);
        for &offset in &corruption_offsets(slice.len()) {
            let mut corrupted = slice.clone();
            corrupted[offset] ^= 1;
            let err = decode_slice(&corrupted, &hash, slice_start, slice_len).unwrap_err();
            assert_eq!(io::ErrorKind::InvalidData, err.kind(), "offset {}", offset);
        }
    }

    #[test]
    fn test_invalid_slice_range_fails() {
        let input = make_test_input(CHUNK_SIZE);
        let (encoded, hash) = encode::encode_to_vec(&input);
        let mut extractor =
            SliceExtractor::new(Cursor::new(&encoded), u64::max_value(), u64::max_value());
        let mut out = Vec::new();
        let err = extractor.read_to_end(&mut out).unwrap_err();
        assert_eq!(io::ErrorKind::InvalidInput, err.kind());

        let slice = make_slice(&encoded, None, 0, CHUNK_SIZE as u64);
        let err = decode_slice(&slice, &hash, u64::max_value(), u64::max_value()).unwrap_err();
        assert_eq!(io::ErrorKind::InvalidInput, err.kind());
    }
}
