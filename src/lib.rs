//! Bao is a verified streaming tree hash, built on BLAKE2b.
//!
//! The [`hash`](hash/index.html) module computes the 32-byte root hash of any
//! input. The [`encode`](encode/index.html) module serializes the underlying
//! tree together with the content, so that the
//! [`decode`](decode/index.html) module can stream the content back out
//! while verifying every byte against the root hash. Decoding also works for
//! a slice of the content, extracted with
//! [`decode::SliceExtractor`](decode/struct.SliceExtractor.html), without
//! trusting whoever produced the slice.
//!
//! # Example
//!
//! ```
//! let input = b"some bytes worth checking";
//! let hash = bao::hash::hash(input);
//! let (encoded, encoded_hash) = bao::encode::encode_to_vec(input);
//! assert_eq!(hash, encoded_hash);
//! let decoded = bao::decode::decode_to_vec(&encoded, &hash).unwrap();
//! assert_eq!(&input[..], &decoded[..]);
//!
//! // Corrupting any byte of the encoding makes decoding fail.
//! let mut bad = encoded.clone();
//! bad[12] ^= 1;
//! assert!(bao::decode::decode_to_vec(&bad, &hash).is_err());
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
extern crate arrayref;

pub mod hash;

#[cfg(feature = "std")]
pub mod decode;
#[cfg(feature = "std")]
pub mod encode;
