//! content-addressable image store

mod dir;

use std::io::Read;

use crate::digest::Digest;
use crate::error::Result;
use crate::types::Descriptor;

pub use dir::DirEngine;

/// blob and reference primitives of an image store
///
/// blob writes must be idempotent and durable before returning: callers
/// rely on a blob being resolvable as soon as `put_blob` succeeds.
pub trait Engine {
    /// store a blob, returning its digest and size
    fn put_blob(&self, reader: &mut dyn Read) -> Result<(Digest, u64)>;

    /// read a blob, verifying its digest
    fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// is a blob present
    fn blob_exists(&self, digest: &Digest) -> Result<bool>;

    /// resolve a named reference
    fn get_reference(&self, name: &str) -> Result<Option<Descriptor>>;

    /// create or replace a named reference
    fn put_reference(&self, name: &str, descriptor: &Descriptor) -> Result<()>;

    /// remove a named reference, returning whether it existed
    fn delete_reference(&self, name: &str) -> Result<bool>;
}
