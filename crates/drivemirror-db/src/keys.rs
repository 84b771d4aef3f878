//! Durable key schema.
//!
//! Every key in the store is a three-character tag plus `':'` followed by the
//! variable part:
//!
//! | tag   | purpose                          | variable part              |
//! |-------|----------------------------------|----------------------------|
//! | `int` | internal scalars                 | `"checkpoint"`             |
//! | `fid` | file entity by remote id         | remote id                  |
//! | `f2i` | forward identity, id → inode     | remote id                  |
//! | `i2f` | reverse identity, inode → id     | decimal inode              |
//! | `rtf` | root set                         | remote id (value empty)    |
//! | `kid` | child set                        | `<parent id>:<child id>`   |

use drivemirror_common::{Error, Inode, Result};

/// Variable part of the checkpoint key.
pub const CHECKPOINT: &str = "checkpoint";

/// Byte offset where the variable part of every key starts.
const TAG_LEN: usize = 4;

/// Key for an internal scalar.
pub fn internal(name: &str) -> Vec<u8> {
    format!("int:{name}").into_bytes()
}

/// Entity key for a file, by remote id.
pub fn file(id: &str) -> Vec<u8> {
    format!("fid:{id}").into_bytes()
}

/// Forward identity key, remote id → inode.
pub fn id_to_inode(id: &str) -> Vec<u8> {
    format!("f2i:{id}").into_bytes()
}

/// Reverse identity key, inode → remote id.
pub fn inode_to_id(inode: Inode) -> Vec<u8> {
    format!("i2f:{inode}").into_bytes()
}

/// Root-set key; the value is empty, only the key matters.
pub fn root(id: &str) -> Vec<u8> {
    format!("rtf:{id}").into_bytes()
}

/// Child-set key linking a parent to one child; the value is empty.
pub fn child(parent: &str, child: &str) -> Vec<u8> {
    format!("kid:{parent}:{child}").into_bytes()
}

/// Prefix covering every file entity key.
pub fn file_prefix() -> Vec<u8> {
    b"fid:".to_vec()
}

/// Prefix covering the whole root set.
pub fn root_prefix() -> Vec<u8> {
    b"rtf:".to_vec()
}

/// Prefix covering every child entry of one parent.
pub fn child_prefix(parent: &str) -> Vec<u8> {
    format!("kid:{parent}:").into_bytes()
}

/// Recovers the variable part of a key, past the tag and `':'`.
pub fn tail(key: &[u8]) -> Result<&str> {
    if key.len() < TAG_LEN {
        return Err(Error::Encoding(format!("key too short: {key:?}")));
    }
    std::str::from_utf8(&key[TAG_LEN..])
        .map_err(|e| Error::Encoding(format!("non-utf8 key tail: {e}")))
}

/// Recovers the suffix of a key past the given prefix.
pub fn strip_prefix<'a>(key: &'a [u8], prefix: &[u8]) -> Result<&'a str> {
    let rest = key
        .strip_prefix(prefix)
        .ok_or_else(|| Error::Encoding(format!("key {key:?} lacks expected prefix")))?;
    std::str::from_utf8(rest).map_err(|e| Error::Encoding(format!("non-utf8 key tail: {e}")))
}
