/*!
Content hashing for change detection.
*/

use crate::error::IoResultExt;
use crate::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const CHUNK_SIZE: usize = 64 * 1024;

/// Length of a hex-encoded digest produced by [`hash_file`]
pub const DIGEST_HEX_LEN: usize = 64;

/// Compute the SHA-256 digest of a file's contents as lowercase hex.
///
/// The file is streamed in fixed-size chunks, so memory use does not grow with
/// file size. The digest depends only on the bytes, never on the path or
/// timestamps.
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let file = File::open(path).at_path(path)?;
    hash_reader(BufReader::with_capacity(CHUNK_SIZE, file)).at_path(path)
}

/// Compute the SHA-256 digest of everything readable from `reader`.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
