use sha1::{Digest, Sha1};
use turbopath::AbsoluteSystemPath;

use crate::Error;

/// Hashes file contents exactly the way `git hash-object` does, so hashes
/// from the index and hashes computed from disk are interchangeable.
pub(crate) fn hash_object(path: &AbsoluteSystemPath) -> Result<String, Error> {
    let contents = path.read()?;
    Ok(hash_bytes(&contents))
}

pub(crate) fn hash_bytes(contents: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", contents.len()).as_bytes());
    hasher.update(contents);
    hex::encode(hasher.finalize())
}
