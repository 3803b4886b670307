use kiln_core::{ContentHash, FingerprintError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const BUFFER_SIZE: usize = 8192;

/// Stream a file's content through SHA-256
pub(crate) fn hash_file(path: &Path) -> Result<ContentHash, FingerprintError> {
    let file = File::open(path).map_err(|e| FingerprintError::from_io(path, "open", e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| FingerprintError::from_io(path, "read", e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(ContentHash::finish(hasher))
}
