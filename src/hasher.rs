//! Content fingerprints for page images.

use std::{
    fs::File,
    io::{self, BufReader, Read},
};

use sha2::{Digest, Sha256};

use crate::{errors::PipelineError, prelude::*};

/// How much data we feed to the hasher at a time.
const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 digest of a stream as 64 lowercase hex characters.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; CHUNK_SIZE];
    loop {
        let count = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 digest of a file.
#[instrument(level = "trace", skip_all, fields(path = %path.display()))]
pub fn hash_file(path: &Path) -> Result<String, PipelineError> {
    let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
    hash_reader(BufReader::new(file)).map_err(|err| PipelineError::io(path, err))
}
