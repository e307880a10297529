use sha2::{Digest, Sha256};

use crate::error::UpdateError;

pub const IMAGE_CHUNK_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub bytes: u64,
    pub sha256: String,
}

/// Copies a firmware image from `read` to `write` one chunk at a time,
/// hashing it on the way. `progress` sees the running byte count once before
/// the first read and after every written chunk, so a caller can feed a
/// watchdog or publish progress between blocking reads.
///
/// `read` returns 0 at end of stream. An empty image and a digest that does
/// not match `expected_sha256` (hex, any case) are both rejected.
pub fn stream_image<R, W, P>(
    mut read: R,
    mut write: W,
    mut progress: P,
    expected_sha256: Option<&str>,
) -> Result<ImageSummary, UpdateError>
where
    R: FnMut(&mut [u8]) -> Result<usize, UpdateError>,
    W: FnMut(&[u8]) -> Result<(), UpdateError>,
    P: FnMut(u64),
{
    let mut hasher = Sha256::new();
    let mut total = 0_u64;
    let mut chunk = [0_u8; IMAGE_CHUNK_LEN];

    progress(total);
    loop {
        let len = read(&mut chunk)?.min(chunk.len());
        if len == 0 {
            break;
        }

        write(&chunk[..len])?;
        hasher.update(&chunk[..len]);
        total = total.saturating_add(len as u64);
        progress(total);
    }

    if total == 0 {
        return Err(UpdateError::InvalidImage("download body is empty".into()));
    }

    let sha256 = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();

    if let Some(expected) = expected_sha256 {
        let expected = expected.trim().to_ascii_lowercase();
        if sha256 != expected {
            return Err(UpdateError::Verification(format!(
                "sha256 mismatch (expected {expected}, got {sha256})"
            )));
        }
    }

    Ok(ImageSummary {
        bytes: total,
        sha256,
    })
}
