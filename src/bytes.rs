use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::TARGET_PARTS;

/// Number of parts a file of `file_size` bytes is split into.
///
/// - empty file: one empty part
/// - fewer than `TARGET_PARTS` bytes: one byte per part
/// - otherwise: exactly `TARGET_PARTS` parts
pub fn part_count(file_size: u64) -> u64 {
    if file_size == 0 {
        1
    } else if file_size < TARGET_PARTS {
        file_size
    } else {
        TARGET_PARTS
    }
}

/// Size of every part but the last (which holds the remainder).
pub fn part_size(file_size: u64) -> u64 {
    if file_size == 0 {
        0
    } else if file_size < TARGET_PARTS {
        1
    } else {
        file_size.div_ceil(TARGET_PARTS)
    }
}

/// Splits `content` into parts by the fixed policy of [`part_count`].
///
/// Each part is `ceil(len / 3)` bytes except the last, which may be smaller
/// but never larger.
pub fn split_parts(content: &[u8]) -> Vec<&[u8]> {
    let file_size = content.len() as u64;
    let count = part_count(file_size);
    let size = part_size(file_size) as usize;

    (0..count as usize)
        .map(|i| {
            let start = (i * size).min(content.len());
            let end = ((i + 1) * size).min(content.len());
            &content[start..end]
        })
        .collect()
}

/// Concatenates decrypted parts in strictly ascending index order.
///
/// Every index in `[0, num_parts)` must be present; arrival order is irrelevant.
pub fn reassemble(chunks: &BTreeMap<u64, Vec<u8>>, num_parts: u64) -> Result<Vec<u8>> {
    let total: usize = chunks.values().map(Vec::len).sum();
    let mut content = Vec::with_capacity(total);

    for index in 0..num_parts {
        let part = chunks.get(&index).ok_or(Error::Incomplete {
            expected: num_parts,
            received: chunks.len() as u64,
        })?;
        content.extend_from_slice(part);
    }
    Ok(content)
}

/// Reduces a peer-declared filename to its final normal path component.
///
/// Returns `None` when nothing usable is left (empty, `..`, a bare root).
pub fn sanitize_filename(declared: &str) -> Option<String> {
    // Treat both separators alike regardless of the receiver's platform.
    let normalized = declared.replace('\\', "/");
    match Path::new(&normalized).components().next_back() {
        Some(Component::Normal(name)) => name.to_str().map(str::to_string),
        _ => None,
    }
}

/// Writes a reassembled file into `storage_dir`, replacing any file of the
/// same name.
pub async fn persist_file(storage_dir: &Path, filename: &str, content: &[u8]) -> Result<PathBuf> {
    let name = sanitize_filename(filename)
        .ok_or_else(|| Error::protocol(format!("unusable filename '{}'", filename)))?;

    tokio::fs::create_dir_all(storage_dir).await?;
    let save_path = storage_dir.join(name);
    tokio::fs::write(&save_path, content).await?;

    debug!("Wrote {} bytes to {}", content.len(), save_path.display());
    Ok(save_path)
}
