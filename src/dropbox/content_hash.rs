use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Block size used by the Dropbox content hash.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

const READ_BUFFER: usize = 64 * 1024;

/// Incremental Dropbox content hash: SHA-256 over the concatenated SHA-256
/// digests of each 4 MiB block, as lowercase hex.
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    filled: usize,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.filled).min(data.len());
            self.block.update(&data[..take]);
            self.filled += take;
            data = &data[take..];
            if self.filled == BLOCK_SIZE {
                self.finish_block();
            }
        }
    }

    pub fn finalize(mut self) -> String {
        if self.filled > 0 {
            self.finish_block();
        }
        format!("{:x}", self.overall.finalize())
    }

    fn finish_block(&mut self) {
        let block = std::mem::take(&mut self.block);
        self.overall.update(block.finalize());
        self.filled = 0;
    }
}

pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Hash a file without holding more than one read buffer in memory.
pub async fn content_hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; READ_BUFFER];
    let mut hasher = ContentHasher::new();
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
