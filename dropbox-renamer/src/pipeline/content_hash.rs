//! Dropbox `content_hash`: SHA-256 over the concatenated SHA-256 digests of
//! each 4 MiB block of the file.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Default)]
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_len: usize,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block_len).min(data.len());
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];
            if self.block_len == BLOCK_SIZE {
                self.finish_block();
            }
        }
    }

    pub fn finalize(mut self) -> String {
        if self.block_len > 0 {
            self.finish_block();
        }
        format!("{:x}", self.overall.finalize())
    }

    fn finish_block(&mut self) {
        let block = std::mem::take(&mut self.block);
        self.overall.update(block.finalize());
        self.block_len = 0;
    }
}

pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_hashes_no_blocks() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn single_block_is_hash_of_block_hash() {
        assert_eq!(
            content_hash(b"hello"),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn splits_on_block_boundary_regardless_of_update_sizes() {
        let data: Vec<u8> = (0..BLOCK_SIZE + 10).map(|i| (i % 251) as u8).collect();

        let mut expected = Sha256::new();
        expected.update(Sha256::digest(&data[..BLOCK_SIZE]));
        expected.update(Sha256::digest(&data[BLOCK_SIZE..]));
        let expected = format!("{:x}", expected.finalize());

        let mut chunked = ContentHasher::new();
        for chunk in data.chunks(777_777) {
            chunked.update(chunk);
        }
        assert_eq!(chunked.finalize(), expected);
        assert_eq!(content_hash(&data), expected);
    }

    #[tokio::test]
    async fn hash_file_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"some file body").unwrap();
        assert_eq!(
            hash_file(&path).await.unwrap(),
            content_hash(b"some file body")
        );
    }
}
