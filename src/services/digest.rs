//! MD5 integrity digests rendered as base64, the form stored in object
//! metadata.

use base64::{Engine as _, engine::general_purpose};
use md5::Context;
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::content::Chunk;

const READ_BUFFER_BYTES: usize = 1024 * 1024;
static ZERO_BLOCK: [u8; 64 * 1024] = [0; 64 * 1024];

/// Hash a file by re-reading it from disk, so the digest covers exactly
/// what was persisted.
pub async fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut digest = Context::new();
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        digest.consume(&buffer[..n]);
    }
    Ok(encode(digest))
}

/// Hash a chunk sequence directly, without touching disk.
pub fn digest_chunks<'a, I>(chunks: I) -> String
where
    I: IntoIterator<Item = &'a Chunk>,
{
    let mut digest = Context::new();
    for chunk in chunks {
        match chunk {
            Chunk::Zero(n) => {
                let mut left = *n;
                while left > 0 {
                    let step = left.min(ZERO_BLOCK.len());
                    digest.consume(&ZERO_BLOCK[..step]);
                    left -= step;
                }
            }
            Chunk::Data(bytes) => digest.consume(bytes),
        }
    }
    encode(digest)
}

fn encode(digest: Context) -> String {
    general_purpose::STANDARD.encode(digest.compute().0)
}
