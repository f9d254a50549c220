use anyhow::Result;
use std::path::Path;
use tokio::io::AsyncReadExt;

// Above this, pulling the file through the page cache beats a direct read.
const MMAP_THRESHOLD: u64 = 64 * 1024;

pub async fn read_content(path: &Path, size: u64) -> Result<Vec<u8>> {
    if size <= MMAP_THRESHOLD {
        return Ok(tokio::fs::read(path).await?);
    }

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let file = std::fs::File::open(&path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Ok(mmap.to_vec())
    })
    .await?
}

// At most max bytes from the start, for binary sniffing without paying for
// the whole content.
pub async fn read_head(path: &Path, max: usize) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; max];
    let mut filled = 0;
    while filled < max {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
