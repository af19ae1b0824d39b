use std::path::Path;

use blake3::Hasher;
use image::imageops::FilterType;
use image::DynamicImage;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::HashError;

/// Hex digits kept from the blake3 digest.
const FAST_HASH_LEN: usize = 32;

async fn read_at(file: &mut File, offset: u64, size: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Content fingerprint from the file size and its first and last
/// `sample_bytes`. Files no larger than two samples are hashed whole.
pub async fn fast_hash(path: &Path, sample_bytes: u64) -> Result<String, HashError> {
    let io_err = |source: std::io::Error| HashError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).await.map_err(io_err)?;
    let size = file.metadata().await.map_err(io_err)?.len();
    let sample = sample_bytes.max(1);

    let mut hasher = Hasher::new();
    hasher.update(&size.to_le_bytes());

    if size <= sample * 2 {
        let buf = read_at(&mut file, 0, size).await.map_err(io_err)?;
        hasher.update(&buf);
    } else {
        let head = read_at(&mut file, 0, sample).await.map_err(io_err)?;
        hasher.update(&head);
        let tail = read_at(&mut file, size - sample, sample).await.map_err(io_err)?;
        hasher.update(&tail);
    }

    let mut id = hasher.finalize().to_hex();
    id.truncate(FAST_HASH_LEN);
    Ok(id.to_string())
}

/// 64-bit difference hash of an image, as 16 hex chars.
///
/// The frame is reduced to a 9x8 grayscale grid; each bit records whether a
/// pixel is darker than its right neighbour.
pub fn perceptual_hash(image: &DynamicImage) -> String {
    let small = image::imageops::resize(&image.to_luma8(), 9, 8, FilterType::Triangle);

    let mut bits: u64 = 0;
    for y in 0..8 {
        for x in 0..8 {
            let left = small.get_pixel(x, y)[0];
            let right = small.get_pixel(x + 1, y)[0];
            bits <<= 1;
            if left < right {
                bits |= 1;
            }
        }
    }
    format!("{:016x}", bits)
}
