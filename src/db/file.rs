use anyhow::{anyhow, ensure, Result};
use crc::{Crc, CRC_32_BZIP2};
use std::path::Path;

use super::{crypto::Cipher, database::DatabaseV1, Database};

fn crc() -> Crc<u32> {
    Crc::<u32>::new(&CRC_32_BZIP2)
}

/// Returns Ok(None) if the state file doesn't exist yet.
pub async fn load(path: &Path, cipher: &impl Cipher) -> Result<Option<DatabaseV1>> {
    log::info!("Loading state file...");
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }

    let ciphertext = tokio::fs::read(path).await?;
    let compressed = cipher.decrypt(&ciphertext)?;
    let plaintext = zstd::bulk::decompress(&compressed, compressed.len().max(1024 * 1024 * 1024))?;
    let crc = crc();
    let (parsed, remaining): (Database, &[u8]) =
        postcard::take_from_bytes_crc32(&plaintext, crc.digest())?;
    let Database::V1(database) = parsed;
    ensure!(0 == remaining.len(), "State file had extra bytes");

    log::info!("Loading state file...done");
    Ok(Some(database))
}

pub async fn save(db: DatabaseV1, path: &Path, cipher: &impl Cipher) -> Result<()> {
    log::info!("Saving state file...");

    let crc = crc();
    let plaintext = postcard::to_stdvec_crc32(&Database::V1(db), crc.digest())?;
    let compressed = zstd::bulk::compress(
        &plaintext,
        zstd::compression_level_range().last().unwrap(),
    )?;
    let ciphertext = cipher.encrypt(&compressed)?;

    // Write to a temporary file first so a failure halfway doesn't lose
    // the previous state.
    let filename = path
        .file_name()
        .ok_or_else(|| anyhow!("Path has no filename"))?
        .to_str()
        .ok_or_else(|| anyhow!("Filename isn't valid utf-8"))?;
    let tmppath = path.with_file_name(format!("{filename}.temp"));
    tokio::fs::write(&tmppath, ciphertext).await?;
    tokio::fs::rename(&tmppath, path).await?;

    log::info!("Saving state file...done");
    Ok(())
}
