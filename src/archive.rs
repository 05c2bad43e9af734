use std::fs;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use flate2::read::MultiGzDecoder;

use crate::error::IngestError;

/// Archive and compression collaborators consumed by the extract and
/// process stages.
pub trait ArchiveCodec: Send + Sync {
    fn extract_all(&self, archive_path: &Path, target_dir: &Path) -> Result<(), IngestError>;
    fn decompress(&self, gz_path: &Path, dest_path: &Path) -> Result<(), IngestError>;
}

impl<T: ArchiveCodec + ?Sized> ArchiveCodec for Arc<T> {
    fn extract_all(&self, archive_path: &Path, target_dir: &Path) -> Result<(), IngestError> {
        (**self).extract_all(archive_path, target_dir)
    }

    fn decompress(&self, gz_path: &Path, dest_path: &Path) -> Result<(), IngestError> {
        (**self).decompress(gz_path, dest_path)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TarGzCodec;

impl ArchiveCodec for TarGzCodec {
    fn extract_all(&self, archive_path: &Path, target_dir: &Path) -> Result<(), IngestError> {
        extract_tar(archive_path, target_dir)
    }

    fn decompress(&self, gz_path: &Path, dest_path: &Path) -> Result<(), IngestError> {
        decompress_gz(gz_path, dest_path)
    }
}

pub fn extract_tar(archive_path: &Path, target_dir: &Path) -> Result<(), IngestError> {
    let file = fs::File::open(archive_path).map_err(|err| {
        IngestError::Archive(format!("open tar {}: {err}", archive_path.display()))
    })?;
    fs::create_dir_all(target_dir)
        .map_err(|err| IngestError::fs(format!("create {}", target_dir.display()), err))?;
    let mut archive = tar::Archive::new(BufReader::new(file));

    let entries = archive
        .entries()
        .map_err(|err| IngestError::Archive(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| IngestError::Archive(err.to_string()))?;
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| IngestError::Archive(err.to_string()))?;
        if !unpacked {
            let name = entry
                .path()
                .map(|path| path.display().to_string())
                .unwrap_or_default();
            return Err(IngestError::Archive(format!(
                "tar entry path traversal detected: {name}"
            )));
        }
    }
    Ok(())
}

pub fn decompress_gz(gz_path: &Path, dest_path: &Path) -> Result<(), IngestError> {
    let input = fs::File::open(gz_path)
        .map_err(|err| IngestError::fs(format!("open {}", gz_path.display()), err))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let mut output = fs::File::create(dest_path)
        .map_err(|err| IngestError::fs(format!("create {}", dest_path.display()), err))?;
    io::copy(&mut decoder, &mut output)
        .map_err(|err| IngestError::fs(format!("decompress {}", gz_path.display()), err))?;
    Ok(())
}
