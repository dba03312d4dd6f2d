//! 下载完成后的 zip 完整性校验。
//!
//! 不只看文件非空：检查本地文件头签名、可读的中央目录（EOCD），以及每个条目的本地头。

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use zip::ZipArchive;

use super::error::TransferError;

const LOCAL_HEADER_SIG: [u8; 4] = *b"PK\x03\x04";
// 本地头 30 字节 + EOCD 22 字节
const MIN_ARCHIVE_LEN: u64 = 52;

pub trait IntegrityVerifier: Send + Sync {
    fn verify(&self, path: &Path) -> Result<(), TransferError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ZipVerifier;

impl IntegrityVerifier for ZipVerifier {
    fn verify(&self, path: &Path) -> Result<(), TransferError> {
        let file = File::open(path).map_err(|e| TransferError::fs(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| TransferError::fs(path, e))?
            .len();
        if len < MIN_ARCHIVE_LEN {
            return Err(TransferError::Integrity(format!(
                "{} is too small to be an archive ({len} bytes)",
                path.display()
            )));
        }

        let mut reader = BufReader::new(file);
        let mut sig = [0u8; 4];
        reader
            .read_exact(&mut sig)
            .map_err(|e| TransferError::fs(path, e))?;
        if sig != LOCAL_HEADER_SIG {
            return Err(TransferError::Integrity(format!(
                "{} does not start with a zip local file header",
                path.display()
            )));
        }

        let mut archive = ZipArchive::new(reader.into_inner()).map_err(|e| {
            TransferError::Integrity(format!("{}: unreadable central directory: {e}", path.display()))
        })?;
        if archive.len() == 0 {
            return Err(TransferError::Integrity(format!(
                "{} contains no entries",
                path.display()
            )));
        }
        for i in 0..archive.len() {
            archive.by_index_raw(i).map_err(|e| {
                TransferError::Integrity(format!("{}: entry #{i} unreadable: {e}", path.display()))
            })?;
        }
        Ok(())
    }
}
