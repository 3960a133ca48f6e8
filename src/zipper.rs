//! Per-pass artifact archiving (§4.F): bundle a pass directory's report and
//! log files into an in-memory zip, then base64-encode it for embedding in
//! the callback JSON payload. Not grounded in the teacher (no archive format
//! in its corpus) — built from the `zip`/`base64` crates directly, the same
//! registry crates `adamtc007-ob-poc`'s web server pulls in for artifact
//! handling.

use std::io::{Cursor, Write};
use std::path::Path;

use base64::Engine;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::WorkerError;

/// Zip every regular file directly inside `dir` (non-recursive — a pass
/// directory is flat: `report.html`, `report.json`, `log.txt`,
/// `parameters.cbotset`, `events.json`) and return the archive, base64-encoded.
pub fn zip_dir_to_base64(dir: &Path) -> Result<String, WorkerError> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            writer
                .start_file(name.as_ref(), options)
                .map_err(|e| WorkerError::Other(format!("zip start_file failed: {e}")))?;
            let bytes = std::fs::read(entry.path())?;
            writer
                .write_all(&bytes)
                .map_err(|e| WorkerError::Other(format!("zip write failed: {e}")))?;
        }

        writer
            .finish()
            .map_err(|e| WorkerError::Other(format!("zip finish failed: {e}")))?;
    }

    Ok(base64::engine::general_purpose::STANDARD.encode(buffer.into_inner()))
}

/// Zip several pass directories into one archive, each rooted at
/// `<pass_id>/...` (§4.F batch artifact zip). Directories that don't exist
/// or contain no regular files are skipped; returns `Ok(None)` if nothing
/// was written at all, so the caller can omit the payload key entirely
/// rather than attach an empty archive.
pub fn zip_pass_dirs_to_base64(dirs: &[(u64, std::path::PathBuf)]) -> Result<Option<String>, WorkerError> {
    let mut buffer = Cursor::new(Vec::new());
    let mut any_files = false;
    {
        let mut writer = ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for (pass_id, dir) in dirs {
            let Ok(read_dir) = std::fs::read_dir(dir) else { continue };
            let mut entries: Vec<_> = read_dir
                .filter_map(Result::ok)
                .filter(|e| e.path().is_file())
                .collect();
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let archive_path = format!("{pass_id}/{name}");
                writer
                    .start_file(&archive_path, options)
                    .map_err(|e| WorkerError::Other(format!("zip start_file failed: {e}")))?;
                let bytes = std::fs::read(entry.path())?;
                writer
                    .write_all(&bytes)
                    .map_err(|e| WorkerError::Other(format!("zip write failed: {e}")))?;
                any_files = true;
            }
        }

        writer
            .finish()
            .map_err(|e| WorkerError::Other(format!("zip finish failed: {e}")))?;
    }

    if !any_files {
        return Ok(None);
    }
    Ok(Some(base64::engine::general_purpose::STANDARD.encode(buffer.into_inner())))
}
