// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Byte-level file work: chunk IO, handle caches, inline eligibility and
//! XFTP descriptor splitting.
//!
//! Handles open lazily on first chunk and close on completion, cancellation
//! or chat stop. Access is serialized by the chat lock; only bookkeeping
//! runs under it, bulk copying happens on unshared handles.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use couriercommon::messages::{FileDescrPart, InlineFileMode};
use thiserror::Error;
use tracing::debug;

use crate::store::FileId;

use super::FileTransferMeta;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("unexpected chunk number: expected {expected}, got {got}")]
    BadChunkNumber { expected: i64, got: i64 },
    #[error("unexpected chunk size: expected {expected} bytes, got {got}")]
    BadChunkSize { expected: i64, got: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of appending one received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendChunkResult {
    Appended { last: bool },
    /// The chunk was received before; ignored.
    Duplicate,
}

/// Decides what to do with an incoming chunk number given how many chunks
/// were appended so far.
pub fn classify_chunk(
    meta: &FileTransferMeta,
    received: i64,
    chunk_no: i64,
    chunk_len: usize,
) -> Result<AppendChunkResult, FileError> {
    if chunk_no <= received {
        debug!(file_id = meta.file_id, chunk_no, "duplicate file chunk");
        return Ok(AppendChunkResult::Duplicate);
    }
    if chunk_no != received + 1 {
        return Err(FileError::BadChunkNumber {
            expected: received + 1,
            got: chunk_no,
        });
    }
    let last = chunk_no == meta.chunk_count();
    if !last && chunk_len as i64 != meta.chunk_size {
        return Err(FileError::BadChunkSize {
            expected: meta.chunk_size,
            got: chunk_len,
        });
    }
    Ok(AppendChunkResult::Appended { last })
}

/// Per-direction cache of open OS handles, keyed by file id.
#[derive(Debug, Default)]
pub struct FileHandleCache {
    handles: Mutex<HashMap<FileId, File>>,
}

impl FileHandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the cached handle, opening it with `open` first if
    /// needed.
    pub fn with_handle<T>(
        &self,
        file_id: FileId,
        open: impl FnOnce() -> std::io::Result<File>,
        f: impl FnOnce(&mut File) -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        let mut handles = self.handles.lock().expect("file handle cache poisoned");
        let handle = match handles.entry(file_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => entry.insert(open()?),
        };
        f(handle)
    }

    pub fn close(&self, file_id: FileId) {
        self.handles
            .lock()
            .expect("file handle cache poisoned")
            .remove(&file_id);
    }

    pub fn close_all(&self) {
        self.handles
            .lock()
            .expect("file handle cache poisoned")
            .clear();
    }
}

/// Reads the chunk with the given 1-based number from a send handle.
pub fn read_chunk(
    handles: &FileHandleCache,
    meta: &FileTransferMeta,
    chunk_no: i64,
) -> Result<Vec<u8>, FileError> {
    let path = meta.file_path.clone();
    let offset = (chunk_no - 1) * meta.chunk_size;
    let len = (meta.file_size - offset).min(meta.chunk_size).max(0) as usize;
    let chunk = handles.with_handle(
        meta.file_id,
        || File::open(&path),
        |file| {
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::Start(offset as u64))?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)?;
            Ok(buf)
        },
    )?;
    Ok(chunk)
}

/// Appends a received chunk to the target file.
pub fn append_chunk(
    handles: &FileHandleCache,
    meta: &FileTransferMeta,
    chunk: &[u8],
) -> Result<(), FileError> {
    let path = meta.file_path.clone();
    handles.with_handle(
        meta.file_id,
        || OpenOptions::new().create(true).append(true).open(&path),
        |file| file.write_all(chunk),
    )?;
    Ok(())
}

/// Picks a non-colliding path for a received file, appending `_N` to the
/// basename before the extension.
pub fn unique_target_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_owned(), Some(ext.to_owned())),
        _ => (file_name.to_owned(), None),
    };
    let mut n = 1;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Inline-transfer thresholds.
#[derive(Debug, Clone, Copy)]
pub struct InlineFilesConfig {
    /// Maximum chunk count to offer a file inline.
    pub offer_chunks: i64,
    /// Maximum chunk count to send pre-accepted.
    pub send_chunks: i64,
    /// Maximum chunks × recipients to send pre-accepted.
    pub total_send_chunks: i64,
    /// Maximum chunk count to receive an inline offer.
    pub receive_chunks: i64,
    /// Receive inline offers without explicit acceptance.
    pub receive_instant: bool,
}

impl Default for InlineFilesConfig {
    fn default() -> Self {
        Self {
            offer_chunks: 15,
            send_chunks: 6,
            total_send_chunks: 30,
            receive_chunks: 8,
            receive_instant: true,
        }
    }
}

impl InlineFilesConfig {
    /// Mode for an outgoing file, if it is inline-eligible at all.
    pub fn snd_mode(
        &self,
        chunks: i64,
        recipients: i64,
        is_voice: bool,
    ) -> Option<InlineFileMode> {
        if is_voice
            && chunks <= self.send_chunks
            && chunks * recipients <= self.total_send_chunks
        {
            Some(InlineFileMode::Sent)
        } else if chunks <= self.offer_chunks {
            Some(InlineFileMode::Offer)
        } else {
            None
        }
    }

    /// Whether an inline-offered file is accepted without user action.
    ///
    /// Requires instant receive *and* voice content, independent of size.
    pub fn auto_accept_rcv(
        &self,
        file_size: i64,
        chunk_size: i64,
        inline: Option<InlineFileMode>,
        is_voice: bool,
    ) -> bool {
        matches!(inline, Some(InlineFileMode::Offer) | Some(InlineFileMode::Sent))
            && self.receive_instant
            && is_voice
            && file_size <= chunk_size * self.receive_chunks
    }
}

/// Splits an XFTP descriptor into transmission parts of at most
/// `part_size` bytes; the final part carries the complete flag.
pub fn split_descr(text: &str, part_size: usize) -> Vec<FileDescrPart> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return vec![FileDescrPart {
            part_no: 0,
            text: String::new(),
            complete: true,
        }];
    }
    let mut parts = Vec::with_capacity(bytes.len().div_ceil(part_size));
    let mut start = 0;
    let mut part_no = 0;
    while start < bytes.len() {
        let mut end = (start + part_size).min(bytes.len());
        // keep parts on char boundaries
        while end < bytes.len() && !text.is_char_boundary(end) {
            end -= 1;
        }
        parts.push(FileDescrPart {
            part_no,
            text: text[start..end].to_owned(),
            complete: end == bytes.len(),
        });
        start = end;
        part_no += 1;
    }
    parts
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::files::FileProtocol;

    use super::*;

    fn meta(dir: &Path, size: i64, chunk_size: i64) -> FileTransferMeta {
        FileTransferMeta {
            file_id: 1,
            user_id: 1,
            contact_id: None,
            group_id: None,
            file_name: "data.bin".into(),
            file_path: dir.join("data.bin").display().to_string(),
            file_size: size,
            chunk_size,
            protocol: FileProtocol::Smp,
            file_inline: None,
            agent_snd_file_id: None,
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn chunk_round_trip() {
        for chunk_size in [15_780_i64, 16_384, 32_768] {
            let dir = tempfile::tempdir().unwrap();
            let bytes: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
            let src = meta(dir.path(), bytes.len() as i64, chunk_size);
            std::fs::write(&src.file_path, &bytes).unwrap();

            let snd_handles = FileHandleCache::new();
            let rcv_handles = FileHandleCache::new();
            let mut dst = meta(dir.path(), bytes.len() as i64, chunk_size);
            dst.file_id = 2;
            dst.file_path = dir.path().join("out.bin").display().to_string();

            for chunk_no in 1..=src.chunk_count() {
                let chunk = read_chunk(&snd_handles, &src, chunk_no).unwrap();
                append_chunk(&rcv_handles, &dst, &chunk).unwrap();
            }
            rcv_handles.close_all();

            assert_eq!(std::fs::read(&dst.file_path).unwrap(), bytes);
        }
    }

    #[test]
    fn chunk_classification() {
        let dir = tempfile::tempdir().unwrap();
        let meta = meta(dir.path(), 40_000, 15_780);

        assert_eq!(
            classify_chunk(&meta, 0, 1, 15_780).unwrap(),
            AppendChunkResult::Appended { last: false }
        );
        // duplicate is ignored
        assert_eq!(
            classify_chunk(&meta, 1, 1, 15_780).unwrap(),
            AppendChunkResult::Duplicate
        );
        // gap is an error
        assert!(matches!(
            classify_chunk(&meta, 1, 3, 15_780),
            Err(FileError::BadChunkNumber { expected: 2, got: 3 })
        ));
        // non-final chunk of wrong size is rejected
        assert!(matches!(
            classify_chunk(&meta, 1, 2, 100),
            Err(FileError::BadChunkSize { .. })
        ));
        // final short chunk is fine: 40000 - 2 * 15780 = 8440
        assert_eq!(
            classify_chunk(&meta, 2, 3, 8_440).unwrap(),
            AppendChunkResult::Appended { last: true }
        );
    }

    #[test]
    fn collision_naming() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            unique_target_path(dir.path(), "voice.m4a"),
            dir.path().join("voice.m4a")
        );
        std::fs::write(dir.path().join("voice.m4a"), b"x").unwrap();
        assert_eq!(
            unique_target_path(dir.path(), "voice.m4a"),
            dir.path().join("voice_1.m4a")
        );
        std::fs::write(dir.path().join("voice_1.m4a"), b"x").unwrap();
        assert_eq!(
            unique_target_path(dir.path(), "voice.m4a"),
            dir.path().join("voice_2.m4a")
        );

        std::fs::write(dir.path().join("noext"), b"x").unwrap();
        assert_eq!(
            unique_target_path(dir.path(), "noext"),
            dir.path().join("noext_1")
        );
    }

    #[test]
    fn descriptor_split_carries_complete_flag() {
        let text = "d".repeat(20_000);
        let parts = split_descr(&text, 14_000);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_no, 0);
        assert_eq!(parts[0].text.len(), 14_000);
        assert!(!parts[0].complete);
        assert_eq!(parts[1].part_no, 1);
        assert_eq!(parts[1].text.len(), 6_000);
        assert!(parts[1].complete);

        let joined: String = parts.into_iter().map(|p| p.text).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn inline_eligibility() {
        let config = InlineFilesConfig::default();
        // small voice message to one recipient: sent pre-accepted
        assert_eq!(config.snd_mode(3, 1, true), Some(InlineFileMode::Sent));
        // too many total chunks across recipients: offered instead
        assert_eq!(config.snd_mode(6, 10, true), Some(InlineFileMode::Offer));
        // non-voice is only ever offered
        assert_eq!(config.snd_mode(3, 1, false), Some(InlineFileMode::Offer));
        // too large for inline at all
        assert_eq!(config.snd_mode(100, 1, true), None);

        // auto-accept needs voice even when the size fits
        assert!(config.auto_accept_rcv(40_000, 15_780, Some(InlineFileMode::Sent), true));
        assert!(!config.auto_accept_rcv(40_000, 15_780, Some(InlineFileMode::Sent), false));
        assert!(!config.auto_accept_rcv(40_000, 15_780, None, true));
    }
}
