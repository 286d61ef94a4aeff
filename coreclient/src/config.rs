// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Static controller configuration.

use std::{path::PathBuf, time::Duration};

use crate::files::engine::InlineFilesConfig;

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Chunk size of SMP inline file transfers.
    pub file_chunk_size: i64,
    pub inline_files: InlineFilesConfig,
    /// Maximum bytes of one `x.msg.file.descr` part.
    pub xftp_descr_part_size: usize,
    /// SMP AUTH errors tolerated before a connection is disabled.
    pub auth_err_disable_count: i64,
    /// Capacity of the view-event channel.
    pub tbq_size: usize,
    /// Cleanup-manager scan period; due items within one period are handed
    /// to per-item delete tasks.
    pub cleanup_interval: Duration,
    /// Batch size of the per-user expiration worker.
    pub expire_batch_size: i64,
    /// Pause between expiration batches.
    pub expire_yield: Duration,
    /// Destination of received files; `None` keeps agent staging paths.
    pub files_folder: Option<PathBuf>,
    /// Assembly area for in-flight transfers.
    pub temp_dir: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            file_chunk_size: 15_780,
            inline_files: InlineFilesConfig::default(),
            xftp_descr_part_size: 14_000,
            auth_err_disable_count: 5,
            tbq_size: 1024,
            cleanup_interval: Duration::from_secs(30 * 60),
            expire_batch_size: 100,
            expire_yield: Duration::from_millis(100),
            files_folder: None,
            temp_dir: None,
        }
    }
}
