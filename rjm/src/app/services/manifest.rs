// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};

/// One entry per line; surrounding whitespace is trimmed and blank lines are ignored.
pub fn parse_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Relative manifest entries are taken relative to the job directory.
pub fn resolve_local(job_dir: &Path, entry: &str) -> PathBuf {
    let path = Path::new(entry);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        job_dir.join(path)
    }
}

pub fn join_remote(remote_dir: &str, entry: &str) -> String {
    if entry.starts_with('/') {
        return entry.to_string();
    }
    format!("{}/{}", remote_dir.trim_end_matches('/'), entry)
}
