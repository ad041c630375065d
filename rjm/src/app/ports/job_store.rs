// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use crate::app::errors::AppResult;
use crate::app::types::JobRecord;

/// Per-job-directory durable record.
pub trait JobStorePort: Send + Sync {
    /// A directory without a record yields an empty record.
    fn load(&self, job_dir: &Path) -> AppResult<JobRecord>;

    /// All-or-nothing: a failed save leaves the previous record intact.
    fn save(&self, job_dir: &Path, record: &JobRecord) -> AppResult<()>;
}
