// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use toml::{Table, Value};

use crate::app::errors::{AppResult, local_error, state_corruption};
use crate::app::ports::JobStorePort;
use crate::app::types::JobRecord;

pub const JOB_RECORD_FILE: &str = ".job.toml";

const JOB_SECTION: &str = "JOB";
const ID_KEY: &str = "id";
const REMOTE_DIRECTORY_KEY: &str = "remote_directory";
const REMOTE_DESCRIPTOR_KEY: &str = "remote_descriptor";
const DOWNLOAD_DONE_KEY: &str = "download_done";

/// Job records as a TOML document inside each job directory.
///
/// Only the `[JOB]` keys below are interpreted; other keys and tables are
/// carried through rewrites untouched.
#[derive(Clone, Debug)]
pub struct TomlJobStore {
    file_name: String,
}

impl Default for TomlJobStore {
    fn default() -> Self {
        Self {
            file_name: JOB_RECORD_FILE.to_string(),
        }
    }
}

impl TomlJobStore {
    pub fn path_for(&self, job_dir: &Path) -> PathBuf {
        job_dir.join(&self.file_name)
    }

    fn read_document(&self, path: &Path) -> AppResult<Option<Table>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(local_error(format!(
                    "failed to read job record {}: {err}",
                    path.display()
                )));
            }
        };
        content.parse::<Table>().map(Some).map_err(|err| {
            state_corruption(format!(
                "job record {} is not valid TOML: {err}",
                path.display()
            ))
        })
    }
}

impl JobStorePort for TomlJobStore {
    #[tracing::instrument(name = "job_record", level = "debug", skip(self, job_dir), fields(op = "load", dir = %job_dir.display()))]
    fn load(&self, job_dir: &Path) -> AppResult<JobRecord> {
        let path = self.path_for(job_dir);
        let Some(document) = self.read_document(&path)? else {
            return Ok(JobRecord::default());
        };
        let Some(section) = document.get(JOB_SECTION) else {
            return Ok(JobRecord::default());
        };
        let section = section.as_table().ok_or_else(|| {
            state_corruption(format!("[{JOB_SECTION}] in {} is not a table", path.display()))
        })?;
        decode(section).map_err(|msg| state_corruption(format!("{}: {msg}", path.display())))
    }

    #[tracing::instrument(name = "job_record", level = "debug", skip(self, job_dir, record), fields(op = "save", dir = %job_dir.display()))]
    fn save(&self, job_dir: &Path, record: &JobRecord) -> AppResult<()> {
        let path = self.path_for(job_dir);
        let mut document = self.read_document(&path)?.unwrap_or_default();
        let section = document
            .entry(JOB_SECTION.to_string())
            .or_insert(Value::Table(Table::new()));
        let Value::Table(section) = section else {
            return Err(state_corruption(format!(
                "[{JOB_SECTION}] in {} is not a table",
                path.display()
            )));
        };
        encode(record, section);

        let rendered = toml::to_string(&document)
            .map_err(|err| local_error(format!("failed to render job record: {err}")))?;
        let write_err =
            |err: std::io::Error| local_error(format!("failed to write {}: {err}", path.display()));
        let mut tmp = NamedTempFile::new_in(job_dir).map_err(write_err)?;
        tmp.write_all(rendered.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&path).map_err(|err| write_err(err.error))?;
        Ok(())
    }
}

fn decode(section: &Table) -> Result<JobRecord, String> {
    let text = |key: &str| -> Result<Option<String>, String> {
        match section.get(key) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(other) => Err(format!("`{key}` must be a string, found {}", other.type_str())),
        }
    };
    let download_done = match section.get(DOWNLOAD_DONE_KEY) {
        None => false,
        Some(Value::Boolean(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        Some(other) => {
            return Err(format!(
                "`{DOWNLOAD_DONE_KEY}` must be a boolean, found {other}"
            ));
        }
    };
    Ok(JobRecord {
        remote_job_id: text(ID_KEY)?,
        remote_directory: text(REMOTE_DIRECTORY_KEY)?,
        remote_descriptor: text(REMOTE_DESCRIPTOR_KEY)?,
        download_done,
    })
}

fn encode(record: &JobRecord, section: &mut Table) {
    let mut set = |key: &str, value: &Option<String>| match value {
        Some(v) => {
            section.insert(key.to_string(), Value::String(v.clone()));
        }
        None => {
            section.remove(key);
        }
    };
    set(ID_KEY, &record.remote_job_id);
    set(REMOTE_DIRECTORY_KEY, &record.remote_directory);
    set(REMOTE_DESCRIPTOR_KEY, &record.remote_descriptor);
    section.insert(
        DOWNLOAD_DONE_KEY.to_string(),
        Value::Boolean(record.download_done),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::errors::AppErrorKind;

    fn submitted() -> JobRecord {
        JobRecord {
            remote_job_id: Some("123.0".to_string()),
            remote_directory: Some("/remote/job".to_string()),
            remote_descriptor: Some("/remote/job/rjm_job.sl".to_string()),
            download_done: false,
        }
    }

    #[test]
    fn missing_record_loads_as_new_job() {
        let dir = tempfile::tempdir().unwrap();
        let record = TomlJobStore::default().load(dir.path()).unwrap();
        assert_eq!(record, JobRecord::default());
    }

    #[test]
    fn unknown_keys_and_tables_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlJobStore::default();
        std::fs::write(
            store.path_for(dir.path()),
            "[JOB]\nid = \"123.0\"\nremote_directory = \"/remote/job\"\n\
             remote_descriptor = \"/remote/job/rjm_job.sl\"\nowner = \"postproc\"\n\n\
             [postproc]\nstage = 2\n",
        )
        .unwrap();

        let mut record = store.load(dir.path()).unwrap();
        assert_eq!(record, submitted());
        record.download_done = true;
        store.save(dir.path(), &record).unwrap();

        let raw: Table = std::fs::read_to_string(store.path_for(dir.path()))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(raw["JOB"]["owner"].as_str(), Some("postproc"));
        assert_eq!(raw["JOB"]["download_done"].as_bool(), Some(true));
        assert_eq!(raw["postproc"]["stage"].as_integer(), Some(2));
    }

    #[test]
    fn cleared_fields_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlJobStore::default();
        store.save(dir.path(), &submitted()).unwrap();
        store
            .save(
                dir.path(),
                &JobRecord {
                    remote_job_id: None,
                    ..submitted()
                },
            )
            .unwrap();
        let content = std::fs::read_to_string(store.path_for(dir.path())).unwrap();
        assert!(!content.contains("123.0"));
    }

    #[test]
    fn unparseable_record_is_state_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlJobStore::default();
        std::fs::write(store.path_for(dir.path()), "[JOB\nid = ").unwrap();
        let err = store.load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::StateCorruption);

        // a corrupt record is never silently replaced
        assert!(store.save(dir.path(), &submitted()).is_err());
        let content = std::fs::read_to_string(store.path_for(dir.path())).unwrap();
        assert_eq!(content, "[JOB\nid = ");
    }

    #[test]
    fn wrongly_typed_fields_are_state_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlJobStore::default();
        std::fs::write(store.path_for(dir.path()), "[JOB]\nid = 42\n").unwrap();
        assert_eq!(
            store.load(dir.path()).unwrap_err().kind(),
            AppErrorKind::StateCorruption
        );
        std::fs::write(store.path_for(dir.path()), "[JOB]\ndownload_done = \"maybe\"\n").unwrap();
        assert!(store.load(dir.path()).is_err());
    }

    #[test]
    fn string_download_flag_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlJobStore::default();
        std::fs::write(
            store.path_for(dir.path()),
            "[JOB]\nid = \"1.0\"\nremote_directory = \"/r\"\ndownload_done = \"True\"\n",
        )
        .unwrap();
        assert!(store.load(dir.path()).unwrap().download_done);
    }

    #[test]
    fn save_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlJobStore::default();
        store.save(dir.path(), &submitted()).unwrap();
        store.save(dir.path(), &submitted()).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(JOB_RECORD_FILE)]);
    }
}
