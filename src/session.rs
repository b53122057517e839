// SPDX-License-Identifier: Apache-2.0
//! Per-session append-only log files.
//!
//! The logger holds at most one open handle, keyed by the active session
//! id. A session-id change closes the previous file and, only if the new
//! session is active, opens a fresh one; clearing the active flag closes
//! the handle and nothing further is written until the next session starts.

use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;

use crate::state::TestSession;

struct OpenLog {
    id: u16,
    file: File,
    path: PathBuf,
}

/// Writes one line per observed thermal frame into the active session's
/// file.
pub struct SessionLogger {
    root: PathBuf,
    current: Option<OpenLog>,
}

impl SessionLogger {
    /// Logs are grouped under `root` in one directory per day.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: None,
        }
    }

    /// Reconcile the open file handle with the commanded session.
    pub fn update_session(&mut self, session: TestSession) -> io::Result<()> {
        match &self.current {
            Some(open) if session.active && open.id == session.id => Ok(()),
            _ if session.active => {
                self.close();
                self.open(session.id)
            }
            _ => {
                self.close();
                Ok(())
            }
        }
    }

    fn open(&mut self, id: u16) -> io::Result<()> {
        let now = Local::now();
        let directory = self.root.join(now.format("%Y_%m_%d").to_string());
        fs::create_dir_all(&directory)?;
        let path = directory.join(format!("{}_session_{}.log", now.format("%H_%M"), id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("session {}: logging to {}", id, path.display());
        self.current = Some(OpenLog { id, file, path });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(open) = self.current.take() {
            info!("session {}: closed {}", open.id, open.path.display());
        }
    }

    /// Append one log line for a frame, if a session is active.
    ///
    /// Format: `<timestamp> ; <session-id> ; <v1>,<v2>,...,<vN>,` with a
    /// microsecond-resolution timestamp and comma-terminated values.
    pub fn log_frame(&mut self, values: &[i16]) -> io::Result<()> {
        let open = match self.current.as_mut() {
            Some(open) => open,
            None => return Ok(()),
        };
        let mut line = String::with_capacity(values.len() * 6 + 48);
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.6f");
        // Writing to a String cannot fail.
        let _ = write!(line, "{} ; {} ; ", timestamp, open.id);
        for value in values {
            let _ = write!(line, "{},", value);
        }
        line.push('\n');
        open.file.write_all(line.as_bytes())?;
        open.file.flush()
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|open| open.path.as_path())
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::PathBuf;

    use super::*;

    struct TempRoot(PathBuf);

    impl TempRoot {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "wheeldaq-session-{}-{}",
                tag,
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&path);
            Self(path)
        }
    }

    impl Drop for TempRoot {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn log_files(root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(days) = fs::read_dir(root) else {
            return files;
        };
        for day in days.flatten() {
            if let Ok(entries) = fs::read_dir(day.path()) {
                files.extend(entries.flatten().map(|entry| entry.path()));
            }
        }
        files
    }

    #[test]
    fn one_file_three_lines_closed_on_clear() {
        let root = TempRoot::new("scenario");
        let mut logger = SessionLogger::new(&root.0);
        let active = TestSession {
            id: 5,
            active: true,
        };

        logger.update_session(TestSession::inactive()).unwrap();
        assert!(!logger.is_open());
        logger.log_frame(&[1, 2, 3]).unwrap();

        logger.update_session(active).unwrap();
        let path = logger.current_path().unwrap().to_path_buf();
        for _ in 0..3 {
            logger.update_session(active).unwrap();
            logger.log_frame(&[1, 2, 3]).unwrap();
        }
        assert_eq!(
            logger.current_path().unwrap(),
            path,
            "repeating the same session id must not rotate the file"
        );

        logger.update_session(TestSession::inactive()).unwrap();
        assert!(!logger.is_open(), "clearing the active flag closes the file");
        logger.log_frame(&[9, 9, 9]).unwrap();

        let files = log_files(&root.0);
        assert_eq!(files.len(), 1, "exactly one file is opened for session 5");
        let contents = fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3, "exactly three lines are written");
        for line in lines {
            assert!(line.ends_with(" ; 5 ; 1,2,3,"));
        }
        let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_session_5.log"));
    }

    #[test]
    fn session_id_change_rotates_the_file() {
        let root = TempRoot::new("rotate");
        let mut logger = SessionLogger::new(&root.0);
        logger
            .update_session(TestSession {
                id: 7,
                active: true,
            })
            .unwrap();
        logger.log_frame(&[1]).unwrap();
        let first = logger.current_path().unwrap().to_path_buf();

        logger
            .update_session(TestSession {
                id: 8,
                active: true,
            })
            .unwrap();
        logger.log_frame(&[2]).unwrap();
        let second = logger.current_path().unwrap().to_path_buf();

        assert_ne!(first, second);
        assert_eq!(log_files(&root.0).len(), 2);
    }

    #[test]
    fn line_format_has_semicolon_separators_and_trailing_comma() {
        let root = TempRoot::new("format");
        let mut logger = SessionLogger::new(&root.0);
        logger
            .update_session(TestSession {
                id: 12,
                active: true,
            })
            .unwrap();
        logger.log_frame(&[-15, 0, 314]).unwrap();
        let contents = fs::read_to_string(logger.current_path().unwrap()).unwrap();
        let line = contents.lines().next().unwrap();
        let mut parts = line.splitn(3, " ; ");
        let timestamp = parts.next().unwrap();
        assert!(timestamp.contains('.'), "timestamp carries sub-second digits");
        assert_eq!(timestamp.len(), "2024-01-01T00:00:00.000000".len());
        assert_eq!(parts.next().unwrap(), "12");
        assert_eq!(parts.next().unwrap(), "-15,0,314,");
    }
}
