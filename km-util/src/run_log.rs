// Copyright (c) The kernelmark Authors.
use anyhow::Result;
use chrono::prelude::*;
use log::{debug, error};
use std::fs::{self, File};
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Append-only, timestamped log of everything a run did. Write failures
/// disable the log instead of failing the run. Clones share the same file
/// so that test runner threads can log too.
#[derive(Clone)]
pub struct RunLog {
    path: Arc<PathBuf>,
    file: Arc<Mutex<Option<File>>>,
}

impl RunLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = PathBuf::from(path.as_ref());
        match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => fs::create_dir_all(p)?,
            _ => (),
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        debug!("run-log: path={:?} size={}", &path, file.metadata()?.len());

        Ok(Self {
            path: Arc::new(path),
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// A log which drops everything, for dry runs and tests.
    pub fn disabled() -> Self {
        Self {
            path: Arc::new(PathBuf::new()),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn log(&self, msg: &str) {
        let mut file = self.file.lock().unwrap();
        let f = match file.as_mut() {
            Some(v) => v,
            None => return,
        };

        let now_str = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{}] {}\n", now_str, msg);
        if let Err(err) = f.write_all(line.as_ref()) {
            error!(
                "run-log: failed to write to {:?} ({}), disabling",
                &self.path, err
            );
            *file = None;
        }
    }
}
