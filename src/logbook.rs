use crate::capabilities::{FlightLog, LogChannel};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::error;

const STAMP_FORMAT: &str = "%Y%m%d_%H:%M:%S%.6f";
// Measurement lines are a few hundred bytes; the tail window only has to
// hold the last one.
const TAIL_WINDOW_BYTES: u64 = 8192;

pub fn utc_stamp() -> String {
    Utc::now().format(STAMP_FORMAT).to_string()
}

#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<(LogChannel, String)>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogChannel, String)> {
        lock(&self.entries).clone()
    }

    pub fn channel(&self, channel: LogChannel) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter(|(entry_channel, _)| *entry_channel == channel)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl FlightLog for MemoryLog {
    fn latest_line(&self) -> io::Result<Option<String>> {
        Ok(lock(&self.entries)
            .iter()
            .rev()
            .find(|(channel, _)| *channel == LogChannel::Data)
            .map(|(_, text)| text.clone()))
    }

    fn append(&self, channel: LogChannel, text: &str) {
        lock(&self.entries).push((channel, text.to_string()));
    }
}

/// Append-only log files under one directory.
///
/// Measurement records go to `data.log` as `<utc stamp>,<line>`; every other
/// channel goes to `notifications.log` as
/// `<CHANNEL> << <utc stamp> << <system> << <text>`.
#[derive(Debug)]
pub struct FileLog {
    system_name: String,
    data_path: PathBuf,
    notifications_path: PathBuf,
    files: Mutex<LogFiles>,
}

#[derive(Debug)]
struct LogFiles {
    data: File,
    notifications: File,
    last_data: Option<String>,
}

impl FileLog {
    pub fn open(directory: impl AsRef<Path>, system_name: impl Into<String>) -> io::Result<Self> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;

        let data_path = directory.join("data.log");
        let notifications_path = directory.join("notifications.log");
        let files = LogFiles {
            data: open_append(&data_path)?,
            notifications: open_append(&notifications_path)?,
            last_data: None,
        };

        Ok(Self {
            system_name: system_name.into(),
            data_path,
            notifications_path,
            files: Mutex::new(files),
        })
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn notifications_path(&self) -> &Path {
        &self.notifications_path
    }
}

impl FlightLog for FileLog {
    fn latest_line(&self) -> io::Result<Option<String>> {
        if let Some(line) = lock(&self.files).last_data.clone() {
            return Ok(Some(line));
        }
        // Nothing written this run; fall back to what an earlier run left.
        read_last_line(&self.data_path)
    }

    fn append(&self, channel: LogChannel, text: &str) {
        let stamp = utc_stamp();
        let mut files = lock(&self.files);
        let result = if channel == LogChannel::Data {
            let record = format!("{stamp},{text}");
            let written = writeln!(files.data, "{record}");
            files.last_data = Some(record);
            written
        } else {
            writeln!(files.notifications, "{channel} << {stamp} << {} << {text}", self.system_name)
        };

        if let Err(e) = result {
            error!("Failed to append {} record: {}", channel, e);
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn read_last_line(path: &Path) -> io::Result<Option<String>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let length = file.metadata()?.len();
    file.seek(SeekFrom::Start(length.saturating_sub(TAIL_WINDOW_BYTES)))?;

    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;
    Ok(String::from_utf8_lossy(&tail)
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(str::to_string))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
