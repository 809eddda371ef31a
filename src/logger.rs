//! File sink for the `log` facade.
//!
//! Lines go to `<dir>/YYYY_MM_DD<suffix>`. A new file is started when the
//! (UTC) day changes or every `max_lines` lines, the latter named
//! `YYYY_MM_DD-N<suffix>`. In async mode records are formatted on the calling
//! thread and handed to a dedicated writer thread through a bounded queue.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};

use crate::error::LoggerError;

const DEFAULT_MAX_LINES: u64 = 50_000;

/// Calendar date in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Date {
    year: i64,
    month: u32,
    day: u32,
}

impl Date {
    /// Converts days since 1970-01-01 into a civil date.
    fn from_days(days: i64) -> Self {
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
        let year = yoe + era * 400 + i64::from(month <= 2);
        Self { year, month, day }
    }
}

/// A UTC wall-clock reading split for formatting.
struct Timestamp {
    date: Date,
    secs_of_day: u64,
    micros: u32,
}

impl Timestamp {
    fn at(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = since_epoch.as_secs();
        Self {
            date: Date::from_days((secs / 86_400) as i64),
            secs_of_day: secs % 86_400,
            micros: since_epoch.subsec_micros(),
        }
    }

    fn now() -> Self {
        Self::at(SystemTime::now())
    }
}

/// The currently open log file and its rotation counters.
struct LogFile {
    dir: PathBuf,
    suffix: String,
    max_lines: u64,
    today: Date,
    line_count: u64,
    out: BufWriter<File>,
}

impl LogFile {
    fn open(dir: &Path, suffix: &str, max_lines: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let today = Timestamp::now().date;
        let out = open_append(&dir.join(file_name(today, None, suffix)))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            suffix: suffix.to_owned(),
            max_lines,
            today,
            line_count: 0,
            out,
        })
    }

    fn write_line(&mut self, date: Date, line: &str) -> io::Result<()> {
        if date != self.today || (self.line_count > 0 && self.line_count % self.max_lines == 0) {
            self.rotate(date)?;
        }
        self.line_count += 1;
        self.out.write_all(line.as_bytes())
    }

    fn rotate(&mut self, date: Date) -> io::Result<()> {
        let name = if date != self.today {
            self.today = date;
            self.line_count = 0;
            file_name(date, None, &self.suffix)
        } else {
            file_name(date, Some(self.line_count / self.max_lines), &self.suffix)
        };
        self.out.flush()?;
        self.out = open_append(&self.dir.join(name))?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

fn file_name(date: Date, part: Option<u64>, suffix: &str) -> String {
    let base = format!("{:04}_{:02}_{:02}", date.year, date.month, date.day);
    match part {
        Some(n) => format!("{}-{}{}", base, n, suffix),
        None => format!("{}{}", base, suffix),
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

enum Message {
    Line(Date, String),
    Flush,
}

/// Leveled file logger, synchronous or backed by a writer thread.
pub struct FileLogger {
    level: LevelFilter,
    file: Arc<Mutex<LogFile>>,
    queue: Option<SyncSender<Message>>,
    writer: Option<JoinHandle<()>>,
}

impl FileLogger {
    /// Opens today's log file in `dir`. A `queue_size` of 0 writes inline;
    /// anything else starts the writer thread with a queue of that size.
    pub fn new(dir: impl AsRef<Path>, level: LevelFilter, queue_size: usize) -> Result<Self, LoggerError> {
        Self::with_rotation(dir, ".log", level, queue_size, DEFAULT_MAX_LINES)
    }

    fn with_rotation(
        dir: impl AsRef<Path>,
        suffix: &str,
        level: LevelFilter,
        queue_size: usize,
        max_lines: u64,
    ) -> Result<Self, LoggerError> {
        let file = Arc::new(Mutex::new(LogFile::open(dir.as_ref(), suffix, max_lines)?));

        let (queue, writer) = if queue_size > 0 {
            let (tx, rx) = mpsc::sync_channel(queue_size);
            let file = Arc::clone(&file);
            let handle = thread::Builder::new()
                .name("sparrow-log".to_owned())
                .spawn(move || drain(rx, &file))?;
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Ok(Self {
            level,
            file,
            queue,
            writer,
        })
    }

    /// Installs this logger as the global `log` sink.
    pub fn install(self) -> Result<(), LoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    fn write_inline(&self, date: Date, line: &str) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_line(date, line) {
            eprintln!("log write failed: {}", e);
        }
    }
}

/// Writer thread body: runs until every sender is gone.
fn drain(rx: Receiver<Message>, file: &Mutex<LogFile>) {
    for message in rx {
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        let result = match message {
            Message::Line(date, line) => file.write_line(date, &line),
            Message::Flush => file.flush(),
        };
        if let Err(e) = result {
            eprintln!("log write failed: {}", e);
        }
    }
}

fn level_title(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "[error]",
        log::Level::Warn => "[warn] ",
        log::Level::Info => "[info] ",
        log::Level::Debug | log::Level::Trace => "[debug]",
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let ts = Timestamp::now();
        let secs = ts.secs_of_day;
        let line = format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06} {}: {}\n",
            ts.date.year,
            ts.date.month,
            ts.date.day,
            secs / 3600,
            secs / 60 % 60,
            secs % 60,
            ts.micros,
            level_title(record.level()),
            record.args()
        );

        match &self.queue {
            // Blocks while the queue is full, which throttles producers.
            Some(queue) => {
                if let Err(mpsc::SendError(Message::Line(date, line))) =
                    queue.send(Message::Line(ts.date, line))
                {
                    self.write_inline(date, &line);
                }
            }
            None => self.write_inline(ts.date, &line),
        }
    }

    fn flush(&self) {
        match &self.queue {
            Some(queue) => {
                let _ = queue.send(Message::Flush);
            }
            None => {
                let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = file.flush();
            }
        }
    }
}

impl Drop for FileLogger {
    fn drop(&mut self) {
        self.queue.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = file.flush();
    }
}
