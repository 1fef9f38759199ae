//! Logging backend which writes to a file from a background thread.

use chrono::Local;
use log::{Level, Metadata, Record};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::mpsc,
};

struct Message {
    module: String,
    level: Level,
    string: String,
    time: String,
}

impl Message {
    fn from_record(record: &Record) -> Message {
        Message {
            module: record
                .module_path()
                .and_then(|path| path.split("::").last())
                .unwrap_or("unknown")
                .to_string(),
            level: record.level(),
            string: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }

    /// Formats the message as `[date time] [module] [level] text`.
    fn line(&self) -> String {
        let level_name = match self.level {
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };

        format!(
            "[{}] [{}] [{}] {}\n",
            self.time, self.module, level_name, self.string
        )
    }

    fn write_to_file(&self, file: &mut File) {
        let _ = file.write_all(self.line().as_bytes());
    }
}

pub struct Logger;

impl log::Log for Logger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(sender) = MSG_SENDER.get() {
            // The writer thread never exits, so this only fails during process teardown.
            let _ = sender.lock().send(Message::from_record(record));
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static MSG_SENDER: OnceCell<Mutex<mpsc::Sender<Message>>> = OnceCell::new();
static PANIC_PATH: OnceCell<PathBuf> = OnceCell::new();

fn panic_hook(info: &std::panic::PanicHookInfo) {
    let message = info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "no message".to_string());

    let location = info
        .location()
        .map(|location| format!("{}:{}", location.file(), location.line()))
        .unwrap_or_else(|| "unknown".to_string());

    let time = Local::now();
    let backtrace = backtrace::Backtrace::new();

    let info_dump = format!(
        "Texture replacement panicked.

Message: {message}
Location: {location}
Time: {time}
Backtrace: see below

{backtrace:?}"
    );

    log::error!("{info_dump}");

    if let Some(path) = PANIC_PATH.get() {
        let _ = std::fs::write(path, info_dump);
    }
}

/// Sets up logging to `path`. Later calls do nothing.
pub fn init(path: &Path) -> eyre::Result<()> {
    if MSG_SENDER.get().is_some() {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = File::create(path)?;

    let (sender, receiver) = mpsc::channel::<Message>();

    if MSG_SENDER.set(Mutex::new(sender)).is_err() {
        // Someone else got there first.
        return Ok(());
    }

    let _ = PANIC_PATH.set(path.with_file_name("PANIC.txt"));
    std::panic::set_hook(Box::new(panic_hook));

    let level = if cfg!(feature = "debug") {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Debug
    };

    // Another logger may already be installed if we're hosted inside a test harness.
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }

    // Writing happens on a background thread so the render thread never waits for the disk.
    std::thread::Builder::new()
        .name("texswap-log".to_string())
        .spawn(move || {
            for message in receiver {
                message.write_to_file(&mut file);
            }
        })?;

    Ok(())
}
