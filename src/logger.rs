use chrono::Local;
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};

/// Environment variable naming the file log lines are appended to.
/// When unset, lines go to stderr.
pub const LOG_FILE_ENV: &str = "EXTSORT_LOG_FILE";

// Each thread keeps its own handle so a sort never contends on the log.
thread_local! {
    static LOG_FILE: RefCell<Option<File>> = RefCell::new(
        std::env::var(LOG_FILE_ENV).ok().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        })
    );
}

#[inline]
pub fn log(level: &str, file: &str, line: u32, message: &str) {
    let now = Local::now();
    let formatted_time = now.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    let log_message = format!(
        "{} [{}] [{:?}] {}:{} - {}\n",
        formatted_time,
        level,
        std::thread::current().id(),
        file,
        line,
        message
    );

    LOG_FILE.with(|log_file| match &mut *log_file.borrow_mut() {
        Some(writer) => {
            let _ = writer.write_all(log_message.as_bytes());
            let _ = writer.flush();
        }
        None => {
            let _ = io::stderr().write_all(log_message.as_bytes());
        }
    });
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        #[cfg(any(feature = "log_error", feature = "log_warn", feature = "log_info", feature = "log_debug", feature = "log_trace"))]
        $crate::logger::log("ERROR", file!(), line!(), &format!($($arg)*))
    }
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        #[cfg(any(feature = "log_warn", feature = "log_info", feature = "log_debug", feature = "log_trace"))]
        $crate::logger::log("WARN ", file!(), line!(), &format!($($arg)*))
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        #[cfg(any(feature = "log_info", feature = "log_debug", feature = "log_trace"))]
        $crate::logger::log("INFO ", file!(), line!(), &format!($($arg)*))
    }
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        #[cfg(any(feature = "log_debug", feature = "log_trace"))]
        $crate::logger::log("DEBUG", file!(), line!(), &format!($($arg)*))
    }
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "log_trace")]
        $crate::logger::log("TRACE", file!(), line!(), &format!($($arg)*))
    }
}
