//! Captures the structured log messages of a test run.

use std::sync::Once;

use parking_lot::Mutex;
use pjd_log::{LogMsg, RecordSerializeWrapper, SLOG_TARGET};

static RECORDS: Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());

struct CaptureLogger;

impl log::Log for CaptureLogger {
	fn enabled(&self, m: &log::Metadata) -> bool {
		m.target() == SLOG_TARGET
	}

	fn flush(&self) {}

	fn log(&self, rec: &log::Record) {
		if !self.enabled(rec.metadata()) {
			return;
		}
		if let Ok(json) = serde_json::to_string(&RecordSerializeWrapper(rec)) {
			RECORDS.lock().push(json);
		}
	}
}

/// Install the capturing logger. Safe to call from every test.
pub fn init() {
	static INIT: Once = Once::new();
	INIT.call_once(|| {
		log::set_boxed_logger(Box::new(CaptureLogger)).expect("another logger is installed");
		log::set_max_level(log::LevelFilter::Trace);
	});
}

/// All messages of type `T` logged so far, by any test.
pub fn captured<T: LogMsg>() -> Vec<T> {
	RECORDS.lock().iter()
		.filter_map(|r| pjd_log::parse_record(r).ok())
		.filter_map(|r| r.try_as::<T>().ok())
		.collect()
}
