#[macro_use] extern crate serde;

#[macro_use]
mod macros;
mod msgs;
mod serde_utils;
pub use crate::msgs::*;

use std::borrow::Cow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::ser::{Serialize, SerializeMap, Serializer};


/// The "target" field used for structured logging.
pub const SLOG_TARGET: &str = "pjd-slog";

/// The file in the log dir structured logs are written to.
pub const SLOG_FILENAME: &str = "slog.log";

const LOGID_FIELD: &str = "logid";
const DATA_FIELD: &str = "data";

/// Trait implemented by all our structured log messages.
pub trait LogMsg: Sized + Send + fmt::Debug + Serialize + DeserializeOwned + 'static {
	const LOGID: &'static str;
	const LEVEL: log::Level;
	const MSG: &'static str;
}

/// Exposes a [LogMsg] as a [log::kv::Source] with two keys:
/// the log id and the serialized message.
pub struct MsgSource<'a, T: LogMsg>(pub &'a T);

impl<'a, T: LogMsg> log::kv::Source for MsgSource<'a, T> {
	fn visit<'kvs>(
		&'kvs self,
		visitor: &mut dyn log::kv::VisitSource<'kvs>,
	) -> Result<(), log::kv::Error> {
		visitor.visit_pair(LOGID_FIELD.into(), log::kv::Value::from(T::LOGID))?;
		visitor.visit_pair(DATA_FIELD.into(), log::kv::Value::from_serde(self.0))?;
		Ok(())
	}
}

pub fn log<T: LogMsg>(obj: &T, module: &str, file: &str, line: u32) {
	let kv = MsgSource(obj);
	log::logger().log(&log::Record::builder()
		.args(format_args!("{}", T::MSG))
		.level(T::LEVEL)
		.target(SLOG_TARGET)
		.module_path(Some(module))
		.file(Some(file))
		.line(Some(line))
		.key_values(&kv)
		.build()
	);
}


/// A wrapper around a [log::kv::Source] that implements [serde::Serialize].
pub struct SourceSerializeWrapper<'a>(pub &'a dyn log::kv::Source);

impl<'a> Serialize for SourceSerializeWrapper<'a> {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		use serde::ser::Error;

		struct Visitor<'a, S: Serializer>(&'a mut <S as Serializer>::SerializeMap);
		impl<'a, 'kvs, S: Serializer> log::kv::VisitSource<'kvs> for Visitor<'a, S> {
			fn visit_pair(
				&mut self, key: log::kv::Key<'kvs>, value: log::kv::Value<'kvs>,
			) -> Result<(), log::kv::Error> {
				self.0.serialize_entry(key.as_str(), &value).map_err(|e| {
					log::kv::Error::boxed(format!("serialize error: {:?}", e))
				})?;
				Ok(())
			}
		}

		let mut m = s.serialize_map(None)?;
		let mut v = Visitor::<S>(&mut m);
		self.0.visit(&mut v).map_err(S::Error::custom)?;
		m.end()
	}
}

/// A wrapper around a [log::Record] that implements [serde::Serialize].
///
/// Structured records get their log id under `id` and their message under
/// `data`, any other key-value pairs end up in `kv`.
pub struct RecordSerializeWrapper<'a>(pub &'a log::Record<'a>);

impl<'a> Serialize for RecordSerializeWrapper<'a> {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		let mut m = s.serialize_map(None)?;
		m.serialize_entry("msg", self.0.args())?;
		m.serialize_entry("level", &self.0.level())?;
		m.serialize_entry("target", self.0.target())?;
		if let Some(module) = self.0.module_path() {
			m.serialize_entry("module", module)?;
		}
		if let Some(file) = self.0.file() {
			m.serialize_entry("file", file)?;
		}
		if let Some(line) = self.0.line() {
			m.serialize_entry("line", &line)?;
		}
		let kv = self.0.key_values();
		if let Some(id) = kv.get(LOGID_FIELD.into()) {
			m.serialize_entry("id", &id)?;
			if let Some(data) = kv.get(DATA_FIELD.into()) {
				m.serialize_entry("data", &data)?;
			}
		} else if kv.count() > 0 {
			m.serialize_entry("kv", &SourceSerializeWrapper(kv))?;
		}
		m.end()
	}
}

#[derive(Debug)]
pub enum RecordParseError {
	WrongType,
	Json(serde_json::Error),
}

impl fmt::Display for RecordParseError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			RecordParseError::WrongType => f.write_str("log record has a different log id"),
			RecordParseError::Json(e) => write!(f, "invalid log record json: {}", e),
		}
	}
}

impl std::error::Error for RecordParseError {}

pub fn parse_record(record: &str) -> Result<ParsedRecord<'_>, RecordParseError> {
	Ok(serde_json::from_str(record).map_err(RecordParseError::Json)?)
}

#[derive(Debug, Deserialize)]
pub struct ParsedRecord<'a> {
	#[serde(borrow)]
	pub msg: Cow<'a, str>,
	pub level: log::Level,
	#[serde(borrow)]
	pub target: Cow<'a, str>,
	pub module: Option<Cow<'a, str>>,
	pub file: Option<Cow<'a, str>>,
	pub line: Option<u32>,
	// structured stuff
	pub id: Option<Cow<'a, str>>,
	#[serde(borrow)]
	pub data: Option<&'a serde_json::value::RawValue>,
}

impl<'a> ParsedRecord<'a> {
	/// Whether this is a structured log message.
	pub fn is_slog(&self) -> bool {
		self.id.is_some()
	}

	/// Check whether this log message if of the given structure log type.
	pub fn is<T: LogMsg>(&self) -> bool {
		self.id.as_deref() == Some(T::LOGID)
	}

	/// Try to parse the log message into the given structured log type.
	pub fn try_as<T: LogMsg>(&self) -> Result<T, RecordParseError> {
		if !self.is::<T>() {
			return Err(RecordParseError::WrongType);
		}

		let json = self.data.map(|v| v.get()).unwrap_or("{}");
		Ok(serde_json::from_str(json).map_err(RecordParseError::Json)?)
	}
}
