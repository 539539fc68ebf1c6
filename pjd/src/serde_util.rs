
use std::fmt;

use serde::{de, Deserializer, Serializer};


pub mod duration {
	use super::*;

	use std::time::Duration;

	pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(&humantime::format_duration(*duration))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		struct Visitor;

		impl<'de> de::Visitor<'de> for Visitor {
			type Value = Duration;

			fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
				f.write_str("a duration")
			}

			fn visit_str<E: de::Error>(self, s: &str) -> Result<Self::Value, E> {
				humantime::parse_duration(s).map_err(serde::de::Error::custom)
			}
		}
		d.deserialize_str(Visitor)
	}
}
