use std::fmt;
use core::error::Error as StdError;

use anyhow::Context;


/// An error type to add context to anyhow to indicate any form
/// of incorrect user input.
pub struct BadArgument {
	context: Box<dyn fmt::Display + Send + Sync + 'static>,
}

impl BadArgument {
	pub fn new(context: impl fmt::Display + Send + Sync + 'static) -> BadArgument {
		BadArgument {
			context: Box::new(context),
		}
	}
}

impl fmt::Debug for BadArgument {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl fmt::Display for BadArgument {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "bad user input: {}", self.context)
	}
}

impl StdError for BadArgument {}

/// An error type to add context to anyhow to indicate that a session
/// the user refers to doesn't exist.
pub struct NotFound {
	ids: Vec<String>,
	context: Box<dyn fmt::Display + Send + Sync + 'static>,
}

impl NotFound {
	pub fn new<I, V>(ids: V, context: impl fmt::Display + Send + Sync + 'static) -> NotFound
	where
		V: IntoIterator<Item = I>,
		I: fmt::Display,
	{
		NotFound {
			ids: ids.into_iter().map(|i| i.to_string()).collect(),
			context: Box::new(context),
		}
	}

	pub fn identifiers(&self) -> &Vec<String> {
		&self.ids
	}
}

impl fmt::Debug for NotFound {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl fmt::Display for NotFound {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "not found: {}", self.context)
	}
}

impl StdError for NotFound {}

/// The session exists but is in a state that doesn't allow the operation,
/// like cancelling a session that already has a transaction.
pub struct InvalidState {
	id: i64,
	context: Box<dyn fmt::Display + Send + Sync + 'static>,
}

impl InvalidState {
	pub fn new(id: i64, context: impl fmt::Display + Send + Sync + 'static) -> InvalidState {
		InvalidState {
			id,
			context: Box::new(context),
		}
	}

	pub fn session_id(&self) -> i64 {
		self.id
	}
}

impl fmt::Debug for InvalidState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl fmt::Display for InvalidState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "session {} {}", self.id, self.context)
	}
}

impl StdError for InvalidState {}


/// Return an [anyhow] error tagged with [BadArgument].
#[macro_export]
macro_rules! badarg {
	($($arg:tt)*) => {
		Err(anyhow::Error::from($crate::error::BadArgument::new(format!($($arg)*))))
	};
}

/// Return an [anyhow] error tagged with [NotFound].
#[macro_export]
macro_rules! not_found {
	($ids:expr, $($arg:tt)*) => {
		Err(anyhow::Error::from($crate::error::NotFound::new($ids, format!($($arg)*))))
	};
}

/// Return an [anyhow] error tagged with [InvalidState].
#[macro_export]
macro_rules! invalid_state {
	($id:expr, $($arg:tt)*) => {
		Err(anyhow::Error::from($crate::error::InvalidState::new($id, format!($($arg)*))))
	};
}


/// Extension trait for tagging errors.
pub trait ContextExt<T, E>: Context<T, E> {
	/// Tag an error with [BadArgument].
	fn badarg<C>(self, context: C) -> anyhow::Result<T>
		where C: fmt::Display + Send + Sync + 'static;

	/// Tag an error with [NotFound].
	fn not_found<I, V, C>(self, ids: V, context: C) -> anyhow::Result<T>
	where
		V: IntoIterator<Item = I>,
		I: fmt::Display,
		C: fmt::Display + Send + Sync + 'static;
}

impl<R, T, E> ContextExt<T, E> for R
where
	R: Context<T, E>,
{
	fn badarg<C>(self, context: C) -> anyhow::Result<T>
	where
		C: fmt::Display + Send + Sync + 'static,
	{
		self.context(BadArgument::new(context))
	}

	fn not_found<I, V, C>(self, ids: V, context: C) -> anyhow::Result<T>
	where
		V: IntoIterator<Item = I>,
		I: fmt::Display,
		C: fmt::Display + Send + Sync + 'static,
	{
		self.context(NotFound::new(ids, context))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn downcast() {
		let e = "not-an-address".parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
			.context("inner_context")
			.badarg("invalid address")
			.context("outer_context")
			.unwrap_err();
		assert!(e.downcast_ref::<BadArgument>().is_some());
		assert!(e.downcast_ref::<NotFound>().is_none());

		let e = Option::<()>::None
			.not_found([42], "receive session")
			.context("cancel_receive")
			.unwrap_err();
		let nf = e.downcast_ref::<NotFound>().unwrap();
		assert_eq!(nf.identifiers(), &vec!["42".to_string()]);
	}

	#[test]
	fn print_format() {
		let e = Option::<()>::None
			.context("inner_context")
			.badarg("badarg_context")
			.context("outer_context")
			.unwrap_err();

		let display = format!("{}", e);
		assert_eq!(display, "outer_context");

		let debug = format!("{:?}", e);
		assert!(debug.starts_with(
			"outer_context\n\nCaused by:\n    0: bad user input: badarg_context\n    \
				1: inner_context",
		), "actual: {}", debug);
	}

	#[test]
	fn macros() {
		let e: anyhow::Result<()> = badarg!("amount must be positive: {}", 0);
		assert!(e.unwrap_err().downcast_ref::<BadArgument>().is_some());

		let e: anyhow::Result<()> = not_found!([12], "send session {}", 12);
		assert!(e.unwrap_err().downcast_ref::<NotFound>().is_some());

		let e: anyhow::Result<()> = invalid_state!(7, "is already cancelled");
		let e = e.unwrap_err();
		assert_eq!(e.to_string(), "session 7 is already cancelled");
		assert_eq!(e.downcast_ref::<InvalidState>().unwrap().session_id(), 7);
	}
}
