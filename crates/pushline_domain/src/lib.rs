#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
}

/// Recipient identifier resolved by authentication.
///
/// Opaque: the only rule is that it is non-empty. No trimming or case folding is applied,
/// `"123"` and `" 123"` are different recipients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
	/// Create a non-empty `Identifier`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Identifier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Identifier {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Identifier::new(s.to_string())
	}
}

/// A text message addressed to one recipient.
///
/// Serialized as `{"uid": .., "message": ..}` for message logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
	#[serde(rename = "uid")]
	pub recipient: Identifier,
	#[serde(rename = "message")]
	pub text: String,
}

impl PushMessage {
	pub fn new(recipient: Identifier, text: impl Into<String>) -> Self {
		Self {
			recipient,
			text: text.into(),
		}
	}

	/// JSON form used by log lines; falls back to a debug rendering.
	pub fn to_log_json(&self) -> String {
		serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identifier_is_opaque_but_non_empty() {
		assert_eq!(Identifier::new("123").unwrap().as_str(), "123");
		assert_eq!(" 123".parse::<Identifier>().unwrap().as_str(), " 123");
		assert_eq!(Identifier::new(""), Err(ParseIdError::Empty));
	}

	#[test]
	fn push_message_serializes_with_wire_names() {
		let msg = PushMessage::new(Identifier::new("123").unwrap(), "Hello World");
		let json = serde_json::to_string(&msg).unwrap();
		assert_eq!(json, r#"{"uid":"123","message":"Hello World"}"#);
		assert_eq!(msg.to_log_json(), json);

		let back: PushMessage = serde_json::from_str(&json).unwrap();
		assert_eq!(back, msg);
	}

	#[test]
	fn secret_string_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(s.expose(), "hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
	}
}
