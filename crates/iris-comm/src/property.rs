//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Codec contract implemented by protocol-specific properties."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::any::Any;
use std::fmt;

use bytes::BytesMut;
use strum::Display;

use crate::controller::ControllerInfo;
use crate::error::{CommError, Result};

/// Direction of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// Read values from the controller.
    Query,
    /// Write values to the controller.
    Store,
}

/// Progress reported by a property decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The response was consumed from the input buffer.
    Complete,
    /// More bytes are required; nothing was consumed.
    Incomplete,
}

/// Object-safe downcasting support for boxed properties.
pub trait AsAny: Any {
    /// Borrow as [`Any`].
    fn as_any(&self) -> &dyn Any;
    /// Convert a boxed value into a boxed [`Any`].
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// One protocol request/response unit.
///
/// Encoders append a complete request to `out`. Decoders inspect `input` and, once a
/// full response is present, consume exactly that response (e.g. via
/// [`BytesMut::split_to`]) and return [`DecodeStatus::Complete`]. A decoder that needs
/// more bytes must leave `input` untouched and return [`DecodeStatus::Incomplete`].
///
/// Any verb a property does not override fails with [`CommError::Unsupported`]. The
/// comm message consults [`ControllerProperty::supports`] before touching the wire.
pub trait ControllerProperty: AsAny + Send + fmt::Debug {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether the property implements the given direction. Defaults to query only.
    fn supports(&self, direction: Direction) -> bool {
        matches!(direction, Direction::Query)
    }

    /// Encode a query request.
    fn encode_query(&self, _ctl: &ControllerInfo, _out: &mut BytesMut) -> Result<()> {
        Err(self.unsupported(Direction::Query))
    }

    /// Decode a query response.
    fn decode_query(
        &mut self,
        _ctl: &ControllerInfo,
        _input: &mut BytesMut,
    ) -> Result<DecodeStatus> {
        Err(self.unsupported(Direction::Query))
    }

    /// Encode a store request.
    fn encode_store(&self, _ctl: &ControllerInfo, _out: &mut BytesMut) -> Result<()> {
        Err(self.unsupported(Direction::Store))
    }

    /// Decode a store response.
    fn decode_store(
        &mut self,
        _ctl: &ControllerInfo,
        _input: &mut BytesMut,
    ) -> Result<DecodeStatus> {
        Err(self.unsupported(Direction::Store))
    }

    /// Error describing a missing verb.
    fn unsupported(&self, direction: Direction) -> CommError {
        CommError::Unsupported {
            property: self.name(),
            direction,
        }
    }
}

/// Split one line terminated by `terminator` off the front of `input`.
///
/// Returns the line without its terminator, or `None` when the terminator has not
/// arrived yet.
pub fn split_line(input: &mut BytesMut, terminator: &[u8]) -> Option<BytesMut> {
    let pos = input
        .windows(terminator.len())
        .position(|window| window == terminator)?;
    let mut line = input.split_to(pos + terminator.len());
    line.truncate(pos);
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct ReadOnly;

    impl ControllerProperty for ReadOnly {
        fn name(&self) -> &'static str {
            "read-only"
        }
    }

    #[test]
    fn default_verbs_are_unsupported() {
        let ctl = ControllerInfo::new("ctl", "link", 1);
        let mut out = BytesMut::new();
        let err = ReadOnly.encode_store(&ctl, &mut out).unwrap_err();
        assert!(matches!(
            err,
            CommError::Unsupported {
                property: "read-only",
                direction: Direction::Store
            }
        ));
        assert!(ReadOnly.supports(Direction::Query));
        assert!(!ReadOnly.supports(Direction::Store));
        assert!(out.is_empty());
    }

    #[test]
    fn split_line_waits_for_terminator() {
        let mut input = BytesMut::from(&b"OK\r\nRLY 01"[..]);
        assert_eq!(split_line(&mut input, b"\r\n").unwrap(), &b"OK"[..]);
        assert!(split_line(&mut input, b"\r\n").is_none());
        assert_eq!(&input[..], b"RLY 01");
    }

    #[test]
    fn boxed_property_downcasts() {
        let boxed: Box<dyn ControllerProperty> = Box::new(ReadOnly);
        assert!((*boxed).as_any().downcast_ref::<ReadOnly>().is_some());
        assert!(boxed.into_any().downcast::<ReadOnly>().is_ok());
    }
}
