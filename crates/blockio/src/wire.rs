//! Data frames exchanged between a master and a remote worker.
//!
//! Frames are MessagePack values.  MessagePack is self-delimiting, so a
//! stream carries frames back to back with no extra length prefix; a
//! datagram carries exactly one frame.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::error::TransportError;
use crate::request::{Operation, Response};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    Request {
        id: CorrelationId,
        tablespace: usize,
        operation: Operation,
    },
    Response(Response),
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(error: rmp_serde::decode::Error) -> Self {
        use rmp_serde::decode::Error::{InvalidDataRead, InvalidMarkerRead};
        match error {
            InvalidMarkerRead(error) | InvalidDataRead(error) => error.into(),
            error => TransportError::Codec(error.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(error: rmp_serde::encode::Error) -> Self {
        TransportError::Codec(error.to_string())
    }
}

/// Serializes `value`.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Deserializes one value from `bytes`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Writes `value` to `writer` as one frame.
pub fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: Write,
    T: Serialize,
{
    writer.write_all(&encode(value)?)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame from `reader`.  End of stream is reported as a
/// [`TransportError::Io`] of kind [`std::io::ErrorKind::UnexpectedEof`].
pub fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: Read,
    T: DeserializeOwned,
{
    Ok(rmp_serde::decode::from_read(reader)?)
}
