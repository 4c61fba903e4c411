//! The parts that make up request and response streams.
//!
//! A request stream always has the shape `metadata, message*, end` and a
//! response stream the shape `metadata, message*, status`. The interceptor
//! and handler state machines validate these shapes; this module only
//! defines the vocabulary.

use crate::metadata::Metadata;
use crate::status::Status;
use bytes::Bytes;

/// One part of a request stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPart {
    /// The leading metadata. Always the first part.
    Metadata(Metadata),
    /// A serialized user message. The core never looks inside.
    Message(Bytes),
    /// End of the request stream. Always the last part.
    End,
}

/// One part of a response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    /// The leading metadata. Always the first part.
    Metadata(Metadata),
    /// A serialized user message. The core never looks inside.
    Message(Bytes),
    /// The terminal status with trailing metadata. Always the last part.
    Status(Status),
}

impl RequestPart {
    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestPart::Metadata(_) => "metadata",
            RequestPart::Message(_) => "message",
            RequestPart::End => "end",
        }
    }
}

impl ResponsePart {
    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ResponsePart::Metadata(_) => "metadata",
            ResponsePart::Message(_) => "message",
            ResponsePart::Status(_) => "status",
        }
    }
}
