//! C1 (StreamParser) + C2 (CanonicalEventModel).

pub mod event;
pub mod parser;

pub use event::{CanonicalEvent, ContentBlock, ResultPayload, SystemInit, SystemSubtype, Usage};
pub use parser::{frame_and_validate, validate, Framed, StreamParser};
