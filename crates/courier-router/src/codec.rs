//! ---
//! courier_section: "03-routing-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Wire codec shared by the external routers."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! JSON framing for envelopes crossing a process boundary.

use bytes::Bytes;
use courier_msg::Envelope;

use crate::{Result, TransportError};

/// Encode an envelope into a single frame.
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|err| TransportError::Codec(err.to_string()))
}

/// Decode a frame and re-check the envelope invariants, since remote peers
/// are not trusted to have enforced them.
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    let envelope: Envelope =
        serde_json::from_slice(frame).map_err(|err| TransportError::Codec(err.to_string()))?;
    envelope
        .validate()
        .map_err(|err| TransportError::Codec(err.to_string()))?;
    Ok(envelope)
}
