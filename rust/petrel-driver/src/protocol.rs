//! Message type ids shared with clients over the CnC file.
//!
//! The full request/event codec belongs to the client library; the lifecycle
//! core only needs the handful of frames it consumes (resource requests and
//! keepalives on the to-driver ring) and produces (lifecycle events on the
//! to-clients broadcast). Payloads are little-endian and fixed-shape.

/// Client -> driver: add a publication (`client_id: i64`, `stream_id: i32`).
pub const MSG_ADD_PUBLICATION: i32 = 0x01;
/// Client -> driver: remove a publication (`client_id: i64`, `registration_id: u64`).
pub const MSG_REMOVE_PUBLICATION: i32 = 0x02;
/// Client -> driver: add a subscription (`client_id: i64`, `stream_id: i32`).
pub const MSG_ADD_SUBSCRIPTION: i32 = 0x04;
/// Client -> driver: remove a subscription (`client_id: i64`, `registration_id: u64`).
pub const MSG_REMOVE_SUBSCRIPTION: i32 = 0x05;
/// Client -> driver: keepalive carrying the client id.
pub const MSG_CLIENT_KEEPALIVE: i32 = 0x0B;

/// Driver -> clients: a resource request completed (`registration_id: u64`).
pub const EVT_OPERATION_SUCCESS: i32 = 0x0F00;
/// Driver -> clients: a client was aged out after missing keepalives.
pub const EVT_CLIENT_TIMEOUT: i32 = 0x0F01;

/// Encode a client id payload.
#[inline]
pub fn encode_client_id(client_id: i64) -> [u8; 8] {
    client_id.to_le_bytes()
}

/// Decode a client id payload; `None` if the frame is malformed.
#[inline]
pub fn decode_client_id(payload: &[u8]) -> Option<i64> {
    Some(i64::from_le_bytes(payload.get(..8)?.try_into().ok()?))
}

/// Encode an add-publication/add-subscription request.
#[inline]
pub fn encode_add_stream(client_id: i64, stream_id: i32) -> [u8; 12] {
    let mut payload = [0u8; 12];
    payload[..8].copy_from_slice(&client_id.to_le_bytes());
    payload[8..].copy_from_slice(&stream_id.to_le_bytes());
    payload
}

/// Decode an add-publication/add-subscription request.
#[inline]
pub fn decode_add_stream(payload: &[u8]) -> Option<(i64, i32)> {
    let client_id = i64::from_le_bytes(payload.get(..8)?.try_into().ok()?);
    let stream_id = i32::from_le_bytes(payload.get(8..12)?.try_into().ok()?);
    Some((client_id, stream_id))
}

/// Encode a remove-publication/remove-subscription request.
#[inline]
pub fn encode_remove_registration(client_id: i64, registration_id: u64) -> [u8; 16] {
    let mut payload = [0u8; 16];
    payload[..8].copy_from_slice(&client_id.to_le_bytes());
    payload[8..].copy_from_slice(&registration_id.to_le_bytes());
    payload
}

/// Decode a remove-publication/remove-subscription request.
#[inline]
pub fn decode_remove_registration(payload: &[u8]) -> Option<(i64, u64)> {
    let client_id = i64::from_le_bytes(payload.get(..8)?.try_into().ok()?);
    let registration_id = u64::from_le_bytes(payload.get(8..16)?.try_into().ok()?);
    Some((client_id, registration_id))
}

/// Encode a registration id event payload.
#[inline]
pub fn encode_registration_id(registration_id: u64) -> [u8; 8] {
    registration_id.to_le_bytes()
}
