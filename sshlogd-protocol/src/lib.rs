// Copyright 2024 The sshlogd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire protocol for talking to the sshlogd control socket.
//!
//! Every frame on the wire is a JSON object with the keys `client_id`,
//! `correlation_id`, `payload_type`, `dto_payload`. `dto_payload` is itself a
//! JSON *string* (not a nested object) holding the serialized typed payload,
//! which in turn carries its own `payload_type` so it can be told apart after
//! the outer envelope has already been stripped off.

use std::fmt;

use anyhow::{anyhow, bail};
use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Stable integer codes for every payload that can appear as `payload_type`
/// in an envelope, on both the outer and the inner (dto_payload) layer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PayloadType {
    SessionListRequest = 1,
    SessionListResponse = 2,
    EventWatchRequest = 101,
    EventWatchResponse = 102,
    ShellSendkeysRequest = 201,
    KillSessionRequest = 301,
    KillSessionResponse = 302,
}

impl TryFrom<i32> for PayloadType {
    type Error = ProtocolError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => PayloadType::SessionListRequest,
            2 => PayloadType::SessionListResponse,
            101 => PayloadType::EventWatchRequest,
            102 => PayloadType::EventWatchResponse,
            201 => PayloadType::ShellSendkeysRequest,
            301 => PayloadType::KillSessionRequest,
            302 => PayloadType::KillSessionResponse,
            other => return Err(ProtocolError::UnknownPayloadType(other)),
        })
    }
}

/// Errors that mean the frame must be logged and dropped with no response,
/// per the daemon's error taxonomy (a malformed envelope never reaches a
/// handler, so it can never produce a reply).
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unknown payload_type {0}")]
    UnknownPayloadType(i32),
    #[error("dto_payload did not match its declared payload_type")]
    PayloadMismatch,
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The outer frame as it appears literally on the wire.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireEnvelope {
    pub client_id: String,
    pub correlation_id: String,
    pub payload_type: i32,
    pub dto_payload: String,
}

impl WireEnvelope {
    pub fn encode<T: Serialize>(
        client_id: &str,
        correlation_id: &str,
        payload_type: PayloadType,
        payload: &T,
    ) -> anyhow::Result<WireEnvelope> {
        Ok(WireEnvelope {
            client_id: client_id.to_string(),
            correlation_id: correlation_id.to_string(),
            payload_type: payload_type as i32,
            dto_payload: serde_json::to_string(payload)?,
        })
    }

    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_str(&self.dto_payload)?)
    }
}

/// EventKind: the closed set of event tags the native tracer emits.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionNew,
    ConnectionEstablished,
    ConnectionAuthFailed,
    ConnectionClose,
    CommandStart,
    CommandFinish,
    TerminalUpdate,
    FileUpload,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::ConnectionNew => "connection_new",
            EventKind::ConnectionEstablished => "connection_established",
            EventKind::ConnectionAuthFailed => "connection_auth_failed",
            EventKind::ConnectionClose => "connection_close",
            EventKind::CommandStart => "command_start",
            EventKind::CommandFinish => "command_finish",
            EventKind::TerminalUpdate => "terminal_update",
            EventKind::FileUpload => "file_upload",
        };
        write!(f, "{s}")
    }
}

/// Every event kind that is legal to name in plugin configuration (`triggers:`
/// lists, EventWatch requests). `connection_new` is deliberately excluded: it
/// is reserved for internal bookkeeping and is never delivered past the bus.
pub const ALL_SUBSCRIBABLE_EVENT_KINDS: &[EventKind] = &[
    EventKind::ConnectionEstablished,
    EventKind::ConnectionAuthFailed,
    EventKind::ConnectionClose,
    EventKind::CommandStart,
    EventKind::CommandFinish,
    EventKind::TerminalUpdate,
    EventKind::FileUpload,
];

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TcpInfo {
    pub server_ip: String,
    pub client_ip: String,
    pub server_port: u16,
    pub client_port: u16,
}

/// A single event as emitted by the native tracer and, after enrichment,
/// delivered to bus subscribers. All fields that are not meaningful for a
/// given `kind` are left at their default.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub ptm_pid: i64,

    // connection_* fields
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub pts_pid: i64,
    #[serde(default)]
    pub shell_pid: i64,
    #[serde(default)]
    pub tty_id: i64,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default)]
    pub start_time_raw: f64,
    #[serde(default)]
    pub end_time_raw: f64,
    #[serde(default)]
    pub tcp_info: TcpInfo,

    // command_start / command_finish fields
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub parent_pid: i64,
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default)]
    pub stdout_size: i64,
    #[serde(default)]
    pub stdout: String,

    // terminal_update fields
    #[serde(default)]
    pub terminal_data: String,
    #[serde(default)]
    pub data_len: i64,

    // file_upload fields
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub file_mode: i64,
}

impl Event {
    /// EventKind travels alongside an Event (the bus delivers `(EventKind,
    /// Event)` pairs) rather than inside it, so construction only needs the
    /// primary key.
    pub fn new(ptm_pid: i64) -> Event {
        Event { ptm_pid, ..Default::default() }
    }
}

/// One row of a SESSION_LIST_RESPONSE.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SessionDto {
    pub ptm_pid: i64,
    pub pts_pid: i64,
    pub shell_pid: i64,
    pub tty_id: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub last_activity_time: i64,
    pub last_command: String,
    pub user_id: i64,
    pub username: String,
    pub client_ip: String,
    pub client_port: u16,
    pub server_ip: String,
    pub server_port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SessionListRequestDto {
    pub payload_type: i32,
}

impl SessionListRequestDto {
    pub fn new() -> Self {
        SessionListRequestDto { payload_type: PayloadType::SessionListRequest as i32 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SessionListResponseDto {
    pub payload_type: i32,
    pub sessions: Vec<SessionDto>,
}

impl SessionListResponseDto {
    pub fn new(sessions: Vec<SessionDto>) -> Self {
        SessionListResponseDto { payload_type: PayloadType::SessionListResponse as i32, sessions }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EventWatchRequestDto {
    pub payload_type: i32,
    pub event_types: Vec<EventKind>,
    pub ptm_pid: Option<i64>,
}

impl EventWatchRequestDto {
    pub fn new(event_types: Vec<EventKind>, ptm_pid: Option<i64>) -> Self {
        EventWatchRequestDto {
            payload_type: PayloadType::EventWatchRequest as i32,
            event_types,
            ptm_pid,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EventWatchResponseDto {
    pub payload_type: i32,
    pub event_type: EventKind,
    pub payload_json: String,
}

impl EventWatchResponseDto {
    pub fn new(event_type: EventKind, event: &Event) -> anyhow::Result<Self> {
        Ok(EventWatchResponseDto {
            payload_type: PayloadType::EventWatchResponse as i32,
            event_type,
            payload_json: serde_json::to_string(event)?,
        })
    }
}

impl Default for EventKind {
    fn default() -> Self {
        EventKind::ConnectionEstablished
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ShellSendkeysRequestDto {
    pub payload_type: i32,
    pub ptm_pid: i64,
    pub keys: String,
    pub force_redraw: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct KillSessionRequestDto {
    pub payload_type: i32,
    pub ptm_pid: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct KillSessionResponseDto {
    pub payload_type: i32,
    pub success: bool,
}

impl KillSessionResponseDto {
    pub fn new(success: bool) -> Self {
        KillSessionResponseDto { payload_type: PayloadType::KillSessionResponse as i32, success }
    }
}

/// A decoded, dispatch-ready request. Produced from a [`WireEnvelope`] by
/// [`decode_request`] after the outer/inner `payload_type` fields have been
/// checked against each other.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    SessionList(SessionListRequestDto),
    Watch(EventWatchRequestDto),
    SendKeys(ShellSendkeysRequestDto),
    Kill(KillSessionRequestDto),
}

#[derive(Debug, Clone)]
pub enum ResponsePayload {
    SessionList(SessionListResponseDto),
    Watch(EventWatchResponseDto),
    Kill(KillSessionResponseDto),
}

/// A decoded request, still carrying the envelope's routing metadata.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub client_id: String,
    pub correlation_id: String,
    pub payload: RequestPayload,
}

pub fn decode_request(envelope: &WireEnvelope) -> Result<DecodedRequest, ProtocolError> {
    let payload_type = PayloadType::try_from(envelope.payload_type)?;
    let payload = match payload_type {
        PayloadType::SessionListRequest => {
            RequestPayload::SessionList(envelope.decode_payload()?)
        }
        PayloadType::EventWatchRequest => RequestPayload::Watch(envelope.decode_payload()?),
        PayloadType::ShellSendkeysRequest => RequestPayload::SendKeys(envelope.decode_payload()?),
        PayloadType::KillSessionRequest => RequestPayload::Kill(envelope.decode_payload()?),
        _ => return Err(ProtocolError::PayloadMismatch),
    };
    Ok(DecodedRequest {
        client_id: envelope.client_id.clone(),
        correlation_id: envelope.correlation_id.clone(),
        payload,
    })
}

pub fn encode_response(
    client_id: &str,
    correlation_id: &str,
    payload: &ResponsePayload,
) -> anyhow::Result<WireEnvelope> {
    match payload {
        ResponsePayload::SessionList(dto) => {
            WireEnvelope::encode(client_id, correlation_id, PayloadType::SessionListResponse, dto)
        }
        ResponsePayload::Watch(dto) => {
            WireEnvelope::encode(client_id, correlation_id, PayloadType::EventWatchResponse, dto)
        }
        ResponsePayload::Kill(dto) => {
            WireEnvelope::encode(client_id, correlation_id, PayloadType::KillSessionResponse, dto)
        }
    }
}

/// Reads successive [`WireEnvelope`]s from a stream. JSON objects are
/// self-delimiting, so no length prefix is needed: `serde_json`'s streaming
/// deserializer consumes exactly one value per call and leaves the reader
/// positioned at the start of the next one.
pub struct EnvelopeReader<R> {
    de: serde_json::StreamDeserializer<'static, serde_json::de::IoRead<R>, WireEnvelope>,
}

impl<R: std::io::Read> EnvelopeReader<R> {
    pub fn new(reader: R) -> Self {
        EnvelopeReader { de: serde_json::Deserializer::from_reader(reader).into_iter() }
    }

    /// Returns `Ok(None)` on a clean EOF between frames.
    pub fn read_one(&mut self) -> anyhow::Result<Option<WireEnvelope>> {
        match self.de.next() {
            Some(Ok(envelope)) => Ok(Some(envelope)),
            Some(Err(err)) if err.is_eof() => Ok(None),
            Some(Err(err)) => bail!(err),
            None => Ok(None),
        }
    }
}

pub fn write_envelope<W: std::io::Write>(
    mut writer: W,
    envelope: &WireEnvelope,
) -> anyhow::Result<()> {
    serde_json::to_writer(&mut writer, envelope).map_err(|e| anyhow!(e))?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_every_payload_type() {
        let list_req = WireEnvelope::encode(
            "client-a",
            "corr-1",
            PayloadType::SessionListRequest,
            &SessionListRequestDto::new(),
        )
        .unwrap();
        let decoded = decode_request(&list_req).unwrap();
        assert!(matches!(decoded.payload, RequestPayload::SessionList(_)));

        let watch_req = WireEnvelope::encode(
            "client-a",
            "corr-2",
            PayloadType::EventWatchRequest,
            &EventWatchRequestDto::new(vec![EventKind::CommandStart], Some(42)),
        )
        .unwrap();
        let decoded = decode_request(&watch_req).unwrap();
        match decoded.payload {
            RequestPayload::Watch(dto) => {
                assert_eq!(dto.ptm_pid, Some(42));
                assert_eq!(dto.event_types, vec![EventKind::CommandStart]);
            }
            _ => panic!("expected Watch"),
        }

        let kill_req = WireEnvelope::encode(
            "client-a",
            "corr-3",
            PayloadType::KillSessionRequest,
            &KillSessionRequestDto { payload_type: PayloadType::KillSessionRequest as i32, ptm_pid: 7 },
        )
        .unwrap();
        let decoded = decode_request(&kill_req).unwrap();
        match decoded.payload {
            RequestPayload::Kill(dto) => assert_eq!(dto.ptm_pid, 7),
            _ => panic!("expected Kill"),
        }

        let sendkeys_req = WireEnvelope::encode(
            "client-a",
            "corr-4",
            PayloadType::ShellSendkeysRequest,
            &ShellSendkeysRequestDto {
                payload_type: PayloadType::ShellSendkeysRequest as i32,
                ptm_pid: 7,
                keys: "ls\n".to_string(),
                force_redraw: true,
            },
        )
        .unwrap();
        let decoded = decode_request(&sendkeys_req).unwrap();
        match decoded.payload {
            RequestPayload::SendKeys(dto) => assert_eq!(dto.keys, "ls\n"),
            _ => panic!("expected SendKeys"),
        }
    }

    #[test]
    fn unknown_payload_type_is_rejected() {
        let envelope = WireEnvelope {
            client_id: "c".to_string(),
            correlation_id: "corr".to_string(),
            payload_type: 9999,
            dto_payload: "{}".to_string(),
        };
        assert!(matches!(
            decode_request(&envelope),
            Err(ProtocolError::UnknownPayloadType(9999))
        ));
    }

    #[test]
    fn envelope_reader_reads_successive_frames() {
        let mut buf = Vec::new();
        let e1 = WireEnvelope::encode(
            "c",
            "corr-1",
            PayloadType::SessionListRequest,
            &SessionListRequestDto::new(),
        )
        .unwrap();
        let e2 = WireEnvelope::encode(
            "c",
            "corr-2",
            PayloadType::SessionListRequest,
            &SessionListRequestDto::new(),
        )
        .unwrap();
        write_envelope(&mut buf, &e1).unwrap();
        write_envelope(&mut buf, &e2).unwrap();

        let mut reader = EnvelopeReader::new(buf.as_slice());
        let got1 = reader.read_one().unwrap().unwrap();
        let got2 = reader.read_one().unwrap().unwrap();
        assert_eq!(got1.correlation_id, "corr-1");
        assert_eq!(got2.correlation_id, "corr-2");
        assert!(reader.read_one().unwrap().is_none());
    }

    #[test]
    fn session_dto_round_trips_through_response_envelope() {
        let sessions = vec![SessionDto {
            ptm_pid: 42,
            username: "a".to_string(),
            tty_id: 7,
            ..Default::default()
        }];
        let resp = ResponsePayload::SessionList(SessionListResponseDto::new(sessions.clone()));
        let envelope = encode_response("c", "corr-1", &resp).unwrap();
        let decoded: SessionListResponseDto = envelope.decode_payload().unwrap();
        assert_eq!(decoded.sessions, sessions);
    }
}
