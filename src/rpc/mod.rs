//! Purpose: Typed rpc envelopes and the per-subject event bus that dispatches them.
//! Exports: `RpcType`, `Request`, `Response`, `TransferPlayerRequest`,
//! `TransferPlayerResponse`, `Status`, `EventBus`, `Registration`, `RpcHandler`, `rpc_handler_fn`.
//! Role: Multiplexes several request kinds over one messaging subject.
//! Invariants: `data` is itself JSON text; the envelope never interprets it.
//! Invariants: Wire names (`type`, `data`, `OK`, `ERROR`) are stable.
#![allow(clippy::result_large_err)]

mod bus;

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind};

pub use bus::{EventBus, Registration, RpcHandler, rpc_handler_fn};

/// Open set of request kinds; unknown tags are carried through and nak'd by buses without a handler.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcType(Cow<'static, str>);

impl RpcType {
    pub const TRANSFER_PLAYER: RpcType = RpcType(Cow::Borrowed("TRANSFER_PLAYER"));

    pub fn new(tag: impl Into<String>) -> Self {
        Self(Cow::Owned(tag.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub rpc_type: RpcType,
    pub data: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub rpc_type: RpcType,
    pub data: String,
}

impl Request {
    pub fn new<T: Serialize>(rpc_type: RpcType, payload: &T) -> Result<Self, Error> {
        let data = encode_payload(&rpc_type, payload)?;
        Ok(Self { rpc_type, data })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        decode_payload(&self.rpc_type, &self.data)
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        encode_envelope(self)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, Error> {
        decode_envelope(raw, "request")
    }
}

impl Response {
    pub fn new<T: Serialize>(rpc_type: RpcType, payload: &T) -> Result<Self, Error> {
        let data = encode_payload(&rpc_type, payload)?;
        Ok(Self { rpc_type, data })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        decode_payload(&self.rpc_type, &self.data)
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        encode_envelope(self)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, Error> {
        decode_envelope(raw, "response")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlayerRequest {
    pub uuid: Uuid,
    pub source: String,
    pub destination: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlayerResponse {
    pub status: Status,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

fn encode_payload<T: Serialize>(rpc_type: &RpcType, payload: &T) -> Result<String, Error> {
    serde_json::to_string(payload).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to encode {rpc_type} payload"))
            .with_source(err)
    })
}

fn decode_payload<T: DeserializeOwned>(rpc_type: &RpcType, data: &str) -> Result<T, Error> {
    serde_json::from_str(data).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message(format!("malformed {rpc_type} payload"))
            .with_source(err)
    })
}

fn encode_envelope<T: Serialize>(envelope: &T) -> Result<Bytes, Error> {
    serde_json::to_vec(envelope).map(Bytes::from).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode rpc envelope")
            .with_source(err)
    })
}

fn decode_envelope<T: DeserializeOwned>(raw: &[u8], what: &str) -> Result<T, Error> {
    serde_json::from_slice(raw).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message(format!("malformed rpc {what}"))
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{Request, Response, RpcType, Status, TransferPlayerRequest, TransferPlayerResponse};
    use crate::core::error::ErrorKind;
    use serde_json::Value;
    use uuid::Uuid;

    #[test]
    fn transfer_request_wire_shape() {
        let uuid = Uuid::parse_str("6f1c0a4e-31c3-4c59-9d55-0c2a6b5f3a10").expect("uuid");
        let request = Request::new(
            RpcType::TRANSFER_PLAYER,
            &TransferPlayerRequest {
                uuid,
                source: "proxy-0".to_string(),
                destination: "lobby".to_string(),
            },
        )
        .expect("request");

        let wire: Value = serde_json::from_slice(&request.to_bytes().expect("bytes")).expect("json");
        assert_eq!(wire["type"], "TRANSFER_PLAYER");
        let data: Value = serde_json::from_str(wire["data"].as_str().expect("string data")).expect("data");
        assert_eq!(data["uuid"], "6f1c0a4e-31c3-4c59-9d55-0c2a6b5f3a10");
        assert_eq!(data["source"], "proxy-0");
        assert_eq!(data["destination"], "lobby");
    }

    #[test]
    fn status_uses_uppercase_names() {
        let response = Response::new(
            RpcType::TRANSFER_PLAYER,
            &TransferPlayerResponse { status: Status::Error },
        )
        .expect("response");
        assert_eq!(response.data, r#"{"status":"ERROR"}"#);
        let decoded: TransferPlayerResponse = response.decode().expect("decode");
        assert_eq!(decoded.status, Status::Error);
        assert_eq!(
            serde_json::to_string(&Status::Ok).expect("json"),
            "\"OK\""
        );
    }

    #[test]
    fn unknown_types_survive_decoding() {
        let request = Request::from_bytes(br#"{"type":"KICK_PLAYER","data":"{}"}"#).expect("decode");
        assert_eq!(request.rpc_type, RpcType::new("KICK_PLAYER"));
        assert_ne!(request.rpc_type, RpcType::TRANSFER_PLAYER);
    }

    #[test]
    fn malformed_envelope_is_corrupt() {
        let err = Request::from_bytes(b"not json").expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        let request = Request::from_bytes(br#"{"type":"TRANSFER_PLAYER","data":"{"}"#).expect("envelope");
        let err = request
            .decode::<TransferPlayerRequest>()
            .expect_err("payload");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
