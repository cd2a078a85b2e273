use crate::{
    compact,
    id::Kuid,
    routing::contact::Contact,
    storage::DhtValueEntity,
};
use serde::{
    de::{Deserializer, Error as _, IgnoredAny, SeqAccess, Visitor},
    ser::{SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use serde_bytes::ByteBuf;
use std::{fmt, net::SocketAddr, time::Duration};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct Message {
    #[serde(rename = "t", with = "serde_bytes")]
    pub message_id: Vec<u8>,
    #[serde(rename = "c")]
    pub contact: ContactInfo,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Decode the message from bencode.
    pub fn decode(input: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(input)
    }

    /// Encode the message into bencode.
    pub fn encode(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "y")]
pub(crate) enum MessageBody {
    #[serde(rename = "q")]
    Request(Request),
    #[serde(rename = "r")]
    Response(Response),
    #[serde(rename = "e", with = "error_body")]
    Error(Error),
}

/// Sender of a message as it describes itself. The address is taken from the datagram.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct ContactInfo {
    pub id: Kuid,
    #[serde(rename = "i")]
    pub instance_id: u8,
    #[serde(rename = "f")]
    pub flags: u8,
}

impl ContactInfo {
    pub fn into_contact(self, addr: SocketAddr) -> Contact {
        Contact::as_alive(self.id, addr)
            .with_instance_id(self.instance_id)
            .with_flags(self.flags)
    }
}

impl From<&Contact> for ContactInfo {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id(),
            instance_id: contact.instance_id(),
            flags: contact.flags(),
        }
    }
}

/// Contact listed in a `Nodes` or `Values` response.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct NodeInfo {
    pub id: Kuid,
    #[serde(rename = "a", with = "compact::addr")]
    pub addr: SocketAddr,
}

impl NodeInfo {
    /// Second hand information, so the contact starts out unknown.
    pub fn into_contact(self) -> Contact {
        Contact::as_unknown(self.id, self.addr)
    }
}

impl From<&Contact> for NodeInfo {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id(),
            addr: contact.addr(),
        }
    }
}

/// A value as it travels in `Store` requests and `Values` responses.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct WireValue {
    #[serde(rename = "k")]
    pub key: Kuid,
    #[serde(rename = "o")]
    pub originator: Kuid,
    #[serde(rename = "v", with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl WireValue {
    pub fn into_remote_entity(self, lifetime: Duration) -> DhtValueEntity {
        DhtValueEntity::remote(self.key, self.originator, self.payload, lifetime)
    }
}

impl From<&DhtValueEntity> for WireValue {
    fn from(entity: &DhtValueEntity) -> Self {
        Self {
            key: entity.primary_key(),
            originator: entity.secondary_key(),
            payload: entity.payload().to_vec(),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
#[serde(rename_all = "snake_case")]
pub(crate) enum Request {
    Ping(PingRequest),
    FindNode(FindNodeRequest),
    FindValue(FindValueRequest),
    Store(StoreRequest),
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct PingRequest {}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct FindNodeRequest {
    pub target: Kuid,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct FindValueRequest {
    pub key: Kuid,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct StoreRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
    pub values: Vec<WireValue>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "r")]
#[serde(rename_all = "snake_case")]
pub(crate) enum Response {
    Pong(PongResponse),
    Nodes(NodesResponse),
    Values(ValuesResponse),
    Stored(StoredResponse),
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct PongResponse {}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct NodesResponse {
    pub nodes: Vec<NodeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct ValuesResponse {
    pub values: Vec<WireValue>,
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct StoredResponse {
    pub stored: u32,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct Error {
    pub code: u8,
    pub message: String,
}

// Using custom Serialize/Deserialize impls because the format is a bare list.
impl Serialize for Error {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(2))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Error {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ErrorVisitor;

        impl<'de> Visitor<'de> for ErrorVisitor {
            type Value = Error;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a list of two elements: an integer and a string")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let code: u8 = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let message = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;

                // Make sure the list is consumed to the end.
                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(A::Error::invalid_length(3, &self));
                }

                Ok(Error { code, message })
            }
        }

        d.deserialize_seq(ErrorVisitor)
    }
}

// Puts the error list one level down, under the "e" key.
mod error_body {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Wrapper<T> {
        #[serde(rename = "e")]
        field: T,
    }

    pub(crate) fn serialize<T: Serialize, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
        Wrapper { field: value }.serialize(s)
    }

    pub(crate) fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        d: D,
    ) -> Result<T, D::Error> {
        let wrapper = Wrapper::deserialize(d)?;
        Ok(wrapper.field)
    }
}

pub mod error_code {
    // some of these codes are not sent by this crate but we still list them here for completeness.
    #![allow(unused)]

    pub const GENERIC_ERROR: u8 = 201;
    pub const SERVER_ERROR: u8 = 202;
    pub const PROTOCOL_ERROR: u8 = 203;
    pub const METHOD_UNKNOWN: u8 = 204;
}
