//! Compact representation of socket addresses: 4 or 16 address bytes followed by the port in
//! network byte order.

use std::{
    convert::TryInto,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

const SOCKET_ADDR_V4_LEN: usize = 6;
const SOCKET_ADDR_V6_LEN: usize = 18;

/// Serialize/deserialize a single `SocketAddr` in compact format.
pub(crate) mod addr {
    use serde::{
        de::{Deserialize, Deserializer, Error as _},
        ser::Serializer,
    };
    use serde_bytes::ByteBuf;
    use std::net::SocketAddr;

    pub(crate) fn serialize<S>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_bytes(&super::encode_socket_addr(addr))
    }

    pub(crate) fn deserialize<'de, D>(d: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = ByteBuf::deserialize(d)?;

        super::decode_socket_addr(&bytes)
            .ok_or_else(|| D::Error::invalid_length(bytes.len(), &"6 or 18 bytes"))
    }
}

pub(crate) fn decode_socket_addr(src: &[u8]) -> Option<SocketAddr> {
    if src.len() == SOCKET_ADDR_V4_LEN {
        let addr: [u8; 4] = src.get(..4)?.try_into().ok()?;
        let port = u16::from_be_bytes(src.get(4..)?.try_into().ok()?);
        Some((Ipv4Addr::from(addr), port).into())
    } else if src.len() == SOCKET_ADDR_V6_LEN {
        let addr: [u8; 16] = src.get(..16)?.try_into().ok()?;
        let port = u16::from_be_bytes(src.get(16..)?.try_into().ok()?);
        Some((Ipv6Addr::from(addr), port).into())
    } else {
        None
    }
}

pub(crate) fn encode_socket_addr(addr: &SocketAddr) -> Vec<u8> {
    let mut buffer = match addr {
        SocketAddr::V4(addr) => {
            let mut buffer = Vec::with_capacity(SOCKET_ADDR_V4_LEN);
            buffer.extend(addr.ip().octets().as_ref());
            buffer
        }
        SocketAddr::V6(addr) => {
            let mut buffer = Vec::with_capacity(SOCKET_ADDR_V6_LEN);
            buffer.extend(addr.ip().octets().as_ref());
            buffer
        }
    };

    buffer.extend(addr.port().to_be_bytes().as_ref());
    buffer
}
