//! IPv4 `sockaddr_in` encoding for connect and accept.
//!
//! IPv6 is not supported.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{Error, Result};

/// Encodes `addr` as a kernel `sockaddr_in` (network byte order).
///
/// # Errors
///
/// [`Error::InvalidState`] for IPv6 addresses.
pub fn encode(addr: SocketAddr) -> Result<libc::sockaddr_in> {
    let SocketAddr::V4(v4) = addr else {
        return Err(Error::InvalidState("IPv6 addresses are not supported"));
    };
    Ok(encode_v4(v4))
}

pub fn encode_v4(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut raw: libc::sockaddr_in = unsafe { core::mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = addr.port().to_be();
    raw.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    raw
}

/// Decodes a kernel-filled `sockaddr_in` of `len` bytes.
///
/// # Errors
///
/// [`Error::ResultProjection`] if the family is not `AF_INET` or `len` is short.
pub fn decode(raw: &libc::sockaddr_in, len: libc::socklen_t) -> Result<SocketAddrV4> {
    if (len as usize) < size_of::<libc::sockaddr_in>() {
        return Err(Error::ResultProjection("peer address truncated"));
    }
    if raw.sin_family != libc::AF_INET as libc::sa_family_t {
        return Err(Error::ResultProjection("peer address is not IPv4"));
    }
    let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
    Ok(SocketAddrV4::new(ip, u16::from_be(raw.sin_port)))
}
