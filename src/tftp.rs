// Wire format and socket plumbing for the read-only TFTP server.
//
// Every packet starts with a 2-byte big-endian opcode:
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ)
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
//
// RRQ/WRQ:  0x01/0x02 | Filename | 0x00 | Mode | 0x00
// DATA:     0x03 | Block # (2 bytes) | Data (0-512 bytes)
// ACK:      0x04 | Block # (2 bytes)
// ERROR:    0x05 | ErrorCode (2 bytes) | ErrMsg
//
// Error packets leave the server without a trailing NUL: the datagram is exactly the
// message plus the 4 header bytes. Incoming error messages end at the first NUL or at
// the end of the datagram, whichever comes first.

use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest payload carried by one data packet. A shorter payload ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Opcode plus block number (or error code).
pub const HEADER_SIZE: usize = 4;

/// Longest filename honoured in a read request; anything past it is dropped.
pub const MAX_FILENAME_LEN: usize = DATA_BUFFER_SIZE - 1;

/// How much of an initial request datagram is read.
pub const REQUEST_BUFFER_SIZE: usize = 2 + MAX_FILENAME_LEN + 1;

/// How much of a reply datagram is read while a transfer is running.
pub const PACKET_BUFFER_SIZE: usize = HEADER_SIZE + DATA_BUFFER_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            SocketError::IO(e) => Some(e),
            SocketError::Timeout(e) => Some(e),
            SocketError::PacketParse(_) => None,
        }
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            // The io::Error itself is reported through `source`.
            SocketError::IO(_) => write!(f, "Socket IO error"),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {e}"),
            SocketError::Timeout(_) => write!(f, "Socket IO timeout"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<u16> for ErrorCode {
    // Codes outside the RFC table collapse to Undefined.
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read, relative to the served root. Kept as
        /// raw bytes: filenames need not be UTF-8.
        path: Vec<u8>,

        /// The transfer mode. Carried along but never interpreted.
        mode: String,
    },

    /// A write request packet. Only ever decoded so it can be refused.
    WriteReq {
        path: Vec<u8>,
        mode: String,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Reads a big-endian u16 at `offset`, treating missing bytes as zero.
fn u16_from_buffer(buf: &[u8], offset: usize) -> u16 {
    let byte = |i: usize| buf.get(offset + i).copied().unwrap_or(0);
    u16::from_be_bytes([byte(0), byte(1)])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until
/// the first 0 byte.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let (bytes, end) = bytes_from_buffer(buf);
    (String::from_utf8_lossy(bytes).into_owned(), end)
}

/// Like `string_from_buffer`, but hands back the bytes untouched.
fn bytes_from_buffer(buf: &[u8]) -> (&[u8], usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (&buf[..end], end)
}

#[derive(Debug, PartialEq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl OpCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(buf, 0);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

/// Splits the body of a request into filename and mode. Neither terminator is required:
/// a request cut short still names a file, and the mode is ignored anyway.
fn parse_path_and_mode(buf: &[u8]) -> (Vec<u8>, String) {
    let (path, path_end) = bytes_from_buffer(buf);
    let path = path[..path.len().min(MAX_FILENAME_LEN)].to_vec();

    let mode = match buf.get(path_end + 1..) {
        Some(rest) => string_from_buffer(rest).0,
        None => String::new(),
    };

    (path, mode)
}

fn parse_read_req(buf: &[u8]) -> Packet {
    let (path, mode) = parse_path_and_mode(&buf[2..]);
    Packet::ReadReq { path, mode }
}

fn parse_write_req(buf: &[u8]) -> Packet {
    let (path, mode) = parse_path_and_mode(&buf[2..]);
    Packet::WriteReq { path, mode }
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < HEADER_SIZE {
        return Err(SocketError::PacketParse("Data packet lacks a block number".to_string()));
    }
    let block = u16_from_buffer(buf, 2);
    Ok(Packet::Data { block, data: Vec::from(&buf[HEADER_SIZE..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < HEADER_SIZE {
        return Err(SocketError::PacketParse("Ack packet lacks a block number".to_string()));
    }
    let block = u16_from_buffer(buf, 2);
    Ok(Packet::Ack { block })
}

// A peer that bothers to send an error wants the transfer gone, so a truncated error
// packet is still honoured.
fn parse_error(buf: &[u8]) -> Packet {
    let code = ErrorCode::from(u16_from_buffer(buf, 2));
    let message = match buf.get(HEADER_SIZE..) {
        Some(rest) => {
            let bounded = &rest[..rest.len().min(DATA_BUFFER_SIZE)];
            string_from_buffer(bounded).0
        }
        None => String::new(),
    };
    Packet::Error { code, message }
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(buf)? {
            OpCode::Rrq => Ok(parse_read_req(buf)),
            OpCode::Wrq => Ok(parse_write_req(buf)),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => Ok(parse_error(buf)),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Serializes the packet into the exact bytes that go on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_BUFFER_SIZE);
        buf.extend_from_slice(&self.op_code().as_u16().to_be_bytes());
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                buf.extend_from_slice(path);
                buf.push(0x00);
                buf.extend_from_slice(mode.as_bytes());
                buf.push(0x00);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                let bytes = message.as_bytes();
                buf.extend_from_slice(&bytes[..bytes.len().min(DATA_BUFFER_SIZE)]);
            }
        }
        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that speaks TFTP packets outbound and hands raw
/// datagrams back to the caller, who decides how strictly to decode them.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    pub async fn recv(&self, buf: &mut [u8]) -> TftpResult<(usize, SocketAddr)> {
        Ok(self.sock.recv_from(buf).await?)
    }

    /// Waits for one datagram, giving up after `ttl` when one is set.
    pub async fn recv_with_timeout(
        &self,
        buf: &mut [u8],
        ttl: Option<Duration>,
    ) -> TftpResult<(usize, SocketAddr)> {
        match ttl {
            Some(ttl) => Ok(timeout(ttl, self.sock.recv_from(buf)).await??),
            None => self.recv(buf).await,
        }
    }
}
