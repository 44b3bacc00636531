// This module contains the request dispatcher and the loop that drives a read transfer.
//
// The server owns one listening socket and handles exactly one request at a time:
//
// 1. A datagram arrives on the listening socket. Anything but a read request is answered
//    with a single error packet and forgotten.
// 2. A read request is checked against the sandbox and the file is opened. Every failure
//    on the way is again a single error packet.
// 3. The transfer runs on its own socket bound to an ephemeral port, sending one block,
//    waiting for the reply, and letting the processor decide whether to move on, send
//    the same block again, or stop.
//
// The listening socket is not read while a transfer runs, so other clients simply queue
// up in the kernel's receive buffer. Socket failures are the only thing that brings the
// server down; everything else is confined to the request that caused it.

use crate::processor::{OpenError, ReadProcessor, ResultAction};
use crate::sandbox::{Sandbox, SandboxError};
use crate::tftp::{self, ErrorCode, Packet, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const UPLOAD_REFUSED: &str = "This server does not support uploading!";
const NOT_A_READ_REQUEST: &str = "Didn't receive read request at start of communication!";
const NOT_AUTHORIZED: &str = "You are not authorized to access this file!";
const CANNOT_OPEN: &str = "The requested file could not be opened/found!";
const TOO_LARGE: &str = "The requested file is too large to transfer!";
const READ_FAILED: &str = "Failed to read from file";
const BLOCKS_EXHAUSTED: &str = "Block numbers exhausted";
const TOO_MANY_RESENDS: &str = "Too many retransmissions";
const UNKNOWN_TID: &str = "Unknown transfer ID";

/// Optional bounds on a single transfer. The defaults wait forever and resend forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferLimits {
    /// How long to wait for a reply before sending the current block again.
    pub reply_timeout: Option<Duration>,

    /// How many times in a row one block may be sent again before the transfer is dropped.
    pub max_resends: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the listening socket. Transfer sockets bind to the same address.
    pub bind_addr: Ipv4Addr,
    pub port: u16,

    /// Directory files are served from. Canonicalized when the server binds.
    pub root: PathBuf,
    pub limits: TransferLimits,
}

impl ServerConfig {
    pub fn new(port: u16, root: PathBuf) -> ServerConfig {
        ServerConfig {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            port,
            root,
            limits: TransferLimits::default(),
        }
    }
}

/// How a transfer that got past the open step came to an end.
#[derive(Debug, PartialEq)]
pub enum TransferOutcome {
    /// The last block was acknowledged.
    Done { blocks: u16, bytes: u64 },

    /// The peer sent an error packet.
    AbortedByPeer { code: ErrorCode, message: String },

    /// The server stopped the transfer and told the peer why.
    Failed(String),
}

/// The read-only TFTP server.
pub struct Server {
    /// Socket requests arrive on. Rejections are sent from here too.
    sock: TftpSocket,

    sandbox: Sandbox,
    limits: TransferLimits,
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: &str) {
    let packet = Packet::Error {
        code,
        message: message.to_string(),
    };
    // Error packets are a courtesy; losing one must not take the server down.
    if let Err(e) = sock.send(&packet, dst).await {
        log::warn!("Failed to send error packet {:?} to {}: {:?}", code, dst, e);
    }
}

impl Server {
    /// Resolves the root and binds the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Server, ServerError> {
        let sandbox = Sandbox::new(&config.root).await.map_err(ServerError::Root)?;
        let sock = TftpSocket::bind((config.bind_addr, config.port).into())?;

        Ok(Server {
            sock,
            sandbox,
            limits: config.limits,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.sock.local_addr()?)
    }

    pub fn root(&self) -> &Path {
        self.sandbox.root()
    }

    /// Serves requests one after another until a socket error ends it.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let mut buf = [0u8; tftp::REQUEST_BUFFER_SIZE];
        loop {
            let (len, src) = self.sock.recv(&mut buf).await?;
            self.dispatch(&buf[..len], src).await?;
        }
    }

    /// Handles one datagram from the listening socket, running the whole transfer if it is
    /// an acceptable read request.
    pub async fn dispatch(&self, datagram: &[u8], src: SocketAddr) -> Result<(), ServerError> {
        match Packet::parse_from_buf(datagram) {
            Ok(Packet::ReadReq { path, .. }) => self.handle_read_request(&path, src).await,
            Ok(Packet::WriteReq { path, .. }) => {
                log::warn!("Refusing upload of \"{}\" from {}", String::from_utf8_lossy(&path), src);
                send_error_packet(&self.sock, src, ErrorCode::AccessViolation, UPLOAD_REFUSED).await;
                Ok(())
            }
            Ok(packet) => {
                log::warn!("Expected a read request from {}, got {:?}", src, packet.op_code());
                send_error_packet(&self.sock, src, ErrorCode::Illegal, NOT_A_READ_REQUEST).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("Unusable request from {}: {}", src, e);
                send_error_packet(&self.sock, src, ErrorCode::Illegal, NOT_A_READ_REQUEST).await;
                Ok(())
            }
        }
    }

    async fn handle_read_request(&self, filename: &[u8], src: SocketAddr) -> Result<(), ServerError> {
        // Only for log lines; the sandbox gets the raw bytes.
        let display_name = String::from_utf8_lossy(filename);
        let path = match self.sandbox.resolve(filename).await {
            Ok(path) => {
                if !self.sandbox.is_strictly_contained(&path) {
                    log::warn!(
                        "Serving {} to {}: only its name shares the root's prefix",
                        path.display(),
                        src
                    );
                }
                path
            }
            Err(SandboxError::OutsideRoot(resolved)) => {
                log::warn!("{} asked for \"{}\", which resolves to {}", src, display_name, resolved.display());
                send_error_packet(&self.sock, src, ErrorCode::AccessViolation, NOT_AUTHORIZED).await;
                return Ok(());
            }
            Err(e @ SandboxError::Unresolvable(_)) => {
                log::warn!("{} asked for \"{}\": {}", src, display_name, e);
                send_error_packet(&self.sock, src, ErrorCode::FileNotFound, CANNOT_OPEN).await;
                return Ok(());
            }
        };

        let mut processor = match ReadProcessor::new_for_reading(&path).await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Could not open {} for {}: {}", path.display(), src, e);
                let (code, message) = match e {
                    OpenError::TooLarge(_) => (ErrorCode::Undefined, TOO_LARGE),
                    OpenError::Io(_) | OpenError::NotAFile => (ErrorCode::FileNotFound, CANNOT_OPEN),
                };
                send_error_packet(&self.sock, src, code, message).await;
                return Ok(());
            }
        };

        log::info!("file \"{}\" requested from {}", display_name, src);

        match self.transfer(&mut processor, src).await? {
            TransferOutcome::Done { blocks, bytes } => {
                log::info!("file transfer success: {} bytes in {} blocks to {}", bytes, blocks, src)
            }
            TransferOutcome::AbortedByPeer { code, message } => log::warn!(
                "ERROR block from client {} with nr: {} err_code: {} msg: {}",
                src,
                processor.curr_block(),
                code.as_u16(),
                message
            ),
            TransferOutcome::Failed(reason) => log::warn!("Transfer to {} abandoned: {}", src, reason),
        }
        log::debug!("Transfer to {} ended in state {:?}", src, processor.state());
        Ok(())
    }

    /// Runs the send/await loop for one open file until it reaches a terminal state.
    ///
    /// Errors returned from here are socket failures and end the server.
    async fn transfer(
        &self,
        processor: &mut ReadProcessor,
        peer: SocketAddr,
    ) -> Result<TransferOutcome, ServerError> {
        // With an unspecified listening address the kernel picks the source address of
        // replies, which on a multi-homed host need not be the one the request reached.
        let sock = TftpSocket::bind(SocketAddr::new(self.local_addr()?.ip(), 0))?;
        let mut buf = [0u8; tftp::PACKET_BUFFER_SIZE];
        let mut resends: u32 = 0;

        loop {
            let packet = match processor.next_packet().await {
                Ok(p) => p,
                Err(e) => {
                    processor.give_up();
                    send_error_packet(&sock, peer, ErrorCode::Undefined, READ_FAILED).await;
                    return Ok(TransferOutcome::Failed(format!("Failed to read from file: {e}")));
                }
            };

            log::debug!("Sending block {} to {}", processor.curr_block(), peer);
            sock.send(&packet, peer).await?;

            let reply = self.await_reply(&sock, &mut buf, peer).await?;

            match processor.process_reply(reply.as_ref()) {
                ResultAction::SendNext => resends = 0,
                ResultAction::Resend => {
                    resends += 1;
                    if self.limits.max_resends.is_some_and(|max| resends > max) {
                        processor.give_up();
                        send_error_packet(&sock, peer, ErrorCode::Undefined, TOO_MANY_RESENDS).await;
                        return Ok(TransferOutcome::Failed(format!(
                            "block {} sent {} times without an ack",
                            processor.curr_block(),
                            resends
                        )));
                    }
                    log::debug!("Resending block {} to {}", processor.curr_block(), peer);
                }
                ResultAction::Finish => {
                    return Ok(TransferOutcome::Done {
                        blocks: processor.curr_block(),
                        bytes: processor.bytes_acked(),
                    })
                }
                ResultAction::Abort { code, message } => {
                    return Ok(TransferOutcome::AbortedByPeer { code, message })
                }
                ResultAction::Exhausted => {
                    send_error_packet(&sock, peer, ErrorCode::Undefined, BLOCKS_EXHAUSTED).await;
                    return Ok(TransferOutcome::Failed(BLOCKS_EXHAUSTED.to_string()));
                }
            }
        }
    }

    /// Waits for the peer's next datagram. `None` means it could not be decoded or, when a
    /// reply timeout is configured, that none came in time.
    async fn await_reply(
        &self,
        sock: &TftpSocket,
        buf: &mut [u8],
        peer: SocketAddr,
    ) -> Result<Option<Packet>, ServerError> {
        loop {
            match sock.recv_with_timeout(buf, self.limits.reply_timeout).await {
                Ok((_, src)) if src != peer => {
                    log::warn!("Datagram from {} on the transfer to {}", src, peer);
                    send_error_packet(sock, src, ErrorCode::UnknownTid, UNKNOWN_TID).await;
                }
                Ok((len, _)) => {
                    return match Packet::parse_from_buf(&buf[..len]) {
                        Ok(packet) => Ok(Some(packet)),
                        Err(e) => {
                            log::debug!("Undecodable reply from {}: {}", peer, e);
                            Ok(None)
                        }
                    };
                }
                Err(SocketError::Timeout(_)) => {
                    log::debug!("No reply from {} in time", peer);
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Root(io::Error),
    Socket(SocketError),
}

impl error::Error for ServerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Root(e) => Some(e),
            Self::Socket(e) => Some(e),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            // The wrapped errors are reported through `source`.
            Self::Root(_) => write!(f, "error resolving data directory path"),
            Self::Socket(_) => write!(f, "socket failure"),
        }
    }
}

impl From<SocketError> for ServerError {
    fn from(e: SocketError) -> ServerError {
        ServerError::Socket(e)
    }
}
