use crate::tftp::{self, ErrorCode, Packet};
use std::error;
use std::fmt;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt};

/// Highest block number a transfer can use.
pub const MAX_BLOCKS: u64 = u16::MAX as u64;

/// Files at least this large would need a block number past `MAX_BLOCKS`, counting the
/// terminating short (or empty) block.
pub const MAX_FILE_SIZE: u64 = MAX_BLOCKS * tftp::DATA_BUFFER_SIZE as u64;

/// Where a read transfer stands between two steps of the send/await loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// The next round reads new bytes from the file.
    SendFreshBlock,
    /// The next round repeats the previous block unchanged.
    ResendBlock,
    /// A block is out and the transfer waits for the peer.
    AwaitReply,
    /// The final block was acknowledged.
    Done,
    /// The peer ended the transfer with an error packet.
    AbortedByPeer,
    /// The server ended the transfer on its own.
    Failed,
}

/// Represents an action that the transfer loop should take after a reply to the block it
/// just sent.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// The block was acknowledged; read and send the next one.
    SendNext,

    /// Send the previous block again, byte for byte.
    Resend,

    /// The final block was acknowledged.
    Finish,

    /// The peer gave up. Nothing more is sent.
    Abort { code: ErrorCode, message: String },

    /// A full block carrying the last usable number was acknowledged.
    Exhausted,
}

/// Decides what follows a reply to data block `block`, which carried `payload_len` bytes.
///
/// `reply` is `None` when the datagram could not be decoded at all. Only an ack for
/// exactly `block` moves the transfer forward; any other ack, any other packet and any
/// garbage leave it where it is so the same block goes out again. There is no cap on how
/// often that can happen.
pub fn judge_reply(block: u16, payload_len: usize, reply: Option<&Packet>) -> ResultAction {
    match reply {
        Some(Packet::Ack { block: acked }) if *acked == block => {
            if payload_len < tftp::DATA_BUFFER_SIZE {
                ResultAction::Finish
            } else if block == u16::MAX {
                ResultAction::Exhausted
            } else {
                ResultAction::SendNext
            }
        }
        Some(Packet::Error { code, message }) => ResultAction::Abort {
            code: *code,
            message: message.clone(),
        },
        _ => ResultAction::Resend,
    }
}

#[derive(Debug)]
pub enum OpenError {
    Io(io::Error),
    NotAFile,
    TooLarge(u64),
}

impl error::Error for OpenError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "File IO error: {e}"),
            Self::NotAFile => write!(f, "Not a regular file"),
            Self::TooLarge(len) => write!(f, "File of {len} bytes needs more than {MAX_BLOCKS} blocks"),
        }
    }
}

impl From<io::Error> for OpenError {
    fn from(e: io::Error) -> OpenError {
        OpenError::Io(e)
    }
}

/// The state of one read transfer: the open file, the block in flight and its bytes.
#[derive(Debug)]
pub struct ReadProcessor {
    f: File,
    curr_block: u16,
    data: Vec<u8>,
    state: TransferState,
    bytes_acked: u64,
}

impl ReadProcessor {
    pub async fn new_for_reading(path: &Path) -> Result<ReadProcessor, OpenError> {
        let f = File::open(path).await?;
        let meta = f.metadata().await?;
        if !meta.is_file() {
            return Err(OpenError::NotAFile);
        }
        if meta.len() >= MAX_FILE_SIZE {
            return Err(OpenError::TooLarge(meta.len()));
        }

        Ok(ReadProcessor {
            f,
            curr_block: 1,
            data: Vec::new(),
            state: TransferState::SendFreshBlock,
            bytes_acked: 0,
        })
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// The number of the block currently being offered to the peer.
    pub fn curr_block(&self) -> u16 {
        self.curr_block
    }

    /// Payload bytes the peer has confirmed so far.
    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked
    }

    /// Produces the data packet for this round: a fresh block from the file after an ack,
    /// otherwise the previous block again.
    pub async fn next_packet(&mut self) -> Result<Packet, io::Error> {
        if self.state == TransferState::SendFreshBlock {
            self.data = read_block_from_file(&mut self.f).await?;
        }
        self.state = TransferState::AwaitReply;
        Ok(Packet::Data {
            block: self.curr_block,
            data: self.data.clone(),
        })
    }

    /// Feeds the peer's reply (or `None` for an undecodable datagram) into the machine.
    pub fn process_reply(&mut self, reply: Option<&Packet>) -> ResultAction {
        let action = judge_reply(self.curr_block, self.data.len(), reply);
        self.state = match &action {
            ResultAction::SendNext => {
                self.bytes_acked += self.data.len() as u64;
                self.curr_block += 1;
                TransferState::SendFreshBlock
            }
            ResultAction::Finish => {
                self.bytes_acked += self.data.len() as u64;
                TransferState::Done
            }
            ResultAction::Resend => TransferState::ResendBlock,
            ResultAction::Abort { .. } => TransferState::AbortedByPeer,
            ResultAction::Exhausted => TransferState::Failed,
        };
        action
    }

    /// Marks the transfer as abandoned by the server.
    pub fn give_up(&mut self) {
        self.state = TransferState::Failed;
    }
}

async fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut filled = 0;

    // One call to read may hand back less than asked for without being at EOF, so keep
    // going until the block is full or the file runs dry.
    while filled < buf.len() {
        match f.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::fs;
    use tempdir::TempDir;
    use tokio_test::assert_ok;

    fn scratch_file(contents: &[u8]) -> (TempDir, std::path::PathBuf) {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        fs::write(&path, contents).unwrap();
        (tmpdir, path)
    }

    fn data(block: u16, data: Vec<u8>) -> Packet {
        Packet::Data { block, data }
    }

    #[test]
    fn test_matching_ack_advances() {
        assert_eq!(judge_reply(1, 512, Some(&Packet::Ack { block: 1 })), ResultAction::SendNext);
        assert_eq!(judge_reply(7, 511, Some(&Packet::Ack { block: 7 })), ResultAction::Finish);
        assert_eq!(judge_reply(3, 0, Some(&Packet::Ack { block: 3 })), ResultAction::Finish);
    }

    #[test]
    fn test_mismatched_replies_resend() {
        assert_eq!(judge_reply(2, 512, Some(&Packet::Ack { block: 1 })), ResultAction::Resend);
        assert_eq!(judge_reply(2, 512, Some(&Packet::Ack { block: 3 })), ResultAction::Resend);
        assert_eq!(judge_reply(2, 12, Some(&Packet::Ack { block: 0 })), ResultAction::Resend);
        assert_eq!(judge_reply(2, 512, Some(&data(2, vec![1]))), ResultAction::Resend);
        assert_eq!(
            judge_reply(2, 512, Some(&Packet::ReadReq { path: "x".into(), mode: "octet".into() })),
            ResultAction::Resend
        );
        assert_eq!(judge_reply(2, 512, None), ResultAction::Resend);
    }

    #[test]
    fn test_peer_error_aborts() {
        let reply = Packet::Error { code: ErrorCode::DiskFull, message: "whoops".to_string() };
        assert_eq!(
            judge_reply(4, 512, Some(&reply)),
            ResultAction::Abort { code: ErrorCode::DiskFull, message: "whoops".to_string() }
        );
    }

    #[test]
    fn test_last_block_number_cannot_advance() {
        let ack = Packet::Ack { block: u16::MAX };
        assert_eq!(judge_reply(u16::MAX, 512, Some(&ack)), ResultAction::Exhausted);
        assert_eq!(judge_reply(u16::MAX, 100, Some(&ack)), ResultAction::Finish);
    }

    #[tokio::test]
    async fn test_new_for_reading_invalid_path() {
        match ReadProcessor::new_for_reading(Path::new("/some/invalid/file.txt")).await {
            Err(OpenError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("expected a not-found error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_new_for_reading_directory() {
        let tmpdir = TempDir::new("scratch").unwrap();
        assert!(matches!(
            ReadProcessor::new_for_reading(tmpdir.path()).await,
            Err(OpenError::NotAFile)
        ));
    }

    #[tokio::test]
    async fn test_new_for_reading_too_large() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("huge.bin");
        // Sparse, so this costs no disk space.
        fs::File::create(&path).unwrap().set_len(MAX_FILE_SIZE).unwrap();

        match ReadProcessor::new_for_reading(&path).await {
            Err(OpenError::TooLarge(len)) => assert_eq!(len, MAX_FILE_SIZE),
            other => panic!("expected TooLarge, got {:?}", other),
        }

        fs::File::create(&path).unwrap().set_len(MAX_FILE_SIZE - 1).unwrap();
        assert_ok!(ReadProcessor::new_for_reading(&path).await);
    }

    #[tokio::test]
    async fn test_read_small_file() {
        let (_tmp, path) = scratch_file(b"testing");
        let mut processor = assert_ok!(ReadProcessor::new_for_reading(&path).await);
        assert_eq!(processor.state(), TransferState::SendFreshBlock);

        assert_eq!(
            processor.next_packet().await.unwrap(),
            data(1, vec![0x74, 0x65, 0x73, 0x74, 0x69, 0x6E, 0x67])
        );
        assert_eq!(processor.state(), TransferState::AwaitReply);

        assert_eq!(processor.process_reply(Some(&Packet::Ack { block: 1 })), ResultAction::Finish);
        assert_eq!(processor.state(), TransferState::Done);
        assert_eq!(processor.bytes_acked(), 7);
    }

    #[tokio::test]
    async fn test_read_exact_multiple_ends_with_empty_block() {
        let mut contents = vec![0u8; 1024];
        rand::thread_rng().fill(&mut contents[..]);
        let (_tmp, path) = scratch_file(&contents);
        let mut processor = ReadProcessor::new_for_reading(&path).await.unwrap();

        assert_eq!(processor.next_packet().await.unwrap(), data(1, contents[..512].to_vec()));
        assert_eq!(processor.process_reply(Some(&Packet::Ack { block: 1 })), ResultAction::SendNext);

        assert_eq!(processor.next_packet().await.unwrap(), data(2, contents[512..].to_vec()));
        assert_eq!(processor.process_reply(Some(&Packet::Ack { block: 2 })), ResultAction::SendNext);

        assert_eq!(processor.next_packet().await.unwrap(), data(3, vec![]));
        assert_eq!(processor.process_reply(Some(&Packet::Ack { block: 3 })), ResultAction::Finish);

        assert_eq!(processor.state(), TransferState::Done);
        assert_eq!(processor.bytes_acked(), 1024);
    }

    #[tokio::test]
    async fn test_read_empty_file() {
        let (_tmp, path) = scratch_file(b"");
        let mut processor = ReadProcessor::new_for_reading(&path).await.unwrap();

        assert_eq!(processor.next_packet().await.unwrap(), data(1, vec![]));
        assert_eq!(processor.process_reply(Some(&Packet::Ack { block: 1 })), ResultAction::Finish);
    }

    #[tokio::test]
    async fn test_stale_ack_resends_identical_block() {
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        let (_tmp, path) = scratch_file(&contents);
        let mut processor = ReadProcessor::new_for_reading(&path).await.unwrap();

        let first = processor.next_packet().await.unwrap();
        processor.process_reply(Some(&Packet::Ack { block: 1 }));
        let second = processor.next_packet().await.unwrap();
        assert_eq!(second, data(2, vec![0x78; 512]));

        // Stale ack, future ack, then garbage: the same block every time.
        for reply in [Some(Packet::Ack { block: 1 }), Some(Packet::Ack { block: 3 }), None] {
            assert_eq!(processor.process_reply(reply.as_ref()), ResultAction::Resend);
            assert_eq!(processor.state(), TransferState::ResendBlock);
            assert_eq!(processor.next_packet().await.unwrap(), second);
            assert_eq!(processor.curr_block(), 2);
        }
        assert_ne!(first, second);

        processor.process_reply(Some(&Packet::Ack { block: 2 }));
        assert_eq!(processor.next_packet().await.unwrap(), data(3, b"testing".to_vec()));
        assert_eq!(processor.bytes_acked(), 1024);
    }

    #[tokio::test]
    async fn test_peer_error_ends_transfer() {
        let (_tmp, path) = scratch_file(&[0x78; 2000]);
        let mut processor = ReadProcessor::new_for_reading(&path).await.unwrap();

        processor.next_packet().await.unwrap();
        assert_eq!(
            processor.process_reply(Some(&Packet::Error {
                code: ErrorCode::Undefined,
                message: "whoops".to_string()
            })),
            ResultAction::Abort { code: ErrorCode::Undefined, message: "whoops".to_string() }
        );
        assert_eq!(processor.state(), TransferState::AbortedByPeer);
        assert_eq!(processor.bytes_acked(), 0);
    }

    #[tokio::test]
    async fn test_block_count_matches_file_size() {
        for size in [0usize, 1, 511, 512, 513, 1536, 2000] {
            let mut contents = vec![0u8; size];
            rand::thread_rng().fill(&mut contents[..]);
            let (_tmp, path) = scratch_file(&contents);
            let mut processor = ReadProcessor::new_for_reading(&path).await.unwrap();

            let mut received = Vec::new();
            let mut blocks = 0;
            loop {
                let Packet::Data { block, data } = processor.next_packet().await.unwrap() else {
                    panic!("expected a data packet");
                };
                blocks += 1;
                received.extend_from_slice(&data);
                if processor.process_reply(Some(&Packet::Ack { block })) == ResultAction::Finish {
                    assert_eq!(data.len(), size % 512);
                    break;
                }
            }

            assert_eq!(blocks, size / 512 + 1, "file of {size} bytes");
            assert_eq!(received, contents);
        }
    }

    #[tokio::test]
    async fn test_give_up() {
        let (_tmp, path) = scratch_file(b"abc");
        let mut processor = ReadProcessor::new_for_reading(&path).await.unwrap();
        processor.next_packet().await.unwrap();
        processor.give_up();
        assert_eq!(processor.state(), TransferState::Failed);
    }
}
