//! File transfer engine: split a file into chunks, send them with backpressure,
//! and reassemble inbound chunks by index.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::identity;
use crate::protocol::{ApplicationMessage, FileChunk, FileMetadata};
use crate::transport::{Channel, TransportError};
use crate::wire::{encode_message, ChunkEncoding, FrameEncodeError};

/// Number of chunks a file of `size` bytes is split into. An empty file is
/// still sent as one (empty) final chunk.
pub fn expected_chunks(size: u64, chunk_size: usize) -> u64 {
    let chunk = chunk_size.max(1) as u64;
    size.div_ceil(chunk).max(1)
}

/// Split `data` into dense, 0-based chunks. Exactly one chunk has `last` set.
pub fn split_into_chunks<'a>(
    file_id: &'a str,
    data: &'a [u8],
    chunk_size: usize,
) -> impl Iterator<Item = FileChunk> + 'a {
    let size = chunk_size.max(1);
    let total = expected_chunks(data.len() as u64, size);
    (0..total).map(move |index| {
        let start = (index as usize).saturating_mul(size).min(data.len());
        let end = start.saturating_add(size).min(data.len());
        FileChunk {
            file_id: file_id.to_string(),
            index,
            last: index + 1 == total,
            data: data[start..end].to_vec(),
        }
    })
}

/// A file picked by the user for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Progress of one transfer, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub file_id: String,
    pub name: String,
    pub done: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.done.min(self.total) * 100) / self.total) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReport {
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    /// Sends deferred because the channel buffer was full.
    pub backpressure_retries: u64,
}

/// One outgoing file bound to the session channel. Built by
/// `PeerCore::prepare_file` and driven by the host, usually on its own task.
#[derive(Debug)]
pub struct OutboundTransfer {
    file_id: String,
    file: OutgoingFile,
    channel: Channel,
    chunk_size: usize,
    encoding: ChunkEncoding,
}

impl OutboundTransfer {
    pub fn new(file: OutgoingFile, channel: Channel, chunk_size: usize, encoding: ChunkEncoding) -> Self {
        Self {
            file_id: identity::new_token(),
            file,
            channel,
            chunk_size: chunk_size.max(1),
            encoding,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn name(&self) -> &str {
        &self.file.name
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            file_id: self.file_id.clone(),
            name: self.file.name.clone(),
            size: self.file.data.len() as u64,
            mime_type: self.file.mime_type.clone(),
        }
    }

    /// Send metadata then every chunk in order. Backpressure is waited out;
    /// any other failure aborts the transfer. Chunks already sent stay sent.
    pub async fn run<F>(self, mut progress: F) -> Result<TransferReport, TransferError>
    where
        F: FnMut(TransferProgress),
    {
        let total = self.file.data.len() as u64;
        let mut report = TransferReport::default();
        info!(
            event = "transfer_send_start",
            file_id = %self.file_id,
            name = %self.file.name,
            size = total,
            chunks = expected_chunks(total, self.chunk_size),
            "Sending file"
        );

        let meta = ApplicationMessage::FileMetadata(self.metadata());
        let payload = encode_message(&meta, self.encoding)?;
        report.backpressure_retries += u64::from(self.channel.send_retrying(&payload).await?);

        for chunk in split_into_chunks(&self.file_id, &self.file.data, self.chunk_size) {
            let len = chunk.data.len() as u64;
            let index = chunk.index;
            let payload = encode_message(&ApplicationMessage::FileChunk(chunk), self.encoding)?;
            match self.channel.send_retrying(&payload).await {
                Ok(deferred) => report.backpressure_retries += u64::from(deferred),
                Err(e) => {
                    warn!(event = "transfer_send_abort", file_id = %self.file_id, index, error = %e, "File transfer aborted");
                    return Err(TransferError::Send(e));
                }
            }
            report.chunks_sent += 1;
            report.bytes_sent += len;
            progress(TransferProgress {
                file_id: self.file_id.clone(),
                name: self.file.name.clone(),
                done: report.bytes_sent,
                total,
            });
        }

        info!(
            event = "transfer_send_done",
            file_id = %self.file_id,
            chunks = report.chunks_sent,
            retries = report.backpressure_retries,
            "File sent"
        );
        Ok(report)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file transfer failed: {0}")]
    Send(#[from] TransportError),
    #[error("file transfer failed: {0}")]
    Encode(#[from] FrameEncodeError),
}

/// A fully reassembled inbound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ReceivedFile {
    /// Lowercase hex SHA-256 of the contents.
    pub fn sha256_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferAssemblyError {
    #[error("file {name:?} incomplete: received {filled} of {expected} chunks")]
    MissingChunks {
        name: String,
        filled: u64,
        expected: u64,
    },
    #[error("file {name:?} size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("file {name:?} final chunk {index} is beyond the {expected} chunks announced")]
    IndexOutOfRange {
        name: String,
        index: u64,
        expected: u64,
    },
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Unknown file id or index out of range.
    Ignored,
    Progress(TransferProgress),
    Complete(ReceivedFile),
    Failed {
        file_id: String,
        error: TransferAssemblyError,
    },
}

/// State of one file being received. Chunks are kept sparse by index; the
/// announced size only bounds which indices are accepted.
#[derive(Debug)]
struct InboundFileTransfer {
    metadata: FileMetadata,
    expected: u64,
    chunks: BTreeMap<u64, Vec<u8>>,
    received_bytes: u64,
}

impl InboundFileTransfer {
    fn new(metadata: FileMetadata, chunk_size: usize) -> Self {
        Self {
            expected: expected_chunks(metadata.size, chunk_size),
            metadata,
            chunks: BTreeMap::new(),
            received_bytes: 0,
        }
    }

    fn filled(&self) -> u64 {
        self.chunks.len() as u64
    }

    fn progress(&self) -> TransferProgress {
        TransferProgress {
            file_id: self.metadata.file_id.clone(),
            name: self.metadata.name.clone(),
            done: self.received_bytes,
            total: self.metadata.size,
        }
    }

    fn assemble(self) -> Result<ReceivedFile, TransferAssemblyError> {
        let expected = self.expected;
        let filled = self.filled();
        if filled < expected {
            return Err(TransferAssemblyError::MissingChunks {
                name: self.metadata.name,
                filled,
                expected,
            });
        }
        let mut data = Vec::with_capacity(self.received_bytes as usize);
        for chunk in self.chunks.into_values() {
            data.extend_from_slice(&chunk);
        }
        if data.len() as u64 != self.metadata.size {
            return Err(TransferAssemblyError::SizeMismatch {
                name: self.metadata.name,
                expected: self.metadata.size,
                actual: data.len() as u64,
            });
        }
        Ok(ReceivedFile {
            file_id: self.metadata.file_id,
            name: self.metadata.name,
            mime_type: self.metadata.mime_type,
            data,
        })
    }
}

/// All inbound transfers of a session, keyed by file id.
#[derive(Debug)]
pub struct InboundTransfers {
    entries: HashMap<String, InboundFileTransfer>,
    chunk_size: usize,
}

impl Default for InboundTransfers {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundTransfers {
    pub fn new() -> Self {
        Self::with_chunk_size(crate::protocol::DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.entries.contains_key(file_id)
    }

    /// Start tracking a file. A repeated id discards what was received so far.
    pub fn on_metadata(&mut self, metadata: FileMetadata) -> TransferProgress {
        let file_id = metadata.file_id.clone();
        let entry = InboundFileTransfer::new(metadata, self.chunk_size);
        let progress = entry.progress();
        if self.entries.insert(file_id.clone(), entry).is_some() {
            warn!(event = "transfer_restarted", %file_id, "Duplicate file metadata, restarting transfer");
        } else {
            info!(event = "transfer_recv_start", %file_id, name = %progress.name, size = progress.total, "Receiving file");
        }
        progress
    }

    pub fn on_chunk(&mut self, chunk: FileChunk) -> ChunkOutcome {
        let Some(entry) = self.entries.get_mut(&chunk.file_id) else {
            debug!(event = "chunk_unknown_file", file_id = %chunk.file_id, index = chunk.index, "Chunk for unknown file ignored");
            return ChunkOutcome::Ignored;
        };
        if chunk.index >= entry.expected {
            warn!(
                event = "chunk_out_of_range",
                file_id = %chunk.file_id,
                index = chunk.index,
                expected = entry.expected,
                last = chunk.last,
                "Chunk index beyond announced size"
            );
            if !chunk.last {
                return ChunkOutcome::Ignored;
            }
            // The final chunk ends the transfer whether or not it fits.
            let expected = entry.expected;
            let name = entry.metadata.name.clone();
            self.entries.remove(&chunk.file_id);
            return ChunkOutcome::Failed {
                file_id: chunk.file_id,
                error: TransferAssemblyError::IndexOutOfRange {
                    name,
                    index: chunk.index,
                    expected,
                },
            };
        }
        let len = chunk.data.len() as u64;
        let replaced = entry
            .chunks
            .insert(chunk.index, chunk.data)
            .map_or(0, |p| p.len() as u64);
        entry.received_bytes = entry.received_bytes - replaced + len;

        if !chunk.last {
            return ChunkOutcome::Progress(entry.progress());
        }
        let Some(entry) = self.entries.remove(&chunk.file_id) else {
            return ChunkOutcome::Ignored;
        };
        match entry.assemble() {
            Ok(file) => {
                info!(event = "transfer_recv_done", file_id = %file.file_id, bytes = file.data.len(), "File received");
                ChunkOutcome::Complete(file)
            }
            Err(error) => {
                warn!(event = "transfer_assembly_failed", file_id = %chunk.file_id, %error, "Discarding incomplete file");
                ChunkOutcome::Failed {
                    file_id: chunk.file_id,
                    error,
                }
            }
        }
    }

    /// Drop every partial transfer.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!(event = "transfers_cleared", count = self.entries.len());
        }
        self.entries.clear();
    }
}
