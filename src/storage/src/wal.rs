use std::io::{self, BufWriter, Read, Write};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use log::info;

use crate::types::BatchOp;

/// Binary WAL format constants
const WAL_MAGIC: &[u8; 4] = b"RWAL";
const WAL_VERSION: u8 = 1;

/// Operation types
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Record header: magic(4) + version(1) + op_count(4) = 9 bytes
const HEADER_SIZE: usize = 9;
/// Per-op header: op(1) + key_len(4) + value_len(4) = 9 bytes
const OP_HEADER_SIZE: usize = 9;
/// CRC32 size
const CRC_SIZE: usize = 4;

/// Number of puts written per record when compacting
const SNAPSHOT_CHUNK: usize = 1000;

/// Encode one atomic batch as a single WAL record
pub fn encode_record(ops: &[BatchOp]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + ops.len() * 64);

    buf.extend_from_slice(WAL_MAGIC);
    buf.push(WAL_VERSION);
    buf.extend_from_slice(&(ops.len() as u32).to_le_bytes());

    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                buf.push(OP_PUT);
                buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(key);
                buf.extend_from_slice(value);
            }
            BatchOp::Delete { key } => {
                buf.push(OP_DELETE);
                buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                buf.extend_from_slice(&0u32.to_le_bytes());
                buf.extend_from_slice(key);
            }
        }
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    buf
}

fn read_u32(data: &[u8], offset: usize) -> io::Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Record truncated"))
}

/// Decode one WAL record, returning the batch and the number of bytes consumed
pub fn decode_record(data: &[u8]) -> io::Result<(Vec<BatchOp>, usize)> {
    if data.len() < HEADER_SIZE + CRC_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Record too short"));
    }

    if &data[0..4] != WAL_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Invalid magic"));
    }

    let version = data[4];
    if version != WAL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unsupported WAL version: {}", version)
        ));
    }

    let op_count = read_u32(data, 5)? as usize;
    let mut offset = HEADER_SIZE;
    let mut ops = Vec::with_capacity(op_count.min(4096));

    for _ in 0..op_count {
        let op = *data.get(offset)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Record truncated"))?;
        let key_len = read_u32(data, offset + 1)? as usize;
        let value_len = read_u32(data, offset + 5)? as usize;
        offset += OP_HEADER_SIZE;

        let end = offset + key_len + value_len;
        if data.len() < end + CRC_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Record truncated"));
        }

        let key = data[offset..offset + key_len].to_vec();
        offset += key_len;

        match op {
            OP_PUT => {
                let value = data[offset..offset + value_len].to_vec();
                ops.push(BatchOp::Put { key, value });
            }
            OP_DELETE => ops.push(BatchOp::Delete { key }),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unknown operation: {}", op)
                ));
            }
        }
        offset += value_len;
    }

    let stored_crc = read_u32(data, offset)?;
    let calculated_crc = crc32fast::hash(&data[..offset]);
    if stored_crc != calculated_crc {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("CRC mismatch: stored={}, calculated={}", stored_crc, calculated_crc)
        ));
    }

    Ok((ops, offset + CRC_SIZE))
}

/// Write-Ahead Log for durability (binary format, one record per batch)
pub struct Wal {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    records: usize,
}

impl Wal {
    /// Open (or create) the WAL at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        info!("WAL initialized at {:?} (binary format v{})", path, WAL_VERSION);

        Ok(Wal {
            path,
            writer: Some(BufWriter::new(file)),
            records: 0,
        })
    }

    /// Append a batch as one record; the batch is durable once this returns
    pub fn append(&mut self, ops: &[BatchOp]) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("WAL {:?} has no open append handle", self.path),
            ));
        };
        writer.write_all(&encode_record(ops))?;
        writer.flush()?;
        self.records += 1;
        Ok(())
    }

    /// Records appended since the last open or compaction
    pub fn records(&self) -> usize {
        self.records
    }

    /// Read every intact record from the WAL file
    pub fn read_records(&mut self) -> io::Result<Vec<Vec<BatchOp>>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;

        let mut batches = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match decode_record(&data[offset..]) {
                Ok((ops, consumed)) => {
                    batches.push(ops);
                    offset += consumed;
                }
                Err(e) => {
                    info!("Skipping corrupted WAL record at offset {}: {}", offset, e);
                    offset += 1;
                    while offset + 4 <= data.len() {
                        if &data[offset..offset + 4] == WAL_MAGIC {
                            break;
                        }
                        offset += 1;
                    }
                    if offset + 4 > data.len() {
                        break;
                    }
                }
            }
        }

        self.records = batches.len();
        Ok(batches)
    }

    /// Rewrite the WAL as a snapshot of live entries.
    ///
    /// The snapshot is written to a side file and renamed over the log.
    /// On failure before the rename the current append handle stays in
    /// place, so the log keeps accepting records.
    pub fn compact(&mut self, snapshot: &[(Vec<u8>, Vec<u8>)]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);

            for chunk in snapshot.chunks(SNAPSHOT_CHUNK) {
                let ops: Vec<BatchOp> = chunk.iter()
                    .map(|(k, v)| BatchOp::Put { key: k.clone(), value: v.clone() })
                    .collect();
                writer.write_all(&encode_record(&ops))?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        // the old handle now points at the replaced file
        self.writer = None;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        self.records = snapshot.len().div_ceil(SNAPSHOT_CHUNK);

        info!("WAL compacted with {} entries (binary format)", snapshot.len());
        Ok(())
    }

    /// Get the WAL file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}
