//! RecordBatch v2 encoding and decoding.
//!
//! # RecordBatch Header Layout
//!
//! ```text
//! Offset  Size  Field
//! 0       8     base_offset
//! 8       4     batch_length
//! 12      4     partition_leader_epoch
//! 16      1     magic (2 for v2+)
//! 17      4     crc
//! 21      2     attributes
//! 23      4     last_offset_delta
//! 27      8     first_timestamp
//! 35      8     max_timestamp
//! 43      8     producer_id
//! 51      2     producer_epoch
//! 53      4     first_sequence
//! 57      4     records_count
//! ```
//!
//! Each record that follows is a zigzag-varint length followed by:
//! attributes (i8), timestamp_delta (varlong), offset_delta (varint),
//! key (varint length, -1 for null), value (varint length, -1 for null),
//! and a varint count of headers (varint key length, key, varint value
//! length, value).

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{be_i8, be_i16, be_i32, be_i64, be_u32},
};
use nombytes::NomBytes;

use crate::constants::{
    BATCH_BASE_OFFSET, BATCH_COMPRESSION_MASK, BATCH_CONTROL_FLAG, BATCH_CRC_DATA_START,
    BATCH_CRC_OFFSET, BATCH_LENGTH_OFFSET, BATCH_LENGTH_PREFIX, BATCH_MAGIC_OFFSET,
    MIN_BATCH_HEADER_SIZE, NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE, RECORD_BATCH_MAGIC,
};
use crate::encode::{encode_varint, encode_varlong, varlong_size};
use crate::error::{Error, ErrorContext, KafkaCode, Result};
use crate::parser::{bytes_to_string, parse_varint, parse_varlong};

// CRC-32C polynomial used by Kafka (Castagnoli)
const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x82F63B78;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Compute CRC-32C checksum (Castagnoli polynomial).
pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    !crc
}

/// Result of CRC validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcValidationResult {
    Valid,
    Invalid { expected: u32, actual: u32 },
    TooSmall,
}

/// Validate the CRC-32C of a raw RecordBatch.
///
/// ```
/// use kafkaesque_client::protocol::{validate_batch_crc, CrcValidationResult};
///
/// let batch = vec![0u8; 10];
/// assert_eq!(validate_batch_crc(&batch), CrcValidationResult::TooSmall);
/// ```
pub fn validate_batch_crc(batch: &[u8]) -> CrcValidationResult {
    if batch.len() < BATCH_CRC_DATA_START {
        return CrcValidationResult::TooSmall;
    }

    let stored_crc = u32::from_be_bytes([
        batch[BATCH_CRC_OFFSET],
        batch[BATCH_CRC_OFFSET + 1],
        batch[BATCH_CRC_OFFSET + 2],
        batch[BATCH_CRC_OFFSET + 3],
    ]);
    let computed_crc = crc32c(&batch[BATCH_CRC_DATA_START..]);

    if stored_crc == computed_crc {
        CrcValidationResult::Valid
    } else {
        CrcValidationResult::Invalid {
            expected: stored_crc,
            actual: computed_crc,
        }
    }
}

/// Rewrite the base offset of a raw RecordBatch and refresh its CRC.
///
/// Brokers assign offsets by patching the producer's zero base offset; the
/// in-memory test cluster does the same.
pub fn patch_base_offset(batch: &mut [u8], base_offset: i64) {
    if batch.len() >= BATCH_BASE_OFFSET + 8 {
        batch[BATCH_BASE_OFFSET..BATCH_BASE_OFFSET + 8]
            .copy_from_slice(&base_offset.to_be_bytes());
    }
    // base_offset sits outside the CRC region, but the CRC is refreshed anyway
    // so callers can patch batches that were never checksummed.
    if batch.len() >= BATCH_CRC_DATA_START {
        let new_crc = crc32c(&batch[BATCH_CRC_DATA_START..]);
        batch[BATCH_CRC_OFFSET..BATCH_CRC_OFFSET + 4].copy_from_slice(&new_crc.to_be_bytes());
    }
}

/// One key/value header on a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

impl RecordHeader {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// A record inside a batch, with offsets and timestamps relative to the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub offset_delta: i32,
    pub timestamp_delta: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl BatchRecord {
    fn body_size(&self) -> usize {
        let mut size = 1 // attributes
            + varlong_size(self.timestamp_delta)
            + varlong_size(self.offset_delta as i64)
            + nullable_varbytes_size(self.key.as_deref())
            + nullable_varbytes_size(self.value.as_deref())
            + varlong_size(self.headers.len() as i64);
        for header in &self.headers {
            size += nullable_varbytes_size(Some(header.key.as_bytes()));
            size += nullable_varbytes_size(header.value.as_deref());
        }
        size
    }

    fn encode<W: BufMut>(&self, buffer: &mut W) {
        encode_varint(buffer, self.body_size() as i32);
        buffer.put_i8(0);
        encode_varlong(buffer, self.timestamp_delta);
        encode_varint(buffer, self.offset_delta);
        encode_nullable_varbytes(buffer, self.key.as_deref());
        encode_nullable_varbytes(buffer, self.value.as_deref());
        encode_varint(buffer, self.headers.len() as i32);
        for header in &self.headers {
            encode_nullable_varbytes(buffer, Some(header.key.as_bytes()));
            encode_nullable_varbytes(buffer, header.value.as_deref());
        }
    }

    /// Encoded size of this record including its length prefix.
    pub fn encoded_size(&self) -> usize {
        let body = self.body_size();
        varlong_size(body as i64) + body
    }
}

fn nullable_varbytes_size(data: Option<&[u8]>) -> usize {
    match data {
        Some(data) => varlong_size(data.len() as i64) + data.len(),
        None => varlong_size(-1),
    }
}

fn encode_nullable_varbytes<W: BufMut>(buffer: &mut W, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            encode_varint(buffer, data.len() as i32);
            buffer.put_slice(data);
        }
        None => encode_varint(buffer, -1),
    }
}

/// A RecordBatch v2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub attributes: i16,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records: Vec<BatchRecord>,
}

/// Input for [`RecordBatch::from_records`].
#[derive(Debug, Clone)]
pub struct OutgoingRecord {
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl RecordBatch {
    /// Build an uncompressed, non-idempotent batch with base offset 0.
    pub fn from_records(records: &[OutgoingRecord]) -> Self {
        let base_timestamp = records.iter().map(|r| r.timestamp).min().unwrap_or(0);
        let max_timestamp = records
            .iter()
            .map(|r| r.timestamp)
            .max()
            .unwrap_or(base_timestamp);

        let records = records
            .iter()
            .enumerate()
            .map(|(i, r)| BatchRecord {
                offset_delta: i as i32,
                timestamp_delta: r.timestamp - base_timestamp,
                key: r.key.clone(),
                value: r.value.clone(),
                headers: r.headers.clone(),
            })
            .collect();

        Self {
            base_offset: 0,
            partition_leader_epoch: -1,
            attributes: 0,
            base_timestamp,
            max_timestamp,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            base_sequence: NO_SEQUENCE,
            records,
        }
    }

    pub fn last_offset_delta(&self) -> i32 {
        self.records
            .last()
            .map(|r| r.offset_delta)
            .unwrap_or_default()
    }

    /// Offset of the last record, or of the batch end for empty batches.
    pub fn last_offset(&self) -> i64 {
        self.base_offset + self.last_offset_delta() as i64
    }

    pub fn compression(&self) -> i16 {
        self.attributes & BATCH_COMPRESSION_MASK
    }

    pub fn is_control(&self) -> bool {
        self.attributes & BATCH_CONTROL_FLAG != 0
    }

    /// Encoded size of the batch in bytes.
    pub fn encoded_size(&self) -> usize {
        MIN_BATCH_HEADER_SIZE
            + self
                .records
                .iter()
                .map(BatchRecord::encoded_size)
                .sum::<usize>()
    }

    /// Serialize with a freshly computed CRC.
    pub fn encode(&self) -> Bytes {
        let size = self.encoded_size();
        let mut buf = BytesMut::with_capacity(size);
        buf.put_i64(self.base_offset);
        buf.put_i32((size - BATCH_LENGTH_PREFIX) as i32);
        buf.put_i32(self.partition_leader_epoch);
        buf.put_i8(RECORD_BATCH_MAGIC);
        buf.put_u32(0); // crc, patched below
        buf.put_i16(self.attributes);
        buf.put_i32(self.last_offset_delta());
        buf.put_i64(self.base_timestamp);
        buf.put_i64(self.max_timestamp);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_i32(self.base_sequence);
        buf.put_i32(self.records.len() as i32);
        for record in &self.records {
            record.encode(&mut buf);
        }

        let crc = crc32c(&buf[BATCH_CRC_DATA_START..]);
        buf[BATCH_CRC_OFFSET..BATCH_CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
        buf.freeze()
    }

    /// Decode one complete batch, verifying magic and CRC.
    pub fn decode(raw: Bytes) -> Result<Self> {
        if raw.len() < MIN_BATCH_HEADER_SIZE {
            return Err(Error::ParsingError(raw));
        }
        let magic = raw[BATCH_MAGIC_OFFSET] as i8;
        if magic != RECORD_BATCH_MAGIC {
            return Err(Error::fatal(format!(
                "unsupported record batch magic {}",
                magic
            )));
        }
        if let CrcValidationResult::Invalid { expected, actual } = validate_batch_crc(&raw) {
            return Err(Error::from_code(
                KafkaCode::CorruptMessage,
                ErrorContext::new().offset(batch_base_offset(&raw)),
            )
            .with_reason(format!(
                "record batch crc mismatch: stored {:#010x}, computed {:#010x}",
                expected, actual
            )));
        }

        let input = NomBytes::new(raw.clone());
        let (_, batch) = parse_record_batch(input).map_err(|_| Error::ParsingError(raw))?;
        if batch.compression() != 0 {
            return Err(Error::Fatal {
                reason: format!("compression codec {} is not supported", batch.compression()),
                context: ErrorContext::new().offset(batch.base_offset),
            });
        }
        Ok(batch)
    }
}

fn batch_base_offset(raw: &[u8]) -> i64 {
    raw.get(BATCH_BASE_OFFSET..BATCH_BASE_OFFSET + 8)
        .and_then(|b| b.try_into().ok())
        .map(i64::from_be_bytes)
        .unwrap_or(-1)
}

fn parse_record_batch(s: NomBytes) -> IResult<NomBytes, RecordBatch> {
    let (s, base_offset) = be_i64(s)?;
    let (s, _batch_length) = be_i32(s)?;
    let (s, partition_leader_epoch) = be_i32(s)?;
    let (s, _magic) = be_i8(s)?;
    let (s, _crc) = be_u32(s)?;
    let (s, attributes) = be_i16(s)?;
    let (s, _last_offset_delta) = be_i32(s)?;
    let (s, base_timestamp) = be_i64(s)?;
    let (s, max_timestamp) = be_i64(s)?;
    let (s, producer_id) = be_i64(s)?;
    let (s, producer_epoch) = be_i16(s)?;
    let (s, base_sequence) = be_i32(s)?;
    let (mut s, count) = be_i32(s)?;

    let mut records = Vec::with_capacity(count.clamp(0, 10_000) as usize);
    // Compressed record sets cannot be walked here; the caller rejects them.
    if attributes & BATCH_COMPRESSION_MASK == 0 {
        for _ in 0..count.max(0) {
            let (rest, record) = parse_batch_record(s)?;
            records.push(record);
            s = rest;
        }
    }

    Ok((
        s,
        RecordBatch {
            base_offset,
            partition_leader_epoch,
            attributes,
            base_timestamp,
            max_timestamp,
            producer_id,
            producer_epoch,
            base_sequence,
            records,
        },
    ))
}

fn parse_nullable_varbytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = parse_varint(s)?;
    if length < 0 {
        return Ok((s, None));
    }
    let (s, data) = take(length as usize)(s)?;
    Ok((s, Some(data.into_bytes())))
}

fn parse_record_header(s: NomBytes) -> IResult<NomBytes, RecordHeader> {
    let (s, key) = parse_nullable_varbytes(s)?;
    let (s, value) = parse_nullable_varbytes(s)?;
    Ok((
        s,
        RecordHeader {
            key: bytes_to_string(&key.unwrap_or_default())?,
            value,
        },
    ))
}

fn parse_batch_record(s: NomBytes) -> IResult<NomBytes, BatchRecord> {
    let (s, _length) = parse_varint(s)?;
    let (s, _attributes) = be_i8(s)?;
    let (s, timestamp_delta) = parse_varlong(s)?;
    let (s, offset_delta) = parse_varint(s)?;
    let (s, key) = parse_nullable_varbytes(s)?;
    let (s, value) = parse_nullable_varbytes(s)?;
    let (mut s, header_count) = parse_varint(s)?;

    let mut headers = Vec::with_capacity(header_count.clamp(0, 64) as usize);
    for _ in 0..header_count.max(0) {
        let (rest, header) = parse_record_header(s)?;
        headers.push(header);
        s = rest;
    }

    Ok((
        s,
        BatchRecord {
            offset_delta,
            timestamp_delta,
            key,
            value,
            headers,
        },
    ))
}

/// Split a fetched record set into batches.
///
/// Brokers may truncate the final batch to honour `max_bytes`; an incomplete
/// trailing batch is dropped and will be fetched again from its offset.
pub fn decode_record_batches(data: &Bytes) -> Result<Vec<RecordBatch>> {
    let mut batches = Vec::new();
    let mut position = 0usize;

    while data.len() - position >= BATCH_LENGTH_PREFIX {
        let length_bytes = &data[position + BATCH_LENGTH_OFFSET..position + BATCH_LENGTH_PREFIX];
        let batch_length = i32::from_be_bytes([
            length_bytes[0],
            length_bytes[1],
            length_bytes[2],
            length_bytes[3],
        ]);
        if batch_length < 0 {
            return Err(Error::ParsingError(data.slice(position..)));
        }
        let total = BATCH_LENGTH_PREFIX + batch_length as usize;
        if data.len() - position < total {
            break;
        }
        batches.push(RecordBatch::decode(data.slice(position..position + total))?);
        position += total;
    }

    Ok(batches)
}
