//! Length-delimited record streams and the cyclic row interval
//!
//! Every on-disk stream in the system is a sequence of records framed as a
//! `u32` little-endian payload length followed by a bincode payload: rows,
//! assignments, the model, per-kind groups, predict queries/results, and
//! posterior-enumeration samples.
//!
//! The row file is additionally read *cyclically*: reaching EOF seamlessly
//! rewinds to offset 0, so a reader yields the finite file as an infinite
//! stream. [`StreamInterval`] holds two independent cyclic cursors over the
//! same file: `unassigned` feeds rows to add, `assigned` re-reads the
//! payloads of rows being removed, in file order. The file itself is never
//! rewritten.

#![allow(missing_docs)]

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::assignments::Assignments;
use crate::schema::{Observed, ProductValue};

// ============================================================================
// Record types
// ============================================================================

/// One row of the input stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: u64,
    pub value: ProductValue,
}

/// One row's per-kind group assignment, in canonical sorted group order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub rowid: u64,
    pub groupids: Vec<u32>,
}

/// A prediction request: condition on `data`, sample the `to_predict` mask.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PredictQuery {
    pub id: u64,
    pub data: ProductValue,
    pub to_predict: Observed,
    pub sample_count: u32,
}

/// A prediction response: samples, or a per-query error.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PredictResult {
    pub id: u64,
    pub samples: Vec<ProductValue>,
    pub error: Option<String>,
}

/// A scoring request: the total log-score of a row under the current state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoreQuery {
    pub id: u64,
    pub data: ProductValue,
}

/// A scoring response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScoreResult {
    pub id: u64,
    pub score: Option<f64>,
    pub error: Option<String>,
}

/// One posterior-enumeration sample: the latent block structure plus the
/// joint score of the snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PosteriorSample {
    pub kinds: Vec<PosteriorKind>,
    pub score: f64,
}

/// One kind's slice of a posterior sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PosteriorKind {
    pub featureids: Vec<u32>,
    /// Row ids per group; group order is arbitrary within a sample.
    pub groups: Vec<Vec<u64>>,
}

// ============================================================================
// Framing
// ============================================================================

/// Errors from the record codec and row streams.
#[derive(Debug, thiserror::Error)]
pub enum RowIoError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("record codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("truncated record (read {got} of {want} payload bytes)")]
    Truncated { got: usize, want: usize },
    #[error("row stream is empty")]
    EmptyStream,
    #[error("rowid {0} not found in the row stream")]
    MissingRow(u64),
}

/// Writes length-delimited bincode records.
pub struct RecordWriter<W: Write> {
    inner: BufWriter<W>,
}

impl RecordWriter<File> {
    /// Create (truncate) a record stream at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, RowIoError> {
        Ok(RecordWriter {
            inner: BufWriter::new(File::create(path)?),
        })
    }
}

impl<W: Write> RecordWriter<W> {
    /// Wrap an arbitrary writer.
    pub fn new(inner: W) -> Self {
        RecordWriter {
            inner: BufWriter::new(inner),
        }
    }

    /// Append one record.
    pub fn write_record<T: Serialize>(&mut self, record: &T) -> Result<(), RowIoError> {
        let payload = bincode::serialize(record)?;
        self.inner.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.inner.write_all(&payload)?;
        Ok(())
    }

    /// Flush buffered records to the underlying writer.
    pub fn flush(&mut self) -> Result<(), RowIoError> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Reads length-delimited bincode records.
pub struct RecordReader<R: Read> {
    inner: BufReader<R>,
}

impl RecordReader<File> {
    /// Open a record stream at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RowIoError> {
        Ok(RecordReader {
            inner: BufReader::new(File::open(path)?),
        })
    }
}

impl<R: Read> RecordReader<R> {
    /// Wrap an arbitrary reader.
    pub fn new(inner: R) -> Self {
        RecordReader {
            inner: BufReader::new(inner),
        }
    }

    /// Read the next record; `None` on a clean end of stream.
    pub fn read_record<T: DeserializeOwned>(&mut self) -> Result<Option<T>, RowIoError> {
        let len = match self.inner.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut payload = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let n = self.inner.read(&mut payload[got..])?;
            if n == 0 {
                return Err(RowIoError::Truncated { got, want: len });
            }
            got += n;
        }
        Ok(Some(bincode::deserialize(&payload)?))
    }
}

/// Write a whole record stream to `path`.
pub fn write_records<T: Serialize, P: AsRef<Path>>(
    path: P,
    records: &[T],
) -> Result<(), RowIoError> {
    let mut writer = RecordWriter::create(path)?;
    for record in records {
        writer.write_record(record)?;
    }
    writer.flush()
}

/// Load a whole record stream from `path`.
pub fn read_records<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Vec<T>, RowIoError> {
    let mut reader = RecordReader::open(path)?;
    let mut records = Vec::new();
    while let Some(record) = reader.read_record()? {
        records.push(record);
    }
    Ok(records)
}

// ============================================================================
// Cyclic row reader
// ============================================================================

/// A row-stream reader that wraps EOF back to offset 0.
pub struct CyclicRowReader {
    inner: RecordReader<File>,
    wraps: usize,
}

impl CyclicRowReader {
    /// Open `path` for cyclic reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RowIoError> {
        Ok(CyclicRowReader {
            inner: RecordReader::open(path)?,
            wraps: 0,
        })
    }

    /// Read the next row without wrapping; `None` at EOF.
    pub fn try_read(&mut self) -> Result<Option<RowRecord>, RowIoError> {
        self.inner.read_record()
    }

    /// Read the next row, rewinding at EOF. Errors on an empty file.
    pub fn cyclic_read(&mut self) -> Result<RowRecord, RowIoError> {
        if let Some(row) = self.inner.read_record()? {
            return Ok(row);
        }
        self.inner.inner.rewind()?;
        self.wraps += 1;
        match self.inner.read_record()? {
            Some(row) => Ok(row),
            None => Err(RowIoError::EmptyStream),
        }
    }

    /// How many times this reader has wrapped past EOF.
    #[inline]
    pub fn wraps(&self) -> usize {
        self.wraps
    }
}

// ============================================================================
// Stream interval
// ============================================================================

/// Two cyclic cursors over one row file: the next row to add and the next
/// row to remove.
pub struct StreamInterval {
    unassigned: CyclicRowReader,
    assigned: CyclicRowReader,
    pending_assigned: Option<RowRecord>,
}

impl StreamInterval {
    /// Open the interval, fast-forwarding both cursors past any preloaded
    /// assignments: `unassigned` to just after the last assigned row,
    /// `assigned` to the first assigned row (which becomes the next remove).
    pub fn open<P: AsRef<Path>>(path: P, assignments: &Assignments) -> Result<Self, RowIoError> {
        let mut unassigned = CyclicRowReader::open(&path)?;
        let mut assigned = CyclicRowReader::open(&path)?;
        let mut pending_assigned = None;

        if assignments.row_count() > 0 {
            let last = *assignments.rowids().back().expect("nonempty");
            seek_past(&mut unassigned, last)?;
            let first = *assignments.rowids().front().expect("nonempty");
            pending_assigned = Some(seek_past(&mut assigned, first)?);
        }

        Ok(StreamInterval {
            unassigned,
            assigned,
            pending_assigned,
        })
    }

    /// Next row to add.
    pub fn read_unassigned(&mut self) -> Result<RowRecord, RowIoError> {
        self.unassigned.cyclic_read()
    }

    /// Next row to remove (payload for subtracting sufficient statistics).
    pub fn read_assigned(&mut self) -> Result<RowRecord, RowIoError> {
        if let Some(row) = self.pending_assigned.take() {
            return Ok(row);
        }
        self.assigned.cyclic_read()
    }
}

/// Advance `reader` until it has just yielded the row with id `target`;
/// returns that row. Errors if the id never appears within two cycles.
fn seek_past(reader: &mut CyclicRowReader, target: u64) -> Result<RowRecord, RowIoError> {
    let start_wraps = reader.wraps();
    loop {
        let row = reader.cyclic_read()?;
        if row.id == target {
            return Ok(row);
        }
        if reader.wraps() > start_wraps + 1 {
            return Err(RowIoError::MissingRow(target));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Sparsity;
    use tempfile::tempdir;

    fn row(id: u64) -> RowRecord {
        RowRecord {
            id,
            value: ProductValue {
                observed: Observed::empty(Sparsity::All),
                booleans: vec![id % 2 == 0],
                counts: vec![],
                reals: vec![],
            },
        }
    }

    #[test]
    fn records_round_trip_through_a_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        let rows: Vec<RowRecord> = (0..5).map(row).collect();
        write_records(&path, &rows).unwrap();
        let loaded: Vec<RowRecord> = read_records(&path).unwrap();
        assert_eq!(loaded, rows);
    }

    #[test]
    fn truncated_payload_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        write_records(&path, &[row(1)]).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 1).unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let got: Result<Option<RowRecord>, _> = reader.read_record();
        assert!(matches!(got, Err(RowIoError::Truncated { .. })));
    }

    #[test]
    fn cyclic_reader_wraps_seamlessly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        write_records(&path, &[row(1), row(2), row(3)]).unwrap();

        let mut reader = CyclicRowReader::open(&path).unwrap();
        let ids: Vec<u64> = (0..7).map(|_| reader.cyclic_read().unwrap().id).collect();
        assert_eq!(ids, vec![1, 2, 3, 1, 2, 3, 1]);
        assert_eq!(reader.wraps(), 2);
    }

    #[test]
    fn cyclic_reader_rejects_an_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        std::fs::write(&path, b"").unwrap();
        let mut reader = CyclicRowReader::open(&path).unwrap();
        assert!(matches!(reader.cyclic_read(), Err(RowIoError::EmptyStream)));
    }

    #[test]
    fn stream_interval_fast_forwards_to_preloaded_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        write_records(&path, &[row(1), row(2), row(3), row(4)]).unwrap();

        // Rows 2 and 3 preloaded, in that order.
        let mut assignments = Assignments::init(1);
        assignments.append_row(2, &[0]);
        assignments.append_row(3, &[0]);

        let mut interval = StreamInterval::open(&path, &assignments).unwrap();
        // Next remove is the oldest assigned row; next add follows the
        // newest assigned row.
        assert_eq!(interval.read_assigned().unwrap().id, 2);
        assert_eq!(interval.read_unassigned().unwrap().id, 4);
        assert_eq!(interval.read_assigned().unwrap().id, 3);
        assert_eq!(interval.read_unassigned().unwrap().id, 1);
    }

    #[test]
    fn stream_interval_reports_missing_preloaded_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        write_records(&path, &[row(1), row(2)]).unwrap();

        let mut assignments = Assignments::init(1);
        assignments.append_row(9, &[0]);
        assert!(matches!(
            StreamInterval::open(&path, &assignments),
            Err(RowIoError::MissingRow(9))
        ));
    }
}
