//! Columnar chunk sources and chunk-to-reading conversion

use super::reading::{parse_timestamp, RawReading};
use crate::error::{Result, TelemetryError};
use crate::schema::{
    ResolvedSchema, StorageType, ALTITUDE_COLUMN, LATITUDE_COLUMN, LOCO_ID_COLUMN, LONGITUDE_COLUMN,
    TIMESTAMP_COLUMN,
};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Supplier of input chunks, each at most `chunk_size` rows
pub trait ChunkSource: Send {
    /// Next chunk, `None` once the input is exhausted
    fn next_chunk(&mut self) -> Result<Option<DataFrame>>;
}

/// In-memory frames, re-sliced to the configured chunk size
pub struct FrameSource {
    frames: VecDeque<DataFrame>,
    chunk_size: usize,
    offset: usize,
}

impl FrameSource {
    pub fn new(frames: Vec<DataFrame>, chunk_size: usize) -> Self {
        Self {
            frames: frames.into(),
            chunk_size: chunk_size.max(1),
            offset: 0,
        }
    }
}

impl ChunkSource for FrameSource {
    fn next_chunk(&mut self) -> Result<Option<DataFrame>> {
        while let Some(front) = self.frames.front() {
            if self.offset >= front.height() {
                self.frames.pop_front();
                self.offset = 0;
                continue;
            }
            let chunk = front.slice(self.offset as i64, self.chunk_size);
            self.offset += chunk.height();
            return Ok(Some(chunk));
        }
        Ok(None)
    }
}

/// Parquet file(s) read lazily, one slice at a time
pub struct ParquetChunkSource {
    files: VecDeque<PathBuf>,
    chunk_size: usize,
    offset: usize,
}

impl ParquetChunkSource {
    /// A single file, or every `*.parquet` file of a directory in name order
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().map_or(false, |ext| ext == "parquet"))
                .collect();
            files.sort();
            files
        } else if path.exists() {
            vec![path.to_path_buf()]
        } else {
            return Err(TelemetryError::DataError(format!(
                "input path does not exist: {}",
                path.display()
            )));
        };

        debug!(files = files.len(), chunk_size, "Opened parquet input");
        Ok(Self {
            files: files.into(),
            chunk_size: chunk_size.max(1),
            offset: 0,
        })
    }
}

impl ChunkSource for ParquetChunkSource {
    fn next_chunk(&mut self) -> Result<Option<DataFrame>> {
        while let Some(path) = self.files.front() {
            let chunk = LazyFrame::scan_parquet(path, ScanArgsParquet::default())?
                .slice(self.offset as i64, self.chunk_size as IdxSize)
                .collect()?;

            if chunk.height() == 0 {
                self.files.pop_front();
                self.offset = 0;
                continue;
            }
            self.offset += chunk.height();
            return Ok(Some(chunk));
        }
        Ok(None)
    }
}

/// Row that could not be turned into a reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRow {
    /// Row index within the whole input
    pub row: usize,
    pub reason: String,
}

/// Readings decoded from one chunk
#[derive(Debug, Default)]
pub struct DecodedChunk {
    pub readings: Vec<RawReading>,
    pub malformed: Vec<MalformedRow>,
}

fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Boolean
    )
}

/// Numeric input column with its declared storage type
struct SensorColumn {
    name: Arc<str>,
    storage: Option<StorageType>,
    values: Vec<Option<f64>>,
}

impl SensorColumn {
    /// Value at `row`, rounded to the storage precision; untyped columns only
    /// drop non-finite values
    fn value(&self, row: usize) -> Option<f64> {
        let v = self.values[row]?;
        match self.storage {
            Some(storage) => storage.quantize(v),
            None => v.is_finite().then_some(v),
        }
    }
}

fn float_column(df: &DataFrame, name: &str) -> Result<Option<Vec<Option<f64>>>> {
    let Ok(column) = df.column(name) else {
        return Ok(None);
    };
    let values = column
        .cast(&DataType::Float64)?
        .f64()?
        .into_iter()
        .collect();
    Ok(Some(values))
}

fn timestamp_column(df: &DataFrame) -> Result<Option<Vec<Option<DateTime<Utc>>>>> {
    let Ok(column) = df.column(TIMESTAMP_COLUMN) else {
        return Ok(None);
    };
    let values = match column.dtype() {
        DataType::Datetime(_, _) | DataType::Date => column
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .map(|ms| ms.and_then(DateTime::<Utc>::from_timestamp_millis))
            .collect(),
        _ => column
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|raw| raw.and_then(parse_timestamp))
            .collect(),
    };
    Ok(Some(values))
}

/// Decode a chunk into readings.
///
/// Rows without a locomotive id or a parseable timestamp are reported in
/// [`DecodedChunk::malformed`] and skipped. Sensor values are rounded to the
/// storage precision declared in the schema; numeric columns the schema does
/// not know are carried through untouched.
pub fn decode_chunk(df: &DataFrame, schema: &ResolvedSchema, row_offset: usize) -> Result<DecodedChunk> {
    let n_rows = df.height();
    let mut decoded = DecodedChunk::default();

    let loco_ids: Option<Vec<Option<i32>>> = match df.column(LOCO_ID_COLUMN) {
        Ok(column) => Some(column.cast(&DataType::Int32)?.i32()?.into_iter().collect()),
        Err(_) => None,
    };
    let timestamps = timestamp_column(df)?;

    let (Some(loco_ids), Some(timestamps)) = (loco_ids, timestamps) else {
        warn!(
            rows = n_rows,
            "Chunk lacks '{}' or '{}' column, every row dropped", LOCO_ID_COLUMN, TIMESTAMP_COLUMN
        );
        decoded.malformed = (0..n_rows)
            .map(|i| MalformedRow {
                row: row_offset + i,
                reason: "missing identifier or timestamp column".to_string(),
            })
            .collect();
        return Ok(decoded);
    };

    let latitude = float_column(df, LATITUDE_COLUMN)?;
    let longitude = float_column(df, LONGITUDE_COLUMN)?;
    let altitude = float_column(df, ALTITUDE_COLUMN)?;

    let reserved = [
        LOCO_ID_COLUMN,
        TIMESTAMP_COLUMN,
        LATITUDE_COLUMN,
        LONGITUDE_COLUMN,
        ALTITUDE_COLUMN,
    ];
    // Column names are allocated once per chunk and shared by every reading
    let mut sensor_columns: Vec<SensorColumn> = Vec::new();
    for column in df.get_columns() {
        let name = column.name().as_str();
        if reserved.contains(&name) || !is_numeric_dtype(column.dtype()) {
            continue;
        }
        let values: Vec<Option<f64>> = column.cast(&DataType::Float64)?.f64()?.into_iter().collect();
        sensor_columns.push(SensorColumn {
            name: Arc::from(name),
            storage: schema.registry.storage(name),
            values,
        });
    }

    decoded.readings.reserve(n_rows);
    for i in 0..n_rows {
        let Some(locomotive_id) = loco_ids[i] else {
            decoded.malformed.push(MalformedRow {
                row: row_offset + i,
                reason: "missing locomotive id".to_string(),
            });
            continue;
        };
        let Some(timestamp) = timestamps[i] else {
            decoded.malformed.push(MalformedRow {
                row: row_offset + i,
                reason: "unparseable timestamp".to_string(),
            });
            continue;
        };

        let gps = |col: &Option<Vec<Option<f64>>>, column: &str| {
            col.as_ref()
                .and_then(|values| values[i])
                .and_then(|v| schema.quantize(column, v))
        };

        let mut values = BTreeMap::new();
        for column in &sensor_columns {
            values.insert(Arc::clone(&column.name), column.value(i));
        }

        decoded.readings.push(RawReading {
            locomotive_id,
            timestamp,
            latitude: gps(&latitude, LATITUDE_COLUMN),
            longitude: gps(&longitude, LONGITUDE_COLUMN),
            altitude: gps(&altitude, ALTITUDE_COLUMN),
            values,
        });
    }

    Ok(decoded)
}
