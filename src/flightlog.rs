//! Flight log recording and replay
//!
//! File layout (integers little-endian):
//!
//! ```text
//! "MFL" 0x01
//! u32 stats length, FlightStats JSON (space padded to STATS_BLOCK_LEN)
//! u32 snapshot length, StateSnapshot JSON
//! repeated: u32 ms since start, u16 chunk length, raw inbound bytes
//! ```
//!
//! The stats block has a fixed size so it can be rewritten in place when the
//! recording ends.

use crate::error::{LinkError, Result};
use crate::state::{sensor, StateSnapshot, VehicleState};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

/// File magic and format version
pub const MAGIC: [u8; 4] = *b"MFL\x01";

/// Reserved size of the stats block
pub const STATS_BLOCK_LEN: usize = 512;

/// Largest chunk a single record can hold
const MAX_CHUNK_LEN: usize = u16::MAX as usize;

/// Summary of a recorded flight
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightStats {
    /// RFC 3339 time the aircraft was first seen armed
    pub armed_at: Option<String>,
    /// Seconds spent armed while recording
    pub flight_time: f64,
    /// Meters
    pub max_distance_to_home: f64,
    /// km/h
    pub max_speed: f64,
    /// Meters. Barometer when present, GPS otherwise
    pub max_altitude: f64,
    pub max_amps: f64,
    pub mah_used: f64,
}

impl FlightStats {
    /// Fill the maxima from the current state
    pub fn collect(&mut self, state: &VehicleState) {
        let has_baro = state.status.read().has_sensor(sensor::BARO);
        {
            let gps = state.gps.read();
            self.max_distance_to_home = gps.max_distance_to_home as f64;
            self.max_speed = gps.max_speed;
            self.max_altitude = if has_baro {
                state.altitude.read().max_altitude
            } else {
                gps.max_altitude as f64
            };
        }
        let battery = state.battery.read();
        self.max_amps = battery.max_amperage;
        self.mah_used = battery.mah_drawn as f64;
    }

    fn to_block(&self) -> Result<Vec<u8>> {
        let mut block = serde_json::to_vec(self).map_err(|e| LinkError::FlightLogFormat {
            reason: e.to_string(),
        })?;
        if block.len() > STATS_BLOCK_LEN {
            return Err(LinkError::FlightLogFormat {
                reason: format!("stats block is {} bytes", block.len()),
            });
        }
        block.resize(STATS_BLOCK_LEN, b' ');
        Ok(block)
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> LinkError + '_ {
    move |source| LinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Records inbound bytes
pub struct FlightLogWriter<W: Write + Seek = File> {
    out: BufWriter<W>,
    path: PathBuf,
    started: Instant,
    stats: FlightStats,
    last_chunk: Instant,
}

impl FlightLogWriter<File> {
    /// Create `path` and write the header
    pub fn create(path: impl AsRef<Path>, state: &VehicleState) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(io_error(path))?;
        let writer = Self::new(file, path, state)?;
        info!("Recording flight log to {}", path.display());
        Ok(writer)
    }
}

impl<W: Write + Seek> FlightLogWriter<W> {
    pub fn new(inner: W, path: impl Into<PathBuf>, state: &VehicleState) -> Result<Self> {
        let path = path.into();
        let mut out = BufWriter::new(inner);
        let stats = FlightStats::default();

        let snapshot =
            serde_json::to_vec(&state.snapshot()).map_err(|e| LinkError::FlightLogFormat {
                reason: e.to_string(),
            })?;
        let header = (|| -> io::Result<()> {
            out.write_all(&MAGIC)?;
            out.write_all(&(STATS_BLOCK_LEN as u32).to_le_bytes())?;
            out.write_all(&stats.to_block().map_err(io::Error::other)?)?;
            out.write_all(&(snapshot.len() as u32).to_le_bytes())?;
            out.write_all(&snapshot)
        })();
        header.map_err(io_error(&path))?;

        let now = Instant::now();
        Ok(Self {
            out,
            path,
            started: now,
            stats,
            last_chunk: now,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one chunk of inbound bytes
    ///
    /// `armed` is the arming state when the chunk arrived; it drives the
    /// recorded flight time.
    pub fn write_chunk(&mut self, data: &[u8], armed: bool) -> Result<()> {
        let now = Instant::now();
        if armed {
            if self.stats.armed_at.is_none() {
                self.stats.armed_at = Some(chrono::Local::now().to_rfc3339());
            } else {
                self.stats.flight_time += now.duration_since(self.last_chunk).as_secs_f64();
            }
        }
        self.last_chunk = now;

        let ms = now.duration_since(self.started).as_millis().min(u32::MAX as u128) as u32;
        for piece in data.chunks(MAX_CHUNK_LEN) {
            let record = (|| -> io::Result<()> {
                self.out.write_all(&ms.to_le_bytes())?;
                self.out.write_all(&(piece.len() as u16).to_le_bytes())?;
                self.out.write_all(piece)
            })();
            record.map_err(io_error(&self.path))?;
        }
        Ok(())
    }

    /// Rewrite the stats block and flush
    pub fn finish(mut self, state: &VehicleState) -> Result<FlightStats> {
        self.stats.collect(state);
        let block = self.stats.to_block()?;
        let path = self.path.clone();

        let mut inner = self
            .out
            .into_inner()
            .map_err(|e| io_error(&path)(e.into_error()))?;
        let rewrite = (|| -> io::Result<()> {
            inner.seek(SeekFrom::Start((MAGIC.len() + 4) as u64))?;
            inner.write_all(&block)?;
            inner.seek(SeekFrom::End(0))?;
            inner.flush()
        })();
        rewrite.map_err(io_error(&path))?;

        info!(
            "Flight log closed: {:.0} s armed, max altitude {:.1} m",
            self.stats.flight_time, self.stats.max_altitude
        );
        Ok(self.stats)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// One recorded chunk
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Time since the start of the recording
    pub offset: Duration,
    pub data: Bytes,
}

/// Reads a flight log back
#[derive(Debug)]
pub struct FlightLogReader<R: Read = BufReader<File>> {
    input: R,
    path: PathBuf,
    pub stats: FlightStats,
    pub snapshot: StateSnapshot,
}

impl FlightLogReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(io_error(path))?;
        Self::new(BufReader::new(file), path)
    }
}

impl<R: Read> FlightLogReader<R> {
    /// Validate the header and read the stats and snapshot blocks
    pub fn new(mut input: R, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let mut magic = [0u8; 4];
        input.read_exact(&mut magic).map_err(io_error(&path))?;
        if magic != MAGIC {
            return Err(LinkError::FlightLogHeader { path });
        }

        let stats_block = read_block(&mut input, &path)?;
        let stats: FlightStats =
            serde_json::from_slice(&stats_block).map_err(|e| LinkError::FlightLogFormat {
                reason: format!("stats: {}", e),
            })?;
        let snapshot_block = read_block(&mut input, &path)?;
        let snapshot: StateSnapshot =
            serde_json::from_slice(&snapshot_block).map_err(|e| LinkError::FlightLogFormat {
                reason: format!("snapshot: {}", e),
            })?;

        Ok(Self {
            input,
            path,
            stats,
            snapshot,
        })
    }

    /// Next chunk, or `None` at the end of the recording
    ///
    /// A record cut short (recording interrupted mid-write) ends the log.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let mut head = [0u8; 6];
        match self.input.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(io_error(&self.path)(e)),
        }
        let ms = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let len = u16::from_le_bytes([head[4], head[5]]) as usize;

        let mut data = vec![0u8; len];
        match self.input.read_exact(&mut data) {
            Ok(()) => Ok(Some(Chunk {
                offset: Duration::from_millis(ms as u64),
                data: Bytes::from(data),
            })),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(io_error(&self.path)(e)),
        }
    }
}

impl<R: Read> Iterator for FlightLogReader<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

/// Length-prefixed block; the declared length is only trusted as far as
/// the input actually goes
fn read_block<R: Read>(input: &mut R, path: &Path) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    input.read_exact(&mut len).map_err(io_error(path))?;
    let len = u32::from_le_bytes(len) as u64;
    let mut block = Vec::new();
    input
        .by_ref()
        .take(len)
        .read_to_end(&mut block)
        .map_err(io_error(path))?;
    if (block.len() as u64) < len {
        return Err(LinkError::FlightLogFormat {
            reason: format!("block declares {} bytes, {} present", len, block.len()),
        });
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GpsFix;
    use std::io::Cursor;

    fn recorded(state: &VehicleState, chunks: &[&[u8]]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = FlightLogWriter::new(&mut cursor, "mem.mfl", state).unwrap();
            assert_eq!(writer.path(), Path::new("mem.mfl"));
            for chunk in chunks {
                writer.write_chunk(chunk, false).unwrap();
            }
            writer.finish(state).unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_header_layout() {
        let state = VehicleState::new();
        let bytes = recorded(&state, &[]);
        assert_eq!(&bytes[..4], b"MFL\x01");
        assert_eq!(&bytes[4..8], &(STATS_BLOCK_LEN as u32).to_le_bytes());
    }

    #[test]
    fn test_chunks_read_back() {
        let state = VehicleState::new();
        state.identity.write().fc_variant = "INAV".into();
        let bytes = recorded(&state, &[b"$M>", &[0, 101, 101]]);

        let mut reader = FlightLogReader::new(Cursor::new(bytes), "mem.mfl").unwrap();
        assert_eq!(reader.snapshot.identity.fc_variant, "INAV");

        let chunks: Vec<Chunk> = reader.by_ref().map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, Bytes::from_static(b"$M>"));
        assert_eq!(chunks[1].data, Bytes::from_static(&[0, 101, 101]));
        assert!(chunks[0].offset <= chunks[1].offset);
    }

    #[test]
    fn test_stats_rewritten_on_finish() {
        let state = VehicleState::new();
        state.gps.write().apply_fix(GpsFix {
            fix: true,
            num_sats: 8,
            latitude: 1.0,
            longitude: 1.0,
            altitude: 87,
            speed: 54.0,
            heading: 0.0,
        });
        state.battery.write().mah_drawn = 420;
        let bytes = recorded(&state, &[b"x"]);

        let reader = FlightLogReader::new(Cursor::new(bytes), "mem.mfl").unwrap();
        assert_eq!(reader.stats.max_altitude, 87.0);
        assert_eq!(reader.stats.max_speed, 54.0);
        assert_eq!(reader.stats.mah_used, 420.0);
    }

    #[test]
    fn test_baro_altitude_preferred() {
        let state = VehicleState::new();
        state.status.write().active_sensors = sensor::BARO;
        state.altitude.write().update(33.5, 0.0);
        let mut stats = FlightStats::default();
        stats.collect(&state);
        assert_eq!(stats.max_altitude, 33.5);
    }

    #[test]
    fn test_bad_magic() {
        let err = FlightLogReader::new(Cursor::new(b"NOPE....".to_vec()), "x.mfl")
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::FlightLogHeader { .. }));
    }

    #[test]
    fn test_truncated_chunk_ends_log() {
        let state = VehicleState::new();
        let mut bytes = recorded(&state, &[b"abcdef"]);
        bytes.truncate(bytes.len() - 2);
        let mut reader = FlightLogReader::new(Cursor::new(bytes), "mem.mfl").unwrap();
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_oversized_block_length_rejected() {
        let mut bytes = b"MFL\x01".to_vec();
        bytes.extend(u32::MAX.to_le_bytes());
        bytes.extend(b"{}");
        let err = FlightLogReader::new(Cursor::new(bytes), "huge.mfl").unwrap_err();
        assert!(matches!(err, LinkError::FlightLogFormat { .. }));
    }
}
