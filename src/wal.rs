use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::model::Event;

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame codec: `[u32 LE: len][bincode: Event][u32 LE: crc32 of payload]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalCodec;

impl Encoder<&Event> for WalCodec {
    type Error = io::Error;

    fn encode(&mut self, event: &Event, dst: &mut BytesMut) -> io::Result<()> {
        let payload =
            bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        dst.reserve(payload.len() + 8);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u32_le(crc32fast::hash(&payload));
        Ok(())
    }
}

impl Decoder for WalCodec {
    type Item = Event;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Event>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = (&src[..4]).get_u32_le() as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
        }
        if src.len() < len + 8 {
            return Ok(None);
        }
        src.advance(4);
        let payload = src.split_to(len);
        let stored_crc = src.get_u32_le();
        if crc32fast::hash(&payload) != stored_crc {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "crc mismatch"));
        }
        bincode::deserialize(&payload)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Append-only write-ahead log of engine events.
///
/// Appends are staged in memory and made durable by [`Wal::flush_sync`], so a
/// caller can commit a whole batch with one fsync. A torn or corrupt tail left by
/// a crash is dropped on replay.
pub struct Wal {
    file: File,
    path: PathBuf,
    pending: BytesMut,
    codec: WalCodec,
    pending_events: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: BytesMut::new(),
            codec: WalCodec,
            pending_events: 0,
            appends_since_compact: 0,
        })
    }

    /// Stage an event without writing it. Call `flush_sync()` to commit.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.codec.encode(event, &mut self.pending)?;
        self.pending_events += 1;
        Ok(())
    }

    /// Drop everything staged since the last flush.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_events = 0;
    }

    /// Write all staged events and fsync. The batch is all-or-nothing: on error
    /// the file is cut back to its previous length and the staged bytes are dropped.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        let staged = self.pending.split();
        let events = std::mem::take(&mut self.pending_events);
        let committed_len = self.file.metadata()?.len();

        let written = self
            .file
            .write_all(&staged)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            if let Err(cut) = self.file.set_len(committed_len) {
                tracing::error!(
                    "WAL {}: cannot truncate failed batch: {cut}",
                    self.path.display()
                );
            }
            return Err(e);
        }
        self.appends_since_compact += events;
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write compacted events to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut buf = BytesMut::new();
        let mut codec = WalCodec;
        for event in events {
            codec.encode(event, &mut buf)?;
        }
        let mut file = File::create(path.with_extension("wal.tmp"))?;
        file.write_all(&buf)?;
        file.sync_all()
    }

    /// Atomically replace the log with the compacted temp file and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.discard_pending();
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact event from the log at `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut buf = BytesMut::from(&raw[..]);
        let mut codec = WalCodec;
        let mut events = Vec::new();
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("WAL {}: stopping replay at corrupt frame: {e}", path.display());
                    break;
                }
            }
        }
        if !buf.is_empty() {
            tracing::warn!(
                "WAL {}: discarded {} trailing bytes",
                path.display(),
                buf.len()
            );
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    use crate::model::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(name: &str) -> Event {
        Event::ResourceCreated {
            id: Ulid::new(),
            name: name.into(),
            kind: ResourceKind::Equipment,
            active: true,
            metadata: Metadata::new(),
            at: 0,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![created("a"), created("b"), Event::ResourceDeleted { id: Ulid::new() }];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 3);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn truncated_tail_is_discarded() {
        let path = tmp_path("truncated.wal");
        let first = created("kept");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&created("torn")).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let path = tmp_path("corrupt.wal");
        let first = created("good");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&created("bad")).unwrap();
            wal.append(&created("after")).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let first_len = 8 + bincode::serialize(&first).unwrap().len();
        bytes[first_len + 5] ^= 0xFF; // flip a payload byte of the second frame
        fs::write(&path, &bytes).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn buffered_appends_invisible_until_flush() {
        let path = tmp_path("buffered.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&created("x")).unwrap();
        assert!(Wal::replay(&path).unwrap().is_empty());
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn discarded_batch_never_reaches_the_log() {
        let path = tmp_path("discarded.wal");
        let kept = created("kept");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();

        wal.append_buffered(&created("half")).unwrap();
        wal.append_buffered(&created("batch")).unwrap();
        wal.discard_pending();
        wal.flush_sync().unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
        assert_eq!(wal.appends_since_compact(), 1);
    }

    #[test]
    fn compaction_replaces_log() {
        let path = tmp_path("compact.wal");
        let mut wal = Wal::open(&path).unwrap();
        for i in 0..5 {
            wal.append(&created(&format!("r{i}"))).unwrap();
        }
        let survivor = created("survivor");
        Wal::write_compact_file(wal.path(), std::slice::from_ref(&survivor)).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let later = Event::ResourceDeleted { id: Ulid::new() };
        wal.append(&later).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![survivor, later]);
    }
}
