use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Bytes of framing around each payload: length prefix + CRC trailer.
const FRAME_OVERHEAD: usize = 8;

/// Refuse to allocate for a length prefix beyond this; it can only be garbage.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<usize> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() + FRAME_OVERHEAD)
}

/// Result of reading a log back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Bytes after the last intact record (torn write or corruption).
    pub discarded_bytes: u64,
}

/// Append-only write-ahead log of stock and reservation events.
///
/// Record layout: `[u32 le: len][bincode Event][u32 le: crc32(payload)]`.
/// A torn final record fails its length or CRC check and is dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    bytes_written: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let bytes_written = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            bytes_written,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let written = encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        self.bytes_written += written as u64;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write a compacted log next to `path`. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp = self.path.with_extension("wal.tmp");
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.bytes_written = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        let mut consumed: u64 = 0;

        while let Some(event) = read_record(&mut reader)? {
            match event {
                Record::Intact(event, len) => {
                    replay.events.push(event);
                    consumed += len as u64;
                }
                Record::Damaged => break,
            }
        }

        replay.discarded_bytes = total_len.saturating_sub(consumed);
        if replay.discarded_bytes > 0 {
            warn!(
                "WAL {}: discarded {} trailing bytes after {} records",
                path.display(),
                replay.discarded_bytes,
                replay.events.len()
            );
        }
        Ok(replay)
    }
}

enum Record {
    Intact(Event, usize),
    Damaged,
}

/// `Ok(None)` at a clean end of file.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Record>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf)? {
        Fill::Empty => return Ok(None),
        Fill::Partial => return Ok(Some(Record::Damaged)),
        Fill::Full => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Some(Record::Damaged));
    }

    let mut payload = vec![0u8; len];
    if !matches!(read_exact_or_eof(reader, &mut payload)?, Fill::Full) {
        return Ok(Some(Record::Damaged));
    }
    let mut crc_buf = [0u8; 4];
    if !matches!(read_exact_or_eof(reader, &mut crc_buf)?, Fill::Full) {
        return Ok(Some(Record::Damaged));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Some(Record::Damaged));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some(Record::Intact(event, len + FRAME_OVERHEAD))),
        Err(_) => Ok(Some(Record::Damaged)),
    }
}

enum Fill {
    Empty,
    Partial,
    Full,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 if !buf.is_empty() => Fill::Empty,
        n if n == buf.len() => Fill::Full,
        _ => Fill::Partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stockhold_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(id: Ulid, stock_total: u32) -> Event {
        Event::ProductCreated {
            id,
            name: Some("Widget".into()),
            unit_price: 1999,
            stock_total,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let pid = Ulid::new();
        let events = vec![
            created(pid, 10),
            Event::StockAdjusted { id: pid, stock_total: 12 },
            Event::CartItemSet {
                user_id: Ulid::new(),
                product_id: pid,
                quantity: 2,
                unit_price: 1999,
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert_eq!(replay.discarded_bytes, 0);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = created(Ulid::new(), 3);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![event]);
        assert_eq!(replay.discarded_bytes, 6);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = created(Ulid::new(), 1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&Event::ProductDeleted { id: Ulid::new() }).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![good]);
        assert!(replay.discarded_bytes > 0);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        let pid = Ulid::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(pid, 5)).unwrap();
            for total in 6..40 {
                wal.append(&Event::StockAdjusted { id: pid, stock_total: total }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![Event::ProductRestored {
            id: pid,
            name: Some("Widget".into()),
            unit_price: 1999,
            stock_total: 39,
            stock_reserved: 0,
            stock_sold: 0,
        }];
        let mut wal = Wal::open(&path).unwrap();
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert_eq!(wal.bytes_written(), fs::metadata(&path).unwrap().len());

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");

        let tail = Event::StockAdjusted { id: pid, stock_total: 50 };
        wal.append(&tail).unwrap();
        drop(wal);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events.len(), 2);
        assert_eq!(replay.events[0], snapshot[0]);
        assert_eq!(replay.events[1], tail);
    }

    #[test]
    fn buffered_appends_count_until_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| created(Ulid::new(), i)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }
}
