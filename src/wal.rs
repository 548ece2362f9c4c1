use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::model::Event;

/// Durable store of engine events.
///
/// The engine's writer task is the only caller after startup: it buffers a batch
/// with `append_buffered`, then commits it with one `flush_sync`.
pub trait Journal: Send + 'static {
    /// Every committed event, oldest first.
    fn load(&mut self) -> io::Result<Vec<Event>>;

    fn append_buffered(&mut self, event: &Event) -> io::Result<()>;

    fn flush_sync(&mut self) -> io::Result<()>;

    /// Replace the whole journal with `events`.
    fn compact(&mut self, events: &[Event]) -> io::Result<()>;

    fn appends_since_compact(&self) -> u64;
}

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for journal"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one `[len][payload][crc]` entry. `Ok(None)` on a clean or truncated end.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [payload.as_mut_slice(), crc_buf.as_mut_slice()] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None), // truncated
            Err(e) => return Err(e),
        }
    }

    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Append-only write-ahead log on disk.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt tail (crash mid-write) ends replay; everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single event and fsync.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Write compacted events to a temp file and fsync.
    fn write_compact_file(&self, events: &[Event]) -> io::Result<()> {
        let file = File::create(self.tmp_path())?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen for appending.
    fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.tmp_path(), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay the WAL from disk, returning all valid events.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(payload) = read_entry(&mut reader)? {
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break, // corrupt payload
            }
        }
        Ok(events)
    }
}

impl Journal for Wal {
    fn load(&mut self) -> io::Result<Vec<Event>> {
        Self::replay(&self.path)
    }

    fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        self.write_compact_file(events)?;
        self.swap_compact_file()
    }

    fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

/// In-memory journal. Clones share the committed log, so a test can keep one
/// handle, give another to an engine, and reopen a fresh engine from it later.
#[derive(Clone, Default)]
pub struct MemoryJournal {
    committed: Arc<Mutex<Vec<Event>>>,
    pending: Vec<Event>,
    appends: u64,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the committed log.
    pub fn events(&self) -> Vec<Event> {
        self.committed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Journal for MemoryJournal {
    fn load(&mut self) -> io::Result<Vec<Event>> {
        Ok(self.events())
    }

    fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending.push(event.clone());
        self.appends += 1;
        Ok(())
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        committed.append(&mut self.pending);
        Ok(())
    }

    fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        *self.committed.lock().unwrap_or_else(|e| e.into_inner()) = events.to_vec();
        self.appends = 0;
        Ok(())
    }

    fn appends_since_compact(&self) -> u64 {
        self.appends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("allotment_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn removed(n: u64) -> Event {
        Event::ResourceRemoved { id: Ulid::from_parts(n, 0) }
    }

    fn capacity_removed(n: u64) -> Event {
        Event::CapacityRemoved {
            id: Ulid::from_parts(n, 1),
            resource_id: Ulid::from_parts(n, 0),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![removed(1), capacity_removed(2)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&removed(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap(); // length says 9, only 2 bytes follow
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![removed(1)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&removed(1)).unwrap();
        }
        {
            let payload = bincode::serialize(&removed(2)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&removed(3)).unwrap();
        }
        // Nothing after the bad entry is trusted.
        assert_eq!(Wal::replay(&path).unwrap(), vec![removed(1)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let mut wal = Wal::open(&path).unwrap();
        for n in 0..20 {
            wal.append(&capacity_removed(n)).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(&[removed(7)]).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        wal.append(&removed(8)).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![removed(7), removed(8)]);
        assert!(!wal.tmp_path().exists());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_are_invisible_until_flushed() {
        let path = tmp_path("buffered_flush.wal");
        let mut wal = Wal::open(&path).unwrap();
        for n in 0..5 {
            wal.append_buffered(&removed(n)).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), 5);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn memory_journal_shares_committed_log() {
        let handle = MemoryJournal::new();
        let mut journal = handle.clone();
        journal.append_buffered(&removed(1)).unwrap();
        assert!(handle.events().is_empty());
        journal.flush_sync().unwrap();
        assert_eq!(handle.events(), vec![removed(1)]);

        journal.compact(&[removed(2)]).unwrap();
        assert_eq!(handle.clone().load().unwrap(), vec![removed(2)]);
    }
}
