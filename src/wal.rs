use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

use crate::model::Event;

/// Length prefix plus checksum around every payload.
const FRAME_OVERHEAD: u64 = 8;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
/// Returns the number of bytes written.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(FRAME_OVERHEAD + u64::from(len))
}

/// Reads exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode every intact frame and the byte offset where the intact prefix ends.
fn read_frames(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact: u64 = 0;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_full(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf);

        let mut payload = vec![0u8; len as usize];
        let mut crc_buf = [0u8; 4];
        if !read_full(&mut reader, &mut payload)? || !read_full(&mut reader, &mut crc_buf)? {
            warn!(path = %path.display(), recovered = events.len(), "WAL ends in a torn record");
            break;
        }

        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            warn!(path = %path.display(), recovered = events.len(), "WAL checksum mismatch, stopping replay");
            break;
        }

        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "undecodable WAL record, stopping replay");
                break;
            }
        }
        intact += FRAME_OVERHEAD + u64::from(len);
    }

    Ok((events, intact))
}

/// Append-only ledger journal.
///
/// Every accepted mutation lands here before it becomes visible. Replay stops
/// at the first torn or corrupt frame; everything before it is trusted.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length covered by the last successful sync.
    durable_len: u64,
    /// Bytes and appends handed to the writer since then.
    pending_len: u64,
    pending_appends: u64,
    #[cfg(test)]
    injected_failures: Arc<AtomicU32>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            pending_len: 0,
            pending_appends: 0,
            #[cfg(test)]
            injected_failures: Arc::default(),
        })
    }

    /// Buffer an event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        self.pending_len += write_frame(&mut self.writer, event)?;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        self.take_injected_failure()?;
        self.writer.get_ref().sync_data()?;
        self.durable_len += self.pending_len;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Throw away everything since the last successful sync, both the
    /// buffered bytes and whatever already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (_stale_file, _unwritten) = stale.into_parts();
        self.writer.get_ref().set_len(self.durable_len)?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Buffer and sync in one go. The group-commit writer batches instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Make the next `n` syncs fail after the bytes reach the file.
    #[cfg(test)]
    pub(crate) fn failure_switch(&self) -> Arc<AtomicU32> {
        self.injected_failures.clone()
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> io::Result<()> {
        let failed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(io::Error::other("injected sync failure"));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Rewrite the journal as `events` via a synced temp file and a rename,
    /// then reopen for appends.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.compact_tmp_path();
        let mut written = 0;
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                written += write_frame(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.durable_len = written;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Decode every intact frame. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_frames(path).map(|(events, _)| events)
    }

    /// Replay, then cut any torn or corrupt tail off the file so later
    /// appends follow the last intact frame.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact) = read_frames(path)?;
        let on_disk = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        if on_disk > intact {
            warn!(
                path = %path.display(),
                discarded_bytes = on_disk - intact,
                "truncating WAL to its last intact record"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact)?;
            file.sync_all()?;
        }
        Ok(events)
    }
}
