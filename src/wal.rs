use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::limits::MAX_WAL_RECORD_BYTES;
use crate::model::Event;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};

/// Encode a single event to [len][bincode][crc32] format. Returns the bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_RECORD_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() as u64 + 8)
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on a clean or torn end of file.
fn read_record_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of booking events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn trailing entry (crash mid-write) is dropped on replay via the length prefix + CRC.
/// - A batch that fails to commit is cut back off the file before the next one is written.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    committed_len: u64,
    pending_bytes: u64,
    pending_events: u64,
    /// Set while bytes past `committed_len` may be on disk or in the buffer.
    needs_truncate: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            committed_len,
            pending_bytes: 0,
            pending_events: 0,
            needs_truncate: false,
        })
    }

    /// Buffer one event without syncing. `flush_sync` commits the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.needs_truncate {
            self.discard_pending()?;
        }
        self.pending_events += 1;
        self.appends_since_compact += 1;
        self.pending_bytes += encode_event(&mut self.writer, event)?;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_bytes;
        self.pending_bytes = 0;
        self.pending_events = 0;
        Ok(())
    }

    /// Drop everything written since the last commit: the buffer is thrown away
    /// unwritten and the file is cut back to `committed_len`.
    pub fn discard_pending(&mut self) -> io::Result<()> {
        self.needs_truncate = true;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_events);
        self.pending_events = 0;
        self.pending_bytes = 0;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = stale.into_parts();
        self.writer.get_ref().set_len(self.committed_len)?;
        self.writer.get_ref().sync_all()?;
        self.needs_truncate = false;
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

    /// Replace the log with `events`: write a synced temp file, then rename it over the log.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = stale.into_parts();
        self.appends_since_compact = 0;
        self.pending_bytes = 0;
        self.pending_events = 0;
        self.needs_truncate = false;
        Ok(())
    }

    /// Replay the WAL from disk, returning every intact event up to the first bad record.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            if !read_record_part(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_WAL_RECORD_BYTES {
                tracing::warn!(
                    "WAL {}: record length {len} after {} events exceeds the cap, truncating replay",
                    path.display(),
                    events.len()
                );
                break;
            }
            let mut payload = vec![0u8; len];
            if !read_record_part(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_record_part(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!("WAL {}: checksum mismatch after {} events, truncating replay", path.display(), events.len());
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!("WAL {}: undecodable record ({e}), truncating replay", path.display());
                    break;
                }
            }
        }

        Ok(events)
    }
}

// ── Group-commit writer ──────────────────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Move `wal` onto a background task and return the channel that feeds it.
pub(crate) fn spawn_writer(wal: Wal) -> mpsc::Sender<WalCommand> {
    let (tx, rx) = mpsc::channel(4096);
    tokio::spawn(writer_loop(wal, rx));
    tx
}

/// Owns the WAL. Every append that is already queued when the first one
/// arrives joins the same batch, and the whole batch shares one fsync.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                run_control(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Control commands must observe the batch queued before them.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            run_control(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer for {} stopped", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!("WAL commit of {} events failed: {e}", batch.len());
        // Nothing from a failed batch may reach the file.
        if let Err(e) = wal.discard_pending() {
            tracing::error!("WAL rollback failed, retrying before the next append: {e}");
        }
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn run_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Booking, BookingStatus, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotguard_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn resource_created(id: Ulid) -> Event {
        Event::ResourceCreated {
            id,
            title: "Desk".into(),
            description: String::new(),
            available: true,
        }
    }

    fn booking_created(resource_id: Ulid) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                resource_id,
                requester_id: "user-7".into(),
                span: Span::new(1000, 2000),
                contact_name: "Grace".into(),
                contact_email: "grace@example.com".into(),
                notes: Some("window seat".into()),
                status: BookingStatus::Pending,
                created_at: 10,
                updated_at: 10,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let rid = Ulid::new();
        let events = vec![resource_created(rid), booking_created(rid)];
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
        let event = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
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
        let good = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&Event::ResourceDeleted { id: Ulid::new() }).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let rid = Ulid::new();
        let compacted = vec![resource_created(rid)];
        let later = booking_created(rid);
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&booking_created(rid)).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![compacted[0].clone(), later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn discarded_batch_never_reaches_replay() {
        let path = tmp_path("discard.wal");
        let rid = Ulid::new();
        let committed = resource_created(rid);
        let rejected = booking_created(rid);
        let later = booking_created(rid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&committed).unwrap();

            // A failed batch: one event still buffered, and a torn fragment already on disk.
            wal.append_buffered(&rejected).unwrap();
            wal.writer.get_ref().write_all(&[7u8; 5]).unwrap();
            wal.discard_pending().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);

            wal.append(&later).unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![committed, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_resumes_at_committed_length() {
        let path = tmp_path("reopen_len.wal");
        let first = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let second = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&second).unwrap();
            wal.discard_pending().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_rejects_oversized_length() {
        let path = tmp_path("oversized.wal");
        let good = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn writer_commits_and_counts() {
        let path = tmp_path("writer_commits.wal");
        let tx = spawn_writer(Wal::open(&path).unwrap());
        let rid = Ulid::new();

        let mut waits = Vec::new();
        for event in [resource_created(rid), booking_created(rid), booking_created(rid)] {
            let (resp_tx, resp_rx) = oneshot::channel();
            tx.send(WalCommand::Append { event, response: resp_tx }).await.unwrap();
            waits.push(resp_rx);
        }
        for w in waits {
            w.await.unwrap().unwrap();
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(WalCommand::AppendsSinceCompact { response: resp_tx }).await.unwrap();
        assert_eq!(resp_rx.await.unwrap(), 3);
        assert_eq!(Wal::replay(&path).unwrap().len(), 3);
        let _ = fs::remove_file(&path);
    }
}
