use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Upper bound on one encoded record. A length prefix above this is a torn tail.
pub const MAX_RECORD_BYTES: usize = 1 << 20;

/// Length prefix plus checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format. Returns the bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(payload.len() as u64 + FRAME_OVERHEAD)
}

/// Outcome of reading one record during replay.
enum Decoded {
    /// A record and its encoded size.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Truncated or corrupt tail. Everything from here on is discarded.
    Torn(&'static str),
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn decode_event(reader: &mut impl Read) -> io::Result<Decoded> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(Decoded::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_BYTES {
        return Ok(Decoded::Torn("oversized length prefix"));
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(Decoded::Torn("truncated payload"));
    }

    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(Decoded::Torn("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Decoded::Torn("checksum mismatch"));
    }

    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Decoded::Event(event, len as u64 + FRAME_OVERHEAD)),
        Err(_) => Ok(Decoded::Torn("undecodable payload")),
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append-only Write-Ahead Log of room and booking events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded via length-prefix + CRC check.
///
/// The file never keeps bytes past the last successful `flush_sync`: a failed
/// flush truncates back to that point, and if even that fails the log refuses
/// further appends.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length at the last successful fsync.
    synced_len: u64,
    /// Bytes buffered or written since then.
    pending_len: u64,
    pending_appends: u64,
    appends_since_compact: u64,
    poisoned: Option<String>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self::with_file(path, file, synced_len))
    }

    /// Replay the log, cut off any torn tail, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::scan(path)?;
        let file = open_append(path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!("WAL {}: truncating torn tail at {valid_len}", path.display());
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::with_file(path, file, valid_len), events))
    }

    fn with_file(path: &Path, file: File, synced_len: u64) -> Self {
        Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            pending_len: 0,
            pending_appends: 0,
            appends_since_compact: 0,
            poisoned: None,
        }
    }

    fn check_poisoned(&self) -> io::Result<()> {
        match &self.poisoned {
            Some(reason) => Err(io::Error::other(format!("WAL unusable: {reason}"))),
            None => Ok(()),
        }
    }

    /// Append and fsync a single event. Production code goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Append to the buffer without flushing. Follow with `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.check_poisoned()?;
        let written = encode_event(&mut self.writer, event)?;
        self.pending_len += written;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the underlying file. On failure nothing
    /// appended since the last successful call survives.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_poisoned()?;
        let result = self
            .writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_all());
        match result {
            Ok(()) => {
                self.synced_len += self.pending_len;
                self.pending_len = 0;
                self.pending_appends = 0;
                Ok(())
            }
            Err(e) => {
                self.discard_unsynced();
                Err(e)
            }
        }
    }

    /// Drop buffered bytes and truncate the file to the last fsynced length.
    pub fn discard_unsynced(&mut self) {
        let result = open_append(&self.path).and_then(|file| {
            file.set_len(self.synced_len)?;
            file.sync_all()?;
            Ok(file)
        });
        match result {
            Ok(file) => {
                let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
                // into_parts hands back the unwritten buffer instead of flushing it
                drop(old.into_parts());
                self.appends_since_compact -= self.pending_appends;
                self.pending_len = 0;
                self.pending_appends = 0;
            }
            Err(e) => {
                tracing::error!("WAL {}: cannot roll back failed write: {e}", self.path.display());
                self.poisoned = Some(e.to_string());
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.check_poisoned()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = open_append(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending_len = 0;
        self.pending_appends = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events up to the first torn record.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    /// Valid events plus the byte length they occupy.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;

        loop {
            match decode_event(&mut reader)? {
                Decoded::Event(event, size) => {
                    events.push(event);
                    valid_len += size;
                }
                Decoded::End => break,
                Decoded::Torn(reason) => {
                    tracing::warn!(
                        "WAL {}: discarding tail after {} records ({reason})",
                        path.display(),
                        events.len()
                    );
                    break;
                }
            }
        }

        Ok((events, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::BookingStatus;
    use crate::model::{Booking, Room, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("hotel_booking_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn room_event(id: Ulid) -> Event {
        Event::RoomRegistered {
            room: Room {
                id,
                hotel_id: Ulid::new(),
                number: Some("12".into()),
                capacity: 2,
                price_cents: 9_900,
            },
        }
    }

    fn booking_event(room_id: Ulid, start: i64, end: i64) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                user_id: Ulid::new(),
                room_id,
                span: Span::new(start, end),
                status: BookingStatus::Active,
                created_at: start,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let rid = Ulid::new();
        let events = vec![room_event(rid), booking_event(rid, 1000, 2000)];

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
    fn replay_discards_truncated_tail() {
        let path = tmp_path("truncation.wal");
        let event = room_event(Ulid::new());

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
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let good = room_event(Ulid::new());
        let bad = Event::BookingStatusChanged {
            id: Ulid::new(),
            room_id: Ulid::new(),
            status: BookingStatus::Cancelled,
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_log_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let rid = Ulid::new();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_event(rid)).unwrap();
            for i in 0..20 {
                let e = booking_event(rid, i * 100, i * 100 + 50);
                let Event::BookingCreated { booking } = &e else { unreachable!() };
                let cancel = Event::BookingStatusChanged {
                    id: booking.id,
                    room_id: rid,
                    status: BookingStatus::Cancelled,
                };
                wal.append(&e).unwrap();
                wal.append(&cancel).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![room_event(rid)];
        let later = booking_event(rid, 5_000, 6_000);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![compacted[0].clone(), later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|_| room_event(Ulid::new())).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_oversized_length_prefix() {
        let path = tmp_path("oversized_len.wal");
        let event = room_event(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0xAB; 32]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn discarded_writes_never_reach_disk() {
        let path = tmp_path("discard_unsynced.wal");
        let kept = room_event(Ulid::new());
        let failed = booking_event(Ulid::new(), 1_000, 2_000);
        let later = booking_event(Ulid::new(), 3_000, 4_000);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();

            wal.append_buffered(&failed).unwrap();
            wal.discard_unsynced();
            assert_eq!(wal.appends_since_compact(), 1);

            // the next batch must not drag the discarded record along
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let first = room_event(Ulid::new());
        let second = room_event(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&second).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }
}
