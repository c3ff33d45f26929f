use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::availability;
use crate::clock::Clock;
use crate::lifecycle::BookingStatus;
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::commit::WalHandle;
use super::{BookingStore, StoreError};

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Single-writer durable store: in-memory room state rebuilt from a WAL.
///
/// Every room sits behind its own `RwLock`. `reserve` holds the room's
/// write lock across the overlap check, the WAL commit and the in-memory
/// apply, which makes check-and-insert atomic per room while other rooms
/// proceed in parallel.
pub struct LocalStore {
    rooms: DashMap<Ulid, SharedRoomState>,
    wal: WalHandle,
    clock: Arc<dyn Clock>,
    /// Mutations hold this shared; compaction holds it exclusively so no
    /// append can slip between the snapshot and the log swap.
    commit_gate: RwLock<()>,
    /// Serializes room registration so an id is checked and logged once.
    registration: Mutex<()>,
    /// Reverse lookup: booking id → room id.
    booking_to_room: DashMap<Ulid, Ulid>,
    /// User → booking ids in commit order.
    user_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// Hotel → room ids.
    hotel_rooms: DashMap<Ulid, Vec<Ulid>>,
}

impl LocalStore {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: &Path, clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let (wal, events) = Wal::recover(wal_path)?;

        let store = Self {
            rooms: DashMap::new(),
            wal: WalHandle::spawn(wal),
            clock,
            commit_gate: RwLock::new(()),
            registration: Mutex::new(()),
            booking_to_room: DashMap::new(),
            user_bookings: DashMap::new(),
            hotel_rooms: DashMap::new(),
        };

        // Rebuild into plain maps first; nothing else can see them yet.
        let replayed = events.len();
        let mut rooms: HashMap<Ulid, RoomState> = HashMap::new();
        for event in events {
            match event {
                Event::RoomRegistered { room } => {
                    if rooms.contains_key(&room.id) {
                        warn!("replay: room {} registered twice, keeping the first", room.id);
                        continue;
                    }
                    store.index_room(&room);
                    rooms.insert(room.id, RoomState::new(room));
                }
                other => match rooms.get_mut(&other.room_id()) {
                    Some(rs) => {
                        if let Event::BookingCreated { booking } = &other
                            && booking.is_active()
                            && let Some(existing) = availability::first_conflict(
                                booking.room_id,
                                &booking.span,
                                rs.overlapping(&booking.span),
                            )
                        {
                            warn!(
                                "replay: booking {} overlaps {} on room {}, skipped",
                                booking.id, existing.id, booking.room_id
                            );
                            continue;
                        }
                        store.apply_event(rs, &other);
                    }
                    None => warn!("replay: event for unknown room {}", other.room_id()),
                },
            }
        }
        for (id, rs) in rooms {
            store.rooms.insert(id, Arc::new(RwLock::new(rs)));
        }

        info!(
            "store opened: {} rooms, {} bookings from {replayed} WAL records",
            store.rooms.len(),
            store.booking_to_room.len()
        );
        Ok(store)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Add a room. Room metadata is owned by hotel management; this is its write path.
    pub async fn register_room(&self, room: Room) -> Result<(), StoreError> {
        if let Some(ref n) = room.number
            && n.len() > MAX_ROOM_NUMBER_LEN
        {
            return Err(StoreError::LimitExceeded("room number too long"));
        }
        let _gate = self.commit_gate.read().await;
        let _registering = self.registration.lock().await;
        if self.rooms.contains_key(&room.id) {
            return Err(StoreError::AlreadyExists(room.id));
        }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(StoreError::LimitExceeded("too many rooms"));
        }

        let event = Event::RoomRegistered { room: room.clone() };
        self.wal.append(&event).await?;
        self.index_room(&room);
        let id = room.id;
        self.rooms.insert(id, Arc::new(RwLock::new(RoomState::new(room))));
        debug!("room {id} registered");
        Ok(())
    }

    /// Rewrite the WAL with only the records needed to rebuild current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.commit_gate.write().await;

        let rooms: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(rooms.len() + self.booking_to_room.len());
        for rs in rooms {
            let guard = rs.read().await;
            events.push(Event::RoomRegistered {
                room: guard.room.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }

        let count = events.len();
        self.wal.compact(events).await?;
        info!("WAL compacted to {count} records");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    fn index_room(&self, room: &Room) {
        self.hotel_rooms.entry(room.hotel_id).or_default().push(room.id);
    }

    /// Apply a booking event to a room (no locking; caller holds the lock).
    fn apply_event(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                self.booking_to_room.insert(booking.id, booking.room_id);
                self.user_bookings
                    .entry(booking.user_id)
                    .or_default()
                    .push(booking.id);
                rs.insert_booking(booking.clone());
            }
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(b) = rs.booking_mut(*id) {
                    b.status = *status;
                }
            }
            // Registration is handled at the map level, not here
            Event::RoomRegistered { .. } => {}
        }
    }

    /// WAL-append then apply, under the caller's room lock.
    async fn persist_and_apply(&self, rs: &mut RoomState, event: &Event) -> Result<(), StoreError> {
        self.wal.append(event).await?;
        self.apply_event(rs, event);
        Ok(())
    }

    /// Lookup booking → room, acquire the room's write lock.
    async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<RoomState>), StoreError> {
        let room_id = self
            .booking_to_room
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(*booking_id))?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(StoreError::NotFound(room_id))?;
        Ok((room_id, rs.write_owned().await))
    }

    async fn read_booking(&self, booking_id: Ulid) -> Option<Booking> {
        let room_id = self.booking_to_room.get(&booking_id).map(|e| *e.value())?;
        let rs = self.get_room_state(&room_id)?;
        let guard = rs.read().await;
        guard.booking(booking_id).cloned()
    }
}

#[async_trait]
impl BookingStore for LocalStore {
    async fn find_room(&self, room_id: Ulid) -> Result<Option<Room>, StoreError> {
        let Some(rs) = self.get_room_state(&room_id) else {
            return Ok(None);
        };
        let guard = rs.read().await;
        Ok(Some(guard.room.clone()))
    }

    async fn list_rooms_by_hotel(&self, hotel_id: Ulid) -> Result<Vec<Room>, StoreError> {
        let ids = self
            .hotel_rooms
            .get(&hotel_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rs) = self.get_room_state(&id) {
                rooms.push(rs.read().await.room.clone());
            }
        }
        rooms.sort_by_key(|r| r.id);
        Ok(rooms)
    }

    async fn find_active_overlapping(
        &self,
        room_id: Ulid,
        span: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(StoreError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.active_overlapping(&span).cloned().collect())
    }

    async fn reserve(&self, draft: NewBooking) -> Result<Booking, StoreError> {
        let _gate = self.commit_gate.read().await;
        let rs = self
            .get_room_state(&draft.room_id)
            .ok_or(StoreError::NotFound(draft.room_id))?;
        let mut guard = rs.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(StoreError::LimitExceeded("too many bookings on room"));
        }

        if let Some(existing) =
            availability::first_conflict(draft.room_id, &draft.span, guard.overlapping(&draft.span))
        {
            return Err(StoreError::Conflict(existing.id));
        }

        let booking = Booking {
            id: Ulid::new(),
            user_id: draft.user_id,
            room_id: draft.room_id,
            span: draft.span,
            status: BookingStatus::Active,
            created_at: self.clock.now_ms(),
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(booking)
    }

    async fn find_booking(&self, booking_id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.read_booking(booking_id).await)
    }

    async fn update_booking_status(
        &self,
        booking_id: Ulid,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<Booking, StoreError> {
        let _gate = self.commit_gate.read().await;
        let (room_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .ok_or(StoreError::NotFound(booking_id))?
            .status;
        if current != expected {
            return Err(StoreError::StatusMismatch {
                id: booking_id,
                actual: current,
            });
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            room_id,
            status: next,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .booking(booking_id)
            .cloned()
            .ok_or(StoreError::NotFound(booking_id))
    }

    async fn list_bookings_by_user(&self, user_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        let ids = self
            .user_bookings
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut bookings = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(b) = self.read_booking(id).await {
                bookings.push(b);
            }
        }
        Ok(bookings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::path::PathBuf;

    const NOW: Ms = 1_714_521_600_000; // 2024-05-01

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("hotel_booking_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open(path: &Path) -> LocalStore {
        LocalStore::open(path, Arc::new(FixedClock::new(NOW))).unwrap()
    }

    fn room(hotel_id: Ulid) -> Room {
        Room {
            id: Ulid::new(),
            hotel_id,
            number: None,
            capacity: 2,
            price_cents: 10_000,
        }
    }

    fn draft(room_id: Ulid, user_id: Ulid, start: Ms, end: Ms) -> NewBooking {
        NewBooking {
            user_id,
            room_id,
            span: Span::new(start, end),
        }
    }

    #[tokio::test]
    async fn register_and_find_room() {
        let store = open(&test_wal_path("register.wal"));
        let r = room(Ulid::new());
        store.register_room(r.clone()).await.unwrap();
        assert_eq!(store.find_room(r.id).await.unwrap(), Some(r.clone()));
        assert_eq!(store.find_room(Ulid::new()).await.unwrap(), None);
        assert_eq!(store.room_count(), 1);

        let dup = store.register_room(r.clone()).await;
        assert_eq!(dup, Err(StoreError::AlreadyExists(r.id)));
    }

    #[tokio::test]
    async fn register_rejects_long_room_number() {
        let store = open(&test_wal_path("long_number.wal"));
        let mut r = room(Ulid::new());
        r.number = Some("9".repeat(MAX_ROOM_NUMBER_LEN + 1));
        assert!(matches!(
            store.register_room(r).await,
            Err(StoreError::LimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn reserve_assigns_id_and_timestamp() {
        let store = open(&test_wal_path("reserve_assigns.wal"));
        let r = room(Ulid::new());
        store.register_room(r.clone()).await.unwrap();

        let user = Ulid::new();
        let b = store.reserve(draft(r.id, user, 1000, 2000)).await.unwrap();
        assert_eq!(b.user_id, user);
        assert_eq!(b.status, BookingStatus::Active);
        assert_eq!(b.created_at, NOW);
        assert_eq!(store.find_booking(b.id).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn reserve_unknown_room() {
        let store = open(&test_wal_path("reserve_unknown.wal"));
        let missing = Ulid::new();
        let result = store.reserve(draft(missing, Ulid::new(), 0, 10)).await;
        assert_eq!(result, Err(StoreError::NotFound(missing)));
    }

    #[tokio::test]
    async fn reserve_conflict_reports_existing_booking() {
        let store = open(&test_wal_path("reserve_conflict.wal"));
        let r = room(Ulid::new());
        store.register_room(r.clone()).await.unwrap();

        let first = store.reserve(draft(r.id, Ulid::new(), 1000, 5000)).await.unwrap();
        let second = store.reserve(draft(r.id, Ulid::new(), 3000, 4000)).await;
        assert_eq!(second, Err(StoreError::Conflict(first.id)));

        // adjacent is fine
        store.reserve(draft(r.id, Ulid::new(), 5000, 7000)).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_booking_frees_the_room() {
        let store = open(&test_wal_path("cancel_frees.wal"));
        let r = room(Ulid::new());
        store.register_room(r.clone()).await.unwrap();

        let b = store.reserve(draft(r.id, Ulid::new(), 1000, 5000)).await.unwrap();
        store
            .update_booking_status(b.id, BookingStatus::Active, BookingStatus::Cancelled)
            .await
            .unwrap();
        store.reserve(draft(r.id, Ulid::new(), 1000, 5000)).await.unwrap();

        let active = store
            .find_active_overlapping(r.id, Span::new(0, 10_000))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_ne!(active[0].id, b.id);
    }

    #[tokio::test]
    async fn status_update_is_compare_and_set() {
        let store = open(&test_wal_path("status_cas.wal"));
        let r = room(Ulid::new());
        store.register_room(r.clone()).await.unwrap();
        let b = store.reserve(draft(r.id, Ulid::new(), 1000, 2000)).await.unwrap();

        let updated = store
            .update_booking_status(b.id, BookingStatus::Active, BookingStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(updated.status, BookingStatus::Cancelled);

        let again = store
            .update_booking_status(b.id, BookingStatus::Active, BookingStatus::Cancelled)
            .await;
        assert_eq!(
            again,
            Err(StoreError::StatusMismatch {
                id: b.id,
                actual: BookingStatus::Cancelled
            })
        );

        let missing = Ulid::new();
        let result = store
            .update_booking_status(missing, BookingStatus::Active, BookingStatus::Cancelled)
            .await;
        assert_eq!(result, Err(StoreError::NotFound(missing)));
    }

    #[tokio::test]
    async fn lists_by_user_and_hotel() {
        let store = open(&test_wal_path("lists.wal"));
        let hotel = Ulid::new();
        let r1 = room(hotel);
        let r2 = room(hotel);
        let elsewhere = room(Ulid::new());
        for r in [&r1, &r2, &elsewhere] {
            store.register_room(r.clone()).await.unwrap();
        }

        let alice = Ulid::new();
        store.reserve(draft(r1.id, alice, 0, 100)).await.unwrap();
        store.reserve(draft(r2.id, alice, 0, 100)).await.unwrap();
        store.reserve(draft(elsewhere.id, Ulid::new(), 0, 100)).await.unwrap();

        assert_eq!(store.list_bookings_by_user(alice).await.unwrap().len(), 2);
        assert!(store.list_bookings_by_user(Ulid::new()).await.unwrap().is_empty());

        let rooms = store.list_rooms_by_hotel(hotel).await.unwrap();
        let mut expected = vec![r1.id, r2.id];
        expected.sort();
        assert_eq!(rooms.iter().map(|r| r.id).collect::<Vec<_>>(), expected);
    }

    #[tokio::test]
    async fn replay_restores_rooms_bookings_and_status() {
        let path = test_wal_path("replay.wal");
        let r = room(Ulid::new());
        let user = Ulid::new();
        let (kept, cancelled) = {
            let store = open(&path);
            store.register_room(r.clone()).await.unwrap();
            let kept = store.reserve(draft(r.id, user, 0, 100)).await.unwrap();
            let cancelled = store.reserve(draft(r.id, user, 100, 200)).await.unwrap();
            store
                .update_booking_status(cancelled.id, BookingStatus::Active, BookingStatus::Cancelled)
                .await
                .unwrap();
            (kept, cancelled)
        };

        let reopened = open(&path);
        assert_eq!(reopened.find_room(r.id).await.unwrap(), Some(r.clone()));
        assert_eq!(reopened.find_booking(kept.id).await.unwrap(), Some(kept));
        assert_eq!(
            reopened.find_booking(cancelled.id).await.unwrap().unwrap().status,
            BookingStatus::Cancelled
        );
        assert_eq!(reopened.list_bookings_by_user(user).await.unwrap().len(), 2);
        assert_eq!(reopened.list_rooms_by_hotel(r.hotel_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compaction.wal");
        let r = room(Ulid::new());
        let user = Ulid::new();
        {
            let store = open(&path);
            store.register_room(r.clone()).await.unwrap();
            for i in 0..10 {
                let b = store.reserve(draft(r.id, user, i * 100, i * 100 + 50)).await.unwrap();
                if i % 2 == 0 {
                    store
                        .update_booking_status(b.id, BookingStatus::Active, BookingStatus::Cancelled)
                        .await
                        .unwrap();
                }
            }
            assert_eq!(store.appends_since_compact().await, 16);
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 11);

        let reopened = open(&path);
        let bookings = reopened.list_bookings_by_user(user).await.unwrap();
        assert_eq!(bookings.len(), 10);
        assert_eq!(bookings.iter().filter(|b| b.is_active()).count(), 5);
    }

    #[tokio::test]
    async fn concurrent_reserves_on_one_room_admit_one() {
        let store = Arc::new(open(&test_wal_path("concurrent_reserve.wal")));
        let r = room(Ulid::new());
        store.register_room(r.clone()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let room_id = r.id;
            handles.push(tokio::spawn(async move {
                store.reserve(draft(room_id, Ulid::new(), 1000 + i, 5000 + i)).await
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_of_one_room_admits_one() {
        let path = test_wal_path("concurrent_register.wal");
        let store = Arc::new(open(&path));
        let r = room(Ulid::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let r = r.clone();
            handles.push(tokio::spawn(async move { store.register_room(r).await }));
        }

        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => ok += 1,
                Err(e) => assert_eq!(e, StoreError::AlreadyExists(r.id)),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(store.list_rooms_by_hotel(r.hotel_id).await.unwrap().len(), 1);

        let registrations = Wal::replay(&path)
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e, Event::RoomRegistered { .. }))
            .count();
        assert_eq!(registrations, 1);
    }

    #[tokio::test]
    async fn replay_keeps_bookings_when_room_is_logged_twice() {
        let path = test_wal_path("replay_duplicate_room.wal");
        let r = room(Ulid::new());
        let booking = Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id: r.id,
            span: Span::new(1000, 5000),
            status: BookingStatus::Active,
            created_at: NOW,
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&Event::RoomRegistered { room: r.clone() }).unwrap();
            wal.append(&Event::BookingCreated { booking: booking.clone() }).unwrap();
            wal.append(&Event::RoomRegistered { room: r.clone() }).unwrap();
        }

        let store = open(&path);
        assert_eq!(store.find_booking(booking.id).await.unwrap(), Some(booking.clone()));
        assert_eq!(store.list_rooms_by_hotel(r.hotel_id).await.unwrap().len(), 1);
        let clash = store.reserve(draft(r.id, Ulid::new(), 2000, 3000)).await;
        assert_eq!(clash, Err(StoreError::Conflict(booking.id)));
    }

    #[tokio::test]
    async fn replay_skips_overlapping_booking() {
        let path = test_wal_path("replay_overlap.wal");
        let r = room(Ulid::new());
        let booking = |start, end| Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id: r.id,
            span: Span::new(start, end),
            status: BookingStatus::Active,
            created_at: NOW,
        };
        let first = booking(1000, 5000);
        let clash = booking(3000, 4000);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&Event::RoomRegistered { room: r.clone() }).unwrap();
            wal.append(&Event::BookingCreated { booking: first.clone() }).unwrap();
            wal.append(&Event::BookingCreated { booking: clash.clone() }).unwrap();
        }

        let store = open(&path);
        assert_eq!(store.find_booking(first.id).await.unwrap(), Some(first));
        assert_eq!(store.find_booking(clash.id).await.unwrap(), None);
        let active = store
            .find_active_overlapping(r.id, Span::new(0, 10_000))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }
}
