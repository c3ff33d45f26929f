use ulid::Ulid;

use crate::model::*;

// ── Availability Index ────────────────────────────────────────────
//
// Pure functions over a snapshot of a room's bookings. The caller is
// responsible for the snapshot being consistent (the store evaluates
// these under the room's write lock).

/// True iff no active booking on `room_id` overlaps `candidate`.
/// Bookings for other rooms and cancelled bookings are ignored.
pub fn is_available<'a, I>(room_id: Ulid, candidate: &Span, bookings: I) -> bool
where
    I: IntoIterator<Item = &'a Booking>,
{
    first_conflict(room_id, candidate, bookings).is_none()
}

/// The first active booking on `room_id` that overlaps `candidate`, if any.
pub fn first_conflict<'a, I>(room_id: Ulid, candidate: &Span, bookings: I) -> Option<&'a Booking>
where
    I: IntoIterator<Item = &'a Booking>,
{
    bookings
        .into_iter()
        .find(|b| b.room_id == room_id && b.is_active() && b.span.overlaps(candidate))
}

/// Free windows inside `query`, given the room's bookings.
pub fn free_spans<'a, I>(query: &Span, bookings: I) -> Vec<Span>
where
    I: IntoIterator<Item = &'a Booking>,
{
    let mut busy: Vec<Span> = bookings
        .into_iter()
        .filter(|b| b.is_active() && b.span.overlaps(query))
        .map(|b| Span::new(b.span.start.max(query.start), b.span.end.min(query.end)))
        .collect();
    if busy.is_empty() {
        return vec![*query];
    }
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    subtract_intervals(&[*query], &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` spans from sorted `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
