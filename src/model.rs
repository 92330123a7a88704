use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Calendar date, no time-of-day component.
pub type Date = NaiveDate;

/// Half-open stay `[check_in, check_out)`.
///
/// The check-out day is not occupied: a guest leaving on day D and another
/// arriving on day D share the room without conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StayRange {
    pub check_in: Date,
    pub check_out: Date,
}

impl StayRange {
    pub fn new(check_in: Date, check_out: Date) -> Self {
        debug_assert!(check_in < check_out, "check-in must be before check-out");
        Self { check_in, check_out }
    }

    /// `None` unless `check_in < check_out`.
    pub fn try_new(check_in: Date, check_out: Date) -> Option<Self> {
        (check_in < check_out).then_some(Self { check_in, check_out })
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    /// True if the night starting on `day` falls inside the stay.
    pub fn contains(&self, day: Date) -> bool {
        self.check_in <= day && day < self.check_out
    }

    pub fn status_on(&self, today: Date) -> BookingStatus {
        if self.check_out <= today {
            BookingStatus::Past
        } else if self.check_in <= today {
            BookingStatus::Current
        } else {
            BookingStatus::Future
        }
    }
}

impl fmt::Display for StayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

/// Derived from the stay dates at query time, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Past,
    Current,
    Future,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Past => "past",
            BookingStatus::Current => "current",
            BookingStatus::Future => "future",
        }
    }
}

/// Positive price in minor units (two fractional digits), currency-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(u64);

impl Price {
    pub fn from_minor_units(units: u64) -> Option<Self> {
        (units > 0).then_some(Self(units))
    }

    pub fn minor_units(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePriceError(&'static str);

impl fmt::Display for ParsePriceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid price: {}", self.0)
    }
}

impl std::error::Error for ParsePriceError {}

impl FromStr for Price {
    type Err = ParsePriceError;

    /// Accepts `149`, `149.9`, `149.99`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParsePriceError("expected digits before the decimal point"));
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParsePriceError("at most two fractional digits"));
        }
        let whole: u64 = whole
            .parse()
            .map_err(|_| ParsePriceError("amount too large"))?;
        let cents = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().unwrap_or(0) * 10,
            _ => frac.parse::<u64>().unwrap_or(0),
        };
        let units = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(cents))
            .ok_or(ParsePriceError("amount too large"))?;
        Price::from_minor_units(units).ok_or(ParsePriceError("must be positive"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub room_type: String,
    pub price: Price,
    pub description: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub confirmation_code: String,
    pub room_id: Ulid,
    pub stay: StayRange,
    pub guest: String,
}

/// A room and every booking that references it.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Sorted by `stay.check_in`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.room.id
    }

    /// Insert booking keeping check-in order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.stay.check_in <= booking.stay.check_in);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings whose stay overlaps `query`. Binary search skips everything
    /// checking in on or after `query.check_out`.
    pub fn overlapping(&self, query: &StayRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.check_in < query.check_out);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.check_out > query.check_in)
    }

    /// True if some booking still occupies the room on or after `today`.
    pub fn occupied_from(&self, today: Date) -> bool {
        self.bookings.iter().any(|b| b.stay.check_out > today)
    }
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated { room: Room },
    RoomUpdated { room: Room },
    RoomDeleted { id: Ulid },
    BookingConfirmed { booking: Booking },
    BookingCancelled { id: Ulid, room_id: Ulid },
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub room_type: String,
    pub price: Price,
    pub description: Option<String>,
    pub photo_url: String,
}

/// Partial update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomUpdate {
    pub room_type: Option<String>,
    pub price: Option<Price>,
    pub description: Option<String>,
    pub photo_url: Option<String>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub room_type: String,
    pub price: Price,
    pub description: Option<String>,
    pub photo_url: Option<String>,
}

impl From<&Room> for RoomInfo {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id,
            room_type: room.room_type.clone(),
            price: room.price,
            description: room.description.clone(),
            photo_url: room.photo_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingInfo {
    pub id: Ulid,
    pub confirmation_code: String,
    pub room_id: Ulid,
    pub check_in: Date,
    pub check_out: Date,
    pub guest: String,
    pub status: BookingStatus,
}

impl BookingInfo {
    pub fn new(booking: &Booking, today: Date) -> Self {
        Self {
            id: booking.id,
            confirmation_code: booking.confirmation_code.clone(),
            room_id: booking.room_id,
            check_in: booking.stay.check_in,
            check_out: booking.stay.check_out,
            guest: booking.guest.clone(),
            status: booking.stay.status_on(today),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDetail {
    pub room: RoomInfo,
    pub bookings: Vec<BookingInfo>,
}
