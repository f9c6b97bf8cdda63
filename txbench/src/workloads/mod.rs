//! Ready made workloads running on the in-memory backends.
pub mod flight;

pub use flight::{BookingStore, FlightBooking, Schedule, payment_amount};
