//! Seat booking on a flight schedule.
//!
//! Every iteration books one seat for a fresh user: it picks a random schedule,
//! inserts the seat and its payment, then bumps the per-day audit counter of that
//! schedule. The audit upsert is the contended write; with a small `day_range`
//! many lanes hit the same audit row and conflicts (and retries) are frequent.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use typed_builder::TypedBuilder;

use crate::{
    error::TxError,
    memory::{MemoryConnection, MemorySession},
    scope::{Backend, ConnectionScope, SessionScope, TransactionScope, TxOptions},
    workload::{LaneContext, Workload},
};

pub const SCHEDULES: &str = "schedule";
pub const SEATS: &str = "seat";
pub const PAYMENTS: &str = "payment";
pub const AUDITS: &str = "audit";

const MILLIS_PER_DAY: u64 = 86_400_000;
const BASE_AMOUNT: u64 = 42;
const AIRCRAFT: [(&str, u32); 4] = [("320", 180), ("738", 189), ("77W", 396), ("E90", 100)];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub aircraft: String,
    /// Flight time as `H:MM`.
    pub duration: Option<String>,
    pub capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seat {
    pub user_id: String,
    pub schedule_id: String,
    pub date: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub user_id: String,
    pub amount: u64,
    pub date: u64,
}

/// Price of a booking: 42 per minute of flight, never less than 42.
///
/// Missing or unparsable durations cost the base amount.
pub fn payment_amount(duration: Option<&str>) -> u64 {
    duration
        .and_then(duration_minutes)
        .map_or(BASE_AMOUNT, |minutes| (minutes * BASE_AMOUNT).max(BASE_AMOUNT))
}

fn duration_minutes(duration: &str) -> Option<u64> {
    let (hours, minutes) = duration.split_once(':')?;
    let hours: u64 = hours.trim().parse().ok()?;
    let minutes: u64 = minutes.trim().parse().ok()?;
    Some(hours * 60 + minutes)
}

/// Day (since the epoch) the audit row of a booking made at `now_millis` falls on.
/// Spreads bookings over `day_range` days starting today.
pub fn booking_day(now_millis: u64, day_range: u64) -> u64 {
    now_millis / MILLIS_PER_DAY + now_millis % day_range.max(1)
}

fn now_millis() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
}

fn to_row<T: Serialize>(value: &T) -> Result<Value, TxError> {
    serde_json::to_value(value).map_err(|e| TxError::Workload(e.into()))
}

fn from_row<T: DeserializeOwned>(row: Value) -> Result<T, TxError> {
    serde_json::from_value(row).map_err(|e| TxError::Workload(e.into()))
}

fn synthetic_schedules(count: usize) -> Vec<Schedule> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let (aircraft, capacity) = AIRCRAFT[rng.gen_range(0..AIRCRAFT.len())];
            let duration = if rng.gen_ratio(1, 10) {
                None
            } else {
                let minutes = rng.gen_range(30..=14 * 60);
                Some(format!("{}:{:02}", minutes / 60, minutes % 60))
            };
            Schedule {
                id: format!("SCH{i:05}"),
                aircraft: aircraft.to_string(),
                duration,
                capacity,
            }
        })
        .collect()
}

/// The statements a booking issues, on any scope able to store rows.
///
/// Implementors provide the three row primitives; the booking statements are
/// built on top of them.
pub trait BookingStore {
    fn insert_row(&mut self, table: &str, key: &str, row: Value) -> Result<(), TxError>;

    fn upsert_row(
        &mut self,
        table: &str,
        key: &str,
        f: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<Value, TxError>;

    fn sample_row(&mut self, table: &str) -> Result<Option<Value>, TxError>;

    fn sample_schedule(&mut self) -> Result<Option<Schedule>, TxError> {
        self.sample_row(SCHEDULES)?.map(from_row).transpose()
    }

    fn insert_schedule(&mut self, schedule: &Schedule) -> Result<(), TxError> {
        self.insert_row(SCHEDULES, &schedule.id, to_row(schedule)?)
    }

    fn insert_seat(&mut self, seat: &Seat) -> Result<(), TxError> {
        self.insert_row(SEATS, &seat.user_id, to_row(seat)?)
    }

    fn insert_payment(&mut self, payment: &Payment) -> Result<(), TxError> {
        self.insert_row(PAYMENTS, &payment.user_id, to_row(payment)?)
    }

    /// Count one more occupied seat on `schedule_id` for `day`. Returns the new count.
    fn record_audit(&mut self, schedule_id: &str, day: u64, date: u64) -> Result<u64, TxError> {
        let key = format!("{schedule_id}/{day}");
        let row = self.upsert_row(AUDITS, &key, |current| {
            let occupied = current
                .as_ref()
                .and_then(|row| row.get("seats_occupied"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            json!({
                "schedule_id": schedule_id,
                "day": day,
                "seats_occupied": occupied + 1,
                "date": date,
            })
        })?;
        Ok(row["seats_occupied"].as_u64().unwrap_or(0))
    }
}

impl BookingStore for SessionScope<MemorySession> {
    fn insert_row(&mut self, table: &str, key: &str, row: Value) -> Result<(), TxError> {
        self.session()?.insert_one(table, key, row)
    }

    fn upsert_row(
        &mut self,
        table: &str,
        key: &str,
        f: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<Value, TxError> {
        self.session()?.upsert_with(table, key, f)
    }

    fn sample_row(&mut self, table: &str) -> Result<Option<Value>, TxError> {
        Ok(self.session()?.sample(table)?.map(|(_, row)| row))
    }
}

impl BookingStore for ConnectionScope<MemoryConnection> {
    fn insert_row(&mut self, table: &str, key: &str, row: Value) -> Result<(), TxError> {
        self.connection()?.insert(table, key, row)
    }

    fn upsert_row(
        &mut self,
        table: &str,
        key: &str,
        f: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<Value, TxError> {
        self.connection()?.upsert_with(table, key, f)
    }

    fn sample_row(&mut self, table: &str) -> Result<Option<Value>, TxError> {
        Ok(self.connection()?.sample(table)?.map(|(_, row)| row))
    }
}

/// The flight booking workload.
///
/// `setup` seeds `seed_schedules` synthetic schedules unless some already exist.
/// Each iteration waits [`LaneContext::pause`] between reading the schedule and
/// writing the booking, which widens the conflict window like a user thinking.
#[derive(Debug, TypedBuilder)]
pub struct FlightBooking<B> {
    backend: B,
    /// Number of days audit rows are spread over. Zero is treated as one.
    #[builder(default = 1)]
    day_range: u64,
    #[builder(default = 100)]
    seed_schedules: usize,
    /// Options of the seeding transaction.
    #[builder(default)]
    tx_options: TxOptions,
}

impl<B> FlightBooking<B>
where
    B: Backend,
    B::Scope: BookingStore,
{
    fn seed(&self, scope: &mut B::Scope) -> Result<usize, TxError> {
        if scope.sample_schedule()?.is_some() {
            return Ok(0);
        }
        let schedules = synthetic_schedules(self.seed_schedules);
        for schedule in &schedules {
            scope.insert_schedule(schedule)?;
        }
        Ok(schedules.len())
    }
}

impl<B> Workload for FlightBooking<B>
where
    B: Backend,
    B::Scope: BookingStore,
{
    type Backend = B;

    fn name(&self) -> &str {
        "flight-booking"
    }

    fn backend(&self) -> &B {
        &self.backend
    }

    async fn setup(&self) -> Result<(), TxError> {
        let mut scope = self.backend.begin(&self.tx_options).await?;
        match self.seed(&mut scope) {
            Ok(seeded) => {
                scope.commit().await?;
                if seeded > 0 {
                    tracing::info!("Seeded {seeded} schedules.");
                } else {
                    tracing::info!("Schedules already present, nothing to seed.");
                }
                Ok(())
            }
            Err(error) => {
                if let Err(abort_error) = scope.abort().await {
                    tracing::warn!(%abort_error, "Abort of the seeding transaction failed.");
                }
                Err(error)
            }
        }
    }

    async fn iteration(&self, scope: &mut B::Scope, ctx: &LaneContext) -> Result<(), TxError> {
        let schedule = scope.sample_schedule()?.ok_or_else(|| {
            TxError::Workload(anyhow::anyhow!("no schedule to book, seed schedules first"))
        })?;
        let user_id = ctx.next_id().to_string();
        let now = now_millis();
        let day = booking_day(now, self.day_range);

        ctx.pause().await;

        scope.insert_seat(&Seat {
            user_id: user_id.clone(),
            schedule_id: schedule.id.clone(),
            date: now,
        })?;
        scope.insert_payment(&Payment {
            user_id,
            amount: payment_amount(schedule.duration.as_deref()),
            date: now,
        })?;
        scope.record_audit(&schedule.id, day, now)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        LaneExecutor, Scenario,
        aggregate::RunAggregate,
        executor::{Budget, RunSummary},
        memory::{MemoryDocClient, MemoryEngine, MemorySqlPool},
        scope::{ConnectionBackend, SessionBackend},
    };

    #[test]
    fn amount_follows_flight_time() {
        assert_eq!(payment_amount(Some("1:30")), 90 * 42);
        assert_eq!(payment_amount(Some("0:00")), 42);
        assert_eq!(payment_amount(None), 42);
        assert_eq!(payment_amount(Some("soon")), 42);
    }

    #[test]
    fn booking_day_stays_in_range() {
        let today = 20_000 * MILLIS_PER_DAY;
        for offset in 0..100 {
            let day = booking_day(today + offset, 7);
            assert!((20_000..20_007).contains(&day));
        }
        assert_eq!(booking_day(today + 5, 0), 20_000);
    }

    fn audited_seats(engine: &MemoryEngine) -> u64 {
        engine
            .scan(AUDITS)
            .iter()
            .filter_map(|(_, row)| row["seats_occupied"].as_u64())
            .sum()
    }

    async fn book<B>(workload: FlightBooking<B>, lanes: usize, bookings: u64) -> RunSummary<RunAggregate>
    where
        B: Backend,
        B::Scope: BookingStore,
    {
        Scenario::<_, _, RunAggregate>::builder()
            .name("flights")
            .workload(workload)
            .executor(
                LaneExecutor::builder()
                    .lanes(lanes)
                    .budget(Budget::count(bookings))
                    .build(),
            )
            .build()
            .run()
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_booking_lands_once_on_sessions() {
        let engine = Arc::new(MemoryEngine::new());
        let backend = SessionBackend::new(
            MemoryDocClient::new(engine.clone(), 8),
            Duration::from_secs(5),
        );
        let workload = FlightBooking::builder()
            .backend(backend)
            .seed_schedules(5)
            .build();

        let summary = book(workload, 4, 60).await;

        assert!(summary.is_success());
        assert_eq!(summary.aggregate.successes, 60);
        assert_eq!(engine.row_count(SCHEDULES), 5);
        assert_eq!(engine.row_count(SEATS), 60);
        assert_eq!(engine.row_count(PAYMENTS), 60);
        assert_eq!(audited_seats(&engine), 60);
        assert_eq!(engine.open_transactions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_booking_lands_once_on_connections() {
        let engine = Arc::new(MemoryEngine::new());
        let backend = ConnectionBackend::new(
            MemorySqlPool::new(engine.clone(), 4),
            Duration::from_secs(5),
        );
        let workload = FlightBooking::builder()
            .backend(backend)
            .seed_schedules(3)
            .day_range(2)
            .build();

        let summary = book(workload, 4, 40).await;

        assert!(summary.is_success());
        assert_eq!(summary.aggregate.successes, 40);
        assert_eq!(engine.row_count(SEATS), 40);
        assert_eq!(audited_seats(&engine), 40);
        assert_eq!(engine.open_transactions(), 0);
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let engine = Arc::new(MemoryEngine::new());
        let backend = SessionBackend::new(
            MemoryDocClient::new(engine.clone(), 1),
            Duration::from_secs(1),
        );
        let workload = FlightBooking::builder()
            .backend(backend)
            .seed_schedules(10)
            .build();

        workload.setup().await.unwrap();
        workload.setup().await.unwrap();
        assert_eq!(engine.row_count(SCHEDULES), 10);
    }

    #[tokio::test]
    async fn booking_without_schedules_is_fatal() {
        let engine = Arc::new(MemoryEngine::new());
        let backend = SessionBackend::new(
            MemoryDocClient::new(engine.clone(), 2),
            Duration::from_secs(1),
        );
        let workload = FlightBooking::builder()
            .backend(backend)
            .seed_schedules(0)
            .build();

        let summary = book(workload, 2, 10).await;

        assert!(!summary.is_success());
        assert_eq!(summary.aggregate.successes, 0);
        assert_eq!(summary.aggregate.fatal_failures, 2);
        assert_eq!(engine.row_count(SEATS), 0);
    }
}
