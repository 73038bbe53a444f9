use crate::domain::ids::{MovementId, NegotiationId, TripId, UserId};
use crate::domain::money::Money;
use crate::domain::movement::{BalanceDelta, MoneyMovement, MovementSlot, MovementState};
use crate::domain::negotiation::{NegotiationRecord, OfferOutcome};
use crate::domain::ports::{MoneyStore, TripStore};
use crate::domain::trip::{Trip, TripStatus};
use crate::error::{Result, TripError};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for trip rows, keyed by trip id.
pub const CF_TRIPS: &str = "trips";
/// Column Family for negotiation records, keyed by trip id then sequence.
pub const CF_NEGOTIATIONS: &str = "negotiations";
/// Column Family for money movements, keyed by movement id.
pub const CF_MOVEMENTS: &str = "movements";
/// Column Family mapping gateway references to movement ids.
pub const CF_MOVEMENT_REFS: &str = "movement_refs";
/// Column Family for provider balances, keyed by user id.
pub const CF_BALANCES: &str = "balances";

const COLUMN_FAMILIES: [&str; 5] = [
    CF_TRIPS,
    CF_NEGOTIATIONS,
    CF_MOVEMENTS,
    CF_MOVEMENT_REFS,
    CF_BALANCES,
];

/// A persistent trip and money store on RocksDB.
///
/// Conditional writes take an in-process lock for their read-check-write
/// sequence and commit through a single `WriteBatch`, so a movement
/// settlement and its balance delta land together or not at all. The
/// lock only covers this process: one `RocksDbStore` owns a database
/// directory at a time.
///
/// `Clone` shares the underlying `Arc<DB>` and lock.
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDbStore {
    /// Opens or creates a database at `path` with every column family the
    /// stores need.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            TripError::Internal(Box::new(std::io::Error::other(format!(
                "column family {name} not found"
            ))))
        })
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &'static str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &'static str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        batch.put_cf(self.cf(cf)?, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn scan_json<T: DeserializeOwned>(&self, cf: &'static str, prefix: &[u8]) -> Result<Vec<T>> {
        let mode = IteratorMode::From(prefix, Direction::Forward);
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn all_movements(&self) -> Result<Vec<MoneyMovement>> {
        self.scan_json(CF_MOVEMENTS, &[])
    }

    fn read_balance(&self, account: &UserId) -> Result<Money> {
        Ok(self
            .get_json(CF_BALANCES, account.as_str().as_bytes())?
            .unwrap_or_default())
    }

    /// Stages `delta` into `batch` and returns the resulting balance.
    fn stage_delta(&self, batch: &mut WriteBatch, delta: &BalanceDelta) -> Result<Money> {
        let balance = self.read_balance(&delta.account)?.checked_add(delta.delta)?;
        self.put_json(batch, CF_BALANCES, delta.account.as_str().as_bytes(), &balance)?;
        Ok(balance)
    }
}

fn negotiation_key(trip_id: TripId, seq: u32) -> Vec<u8> {
    let mut key = trip_id.0.as_bytes().to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

#[async_trait]
impl TripStore for RocksDbStore {
    async fn insert_trip(&self, trip: Trip) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = trip.id.0.as_bytes();
        if self.get_json::<Trip>(CF_TRIPS, key)?.is_some() {
            return Err(TripError::Conflict(format!("trip {} already exists", trip.id)));
        }
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_TRIPS, key, &trip)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn load_trip(&self, id: TripId) -> Result<Option<Trip>> {
        self.get_json(CF_TRIPS, id.0.as_bytes())
    }

    async fn all_trips(&self) -> Result<Vec<Trip>> {
        self.scan_json(CF_TRIPS, &[])
    }

    async fn save_trip_if(&self, trip: &Trip, expected: TripStatus) -> Result<Option<Trip>> {
        let _guard = self.write_lock.lock().await;
        let key = trip.id.0.as_bytes();
        let Some(current) = self.get_json::<Trip>(CF_TRIPS, key)? else {
            return Err(TripError::not_found("trip", trip.id));
        };
        if current.status != expected || current.version != trip.version {
            return Ok(None);
        }
        let mut saved = trip.clone();
        saved.version += 1;
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_TRIPS, key, &saved)?;
        self.db.write(batch)?;
        Ok(Some(saved))
    }

    async fn increment_boarded_if(&self, id: TripId, count: u32) -> Result<Option<Trip>> {
        let _guard = self.write_lock.lock().await;
        let key = id.0.as_bytes();
        let Some(mut trip) = self.get_json::<Trip>(CF_TRIPS, key)? else {
            return Err(TripError::not_found("trip", id));
        };
        let Some(boarded) = trip.boarded_count.checked_add(count) else {
            return Ok(None);
        };
        if trip.status != TripStatus::Arrived || boarded > trip.total_passengers {
            return Ok(None);
        }
        trip.boarded_count = boarded;
        trip.version += 1;
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_TRIPS, key, &trip)?;
        self.db.write(batch)?;
        Ok(Some(trip))
    }

    async fn negotiations(&self, trip_id: TripId) -> Result<Vec<NegotiationRecord>> {
        self.scan_json(CF_NEGOTIATIONS, trip_id.0.as_bytes())
    }

    async fn append_negotiation(
        &self,
        mut record: NegotiationRecord,
        expected_newest: Option<NegotiationId>,
    ) -> Result<Option<NegotiationRecord>> {
        let _guard = self.write_lock.lock().await;
        let log: Vec<NegotiationRecord> =
            self.scan_json(CF_NEGOTIATIONS, record.trip_id.0.as_bytes())?;
        if log.last().map(|r| r.id) != expected_newest {
            return Ok(None);
        }

        let mut batch = WriteBatch::default();
        if let Some(newest) = log.last()
            && newest.is_pending()
        {
            let mut superseded = newest.clone();
            superseded.outcome = OfferOutcome::Superseded;
            let key = negotiation_key(superseded.trip_id, superseded.seq);
            self.put_json(&mut batch, CF_NEGOTIATIONS, &key, &superseded)?;
        }
        record.seq = log.len() as u32;
        let key = negotiation_key(record.trip_id, record.seq);
        self.put_json(&mut batch, CF_NEGOTIATIONS, &key, &record)?;
        self.db.write(batch)?;
        Ok(Some(record))
    }

    async fn resolve_negotiation_if(
        &self,
        trip_id: TripId,
        record_id: NegotiationId,
        outcome: OfferOutcome,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let log: Vec<NegotiationRecord> = self.scan_json(CF_NEGOTIATIONS, trip_id.0.as_bytes())?;
        let Some(newest) = log.last() else {
            return Ok(false);
        };
        if newest.id != record_id || !newest.is_pending() {
            return Ok(false);
        }
        let mut resolved = newest.clone();
        resolved.outcome = outcome;
        let mut batch = WriteBatch::default();
        let key = negotiation_key(trip_id, resolved.seq);
        self.put_json(&mut batch, CF_NEGOTIATIONS, &key, &resolved)?;
        self.db.write(batch)?;
        Ok(true)
    }
}

#[async_trait]
impl MoneyStore for RocksDbStore {
    async fn open_movement_unique(
        &self,
        movement: MoneyMovement,
        delta: Option<BalanceDelta>,
    ) -> Result<MovementSlot> {
        let _guard = self.write_lock.lock().await;
        if let Some(trip_id) = movement.trip_id
            && let Some(existing) = self.all_movements()?.into_iter().find(|m| {
                m.trip_id == Some(trip_id)
                    && m.direction == movement.direction
                    && m.direction.holds_trip_slot(m.state)
            })
        {
            return Ok(MovementSlot::from_existing(existing));
        }

        let mut batch = WriteBatch::default();
        if let Some(delta) = &delta {
            self.stage_delta(&mut batch, delta)?;
        }
        self.put_json(&mut batch, CF_MOVEMENTS, movement.id.0.as_bytes(), &movement)?;
        self.db.write(batch)?;
        Ok(MovementSlot::Opened(movement))
    }

    async fn insert_movement(
        &self,
        movement: MoneyMovement,
        delta: Option<BalanceDelta>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = movement.id.0.as_bytes();
        if self.get_json::<MoneyMovement>(CF_MOVEMENTS, key)?.is_some() {
            return Err(TripError::Conflict(format!(
                "movement {} already exists",
                movement.id
            )));
        }

        let mut batch = WriteBatch::default();
        if let Some(delta) = &delta {
            let balance = self.read_balance(&delta.account)?;
            let after = self.stage_delta(&mut batch, delta)?;
            if delta.delta < Money::ZERO && after < Money::ZERO {
                return Err(TripError::InsufficientFunds {
                    balance: balance.minor_units(),
                    requested: delta.delta.negate().minor_units(),
                });
            }
        }
        self.put_json(&mut batch, CF_MOVEMENTS, key, &movement)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn load_movement(&self, id: MovementId) -> Result<Option<MoneyMovement>> {
        self.get_json(CF_MOVEMENTS, id.0.as_bytes())
    }

    async fn load_movement_by_ref(&self, reference: &str) -> Result<Option<MoneyMovement>> {
        let Some(id) = self.get_json::<MovementId>(CF_MOVEMENT_REFS, reference.as_bytes())? else {
            return Ok(None);
        };
        self.get_json(CF_MOVEMENTS, id.0.as_bytes())
    }

    async fn movements_for_trip(&self, trip_id: TripId) -> Result<Vec<MoneyMovement>> {
        Ok(self
            .all_movements()?
            .into_iter()
            .filter(|m| m.trip_id == Some(trip_id))
            .collect())
    }

    async fn attach_reference(&self, id: MovementId, reference: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if let Some(owner) = self.get_json::<MovementId>(CF_MOVEMENT_REFS, reference.as_bytes())? {
            if owner == id {
                return Ok(true);
            }
            return Err(TripError::Conflict(format!(
                "reference {reference} already belongs to movement {owner}"
            )));
        }
        let Some(mut movement) = self.get_json::<MoneyMovement>(CF_MOVEMENTS, id.0.as_bytes())?
        else {
            return Err(TripError::not_found("movement", id));
        };
        if movement.external_reference.is_some() {
            return Ok(false);
        }
        movement.external_reference = Some(reference.to_string());

        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_MOVEMENTS, id.0.as_bytes(), &movement)?;
        self.put_json(&mut batch, CF_MOVEMENT_REFS, reference.as_bytes(), &id)?;
        self.db.write(batch)?;
        Ok(true)
    }

    async fn settle_movement_if(
        &self,
        id: MovementId,
        expected: MovementState,
        next: MovementState,
        delta: Option<BalanceDelta>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut movement) = self.get_json::<MoneyMovement>(CF_MOVEMENTS, id.0.as_bytes())?
        else {
            return Err(TripError::not_found("movement", id));
        };
        if movement.state != expected {
            return Ok(false);
        }
        movement.state = next;
        movement.settled_at = Some(Utc::now());

        let mut batch = WriteBatch::default();
        if let Some(delta) = &delta {
            self.stage_delta(&mut batch, delta)?;
        }
        self.put_json(&mut batch, CF_MOVEMENTS, id.0.as_bytes(), &movement)?;
        self.db.write(batch)?;
        Ok(true)
    }

    async fn balance(&self, account: &UserId) -> Result<Money> {
        self.read_balance(account)
    }

    async fn adjust_balance(&self, account: &UserId, delta: Money) -> Result<Money> {
        let _guard = self.write_lock.lock().await;
        let mut batch = WriteBatch::default();
        let balance = self.stage_delta(
            &mut batch,
            &BalanceDelta {
                account: account.clone(),
                delta,
            },
        )?;
        self.db.write(batch)?;
        Ok(balance)
    }

    async fn balances(&self) -> Result<Vec<(UserId, Money)>> {
        let mut balances = HashMap::new();
        for item in self.db.iterator_cf(self.cf(CF_BALANCES)?, IteratorMode::Start) {
            let (key, value) = item?;
            let account = UserId::new(String::from_utf8_lossy(&key).into_owned());
            balances.insert(account, serde_json::from_slice::<Money>(&value)?);
        }
        let mut all: Vec<(UserId, Money)> = balances.into_iter().collect();
        all.sort();
        Ok(all)
    }
}
