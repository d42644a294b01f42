//! Integration tests for the quota ledger: atomic reservations, window reset, migration

use crate::integration::test_utils::{manual_clock, throttle};
use cadence::clock::Clock;
use cadence::error::QuotaError;
use cadence::quota::{MigrationOutcome, QuotaConfig, QuotaLedger, Reservation};
use std::sync::Arc;
use std::thread;

fn ledger(db: &sled::Db, cap: u64) -> (Arc<QuotaLedger>, Arc<cadence::clock::ManualClock>) {
    let clock = manual_clock();
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let config = QuotaConfig {
        daily_tokens: cap,
        ..QuotaConfig::default()
    };
    let ledger = QuotaLedger::open(db, config, dyn_clock, throttle()).unwrap();
    (Arc::new(ledger), clock)
}

#[test]
fn concurrent_reservations_never_exceed_the_cap() {
    let db = cadence::store::open_temporary().unwrap();
    let (ledger, _) = ledger(&db, 1_000);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                (0..50)
                    .filter(|_| ledger.reserve("anon-race", 10).is_ok())
                    .count()
            })
        })
        .collect();
    let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(granted, 100);
    let usage = ledger.usage("anon-race").unwrap();
    assert_eq!(usage.tokens_used, 1_000);
    assert_eq!(usage.remaining, 0);
}

#[test]
fn rejection_leaves_usage_unchanged() {
    let db = cadence::store::open_temporary().unwrap();
    let (ledger, _) = ledger(&db, 100);

    assert_eq!(
        ledger.reserve("user-1", 60).unwrap(),
        Reservation::Granted {
            tokens_used: 60,
            remaining: 40
        }
    );
    let err = ledger.reserve("user-1", 41).unwrap_err();
    assert!(matches!(
        err,
        QuotaError::Exceeded {
            used: 60,
            requested: 41,
            cap: 100,
            ..
        }
    ));
    assert_eq!(ledger.usage("user-1").unwrap().tokens_used, 60);
    assert_eq!(ledger.remaining("user-1").unwrap(), 40);
    assert!(ledger.reserve("user-1", 40).is_ok());
    assert_eq!(ledger.remaining("user-1").unwrap(), 0);
}

#[test]
fn window_resets_after_expiry() {
    let db = cadence::store::open_temporary().unwrap();
    let (ledger, clock) = ledger(&db, 100);

    ledger.reserve("user-1", 100).unwrap();
    assert!(ledger.reserve("user-1", 1).is_err());
    let usage = ledger.usage("user-1").unwrap();
    assert_eq!(
        usage.resets_at,
        usage.window_start.map(|s| s + chrono::Duration::hours(24))
    );

    clock.advance(chrono::Duration::hours(23));
    assert!(ledger.reserve("user-1", 1).is_err());

    clock.advance(chrono::Duration::hours(2));
    assert_eq!(ledger.usage("user-1").unwrap().tokens_used, 0);
    assert_eq!(
        ledger.reserve("user-1", 30).unwrap(),
        Reservation::Granted {
            tokens_used: 30,
            remaining: 70
        }
    );
}

#[test]
fn migration_is_applied_once() {
    let db = cadence::store::open_temporary().unwrap();
    let (ledger, _) = ledger(&db, 100);

    ledger.reserve("anon-1", 80).unwrap();
    ledger.reserve("user-1", 50).unwrap();

    assert_eq!(
        ledger.migrate("anon-1", "user-1").unwrap(),
        MigrationOutcome::Applied
    );
    assert_eq!(ledger.usage("user-1").unwrap().tokens_used, 0);
    assert_eq!(ledger.usage("anon-1").unwrap().tokens_used, 0);

    ledger.reserve("user-1", 20).unwrap();
    assert_eq!(
        ledger.migrate("anon-1", "user-1").unwrap(),
        MigrationOutcome::AlreadyApplied
    );
    assert_eq!(ledger.usage("user-1").unwrap().tokens_used, 20);

    assert_eq!(
        ledger.migrate("user-1", "user-1").unwrap(),
        MigrationOutcome::SameIdentity
    );
    assert!(ledger.migrate_best_effort("", "user-1").is_none());
}

#[test]
fn usage_survives_reopening_the_store() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    {
        let db = cadence::store::open_db(&path).unwrap();
        let (ledger, _) = ledger(&db, 100);
        ledger.reserve("user-1", 25).unwrap();
        db.flush().unwrap();
    }
    let db = cadence::store::open_db(&path).unwrap();
    let (ledger, _) = ledger(&db, 100);
    assert_eq!(ledger.usage("user-1").unwrap().tokens_used, 25);
}

#[test]
fn disabled_and_bypassed_reservations_skip_the_ledger() {
    let db = cadence::store::open_temporary().unwrap();
    let clock: Arc<dyn Clock> = manual_clock();
    let config = QuotaConfig {
        enabled: false,
        ..QuotaConfig::default()
    };
    let ledger = QuotaLedger::open(&db, config, clock, throttle()).unwrap();
    assert_eq!(ledger.reserve("anon-1", 1_000_000).unwrap(), Reservation::Disabled);

    let (ledger, _) = self::ledger(&db, 10);
    assert_eq!(
        ledger.reserve_for("sub-1", 1_000, true).unwrap(),
        Reservation::Bypassed
    );
    assert!(ledger.window("sub-1").unwrap().is_none());
    assert!(matches!(
        ledger.reserve(" ", 1),
        Err(QuotaError::InvalidIdentity(_))
    ));
}
