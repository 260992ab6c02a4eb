use hvacd::cache::*;
use std::sync::Arc;
use std::thread;

#[test]
fn test_versions_strictly_increase() {
    let cache = BoardStateCache::new(["space_temp", "space_rh"]);
    let mut last = cache.version();

    for i in 0..20 {
        let point = if i % 2 == 0 { "space_temp" } else { "space_rh" };
        let version = cache.update(point, f64::from(i), i as u64).unwrap();
        assert!(version > last);
        last = version;
    }
    assert_eq!(cache.version(), last);
    assert_eq!(cache.read_all().version, last);
}

#[test]
fn test_concurrent_writers_never_reuse_a_version() {
    let points: Vec<String> = (0..4).map(|i| format!("p{}", i)).collect();
    let cache = Arc::new(BoardStateCache::new(points.clone()));

    let writers: Vec<_> = points
        .into_iter()
        .map(|point| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                (0..250)
                    .map(|i| cache.update(&point, f64::from(i), 0).unwrap())
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut versions: Vec<u64> = writers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    versions.sort_unstable();
    versions.dedup();

    // Every write got its own version and none were skipped
    assert_eq!(versions.len(), 1_000);
    assert_eq!(versions.first(), Some(&1));
    assert_eq!(cache.version(), 1_000);
}

#[test]
fn test_snapshot_is_consistent_copy() {
    let cache = BoardStateCache::new(["space_temp", "supply_temp"]);
    cache.update("space_temp", 20.5, 1);
    cache.update("supply_temp", 35.0, 2);

    let snapshot = cache.read_all();
    cache.update("space_temp", 22.0, 3);

    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.value("space_temp"), Some(20.5));
    assert!(snapshot.entries.values().all(|e| e.version <= snapshot.version));
    assert_eq!(cache.read("space_temp").unwrap().value, 22.0);
}

#[test]
fn test_force_unknown_point_fails() {
    let cache = BoardStateCache::new(["heater"]);
    assert_eq!(
        cache.force("bogus", 1.0),
        Err(CacheError::UnknownPoint("bogus".into()))
    );
    assert!(cache.unforce("bogus").is_err());
    assert!(!cache.unforce("heater").unwrap());
}

#[test]
fn test_force_before_any_reading_creates_entry() {
    let cache = BoardStateCache::new(["space_temp"]);
    let version = cache.force("space_temp", 15.0).unwrap();

    let entry = cache.read("space_temp").unwrap();
    assert_eq!(entry.value, 15.0);
    assert_eq!(entry.version, version);
    assert!(entry.forced);
    assert!(cache.is_forced("space_temp"));
}
