//! Router reputation profiles.
//!
//! Clients track, per router, how often connects and path builds succeed, and
//! skip routers that look bad when picking hops. Relays do not profile.
//! Profiles persist to `profiles.dat` through the disk worker on an interval.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::identity::RouterId;

/// Interval between profile saves.
pub const PROFILE_SAVE_INTERVAL: u64 = 60 * 1000;

/// Profiles untouched for this long are dropped at tick.
const PROFILE_STALE_AFTER: u64 = 24 * 60 * 60 * 1000;

/// A router is "bad" once its recent failure ratio crosses this bound with a
/// minimal sample size.
const BAD_RATIO: f64 = 0.75;
const MIN_SAMPLES: u64 = 4;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouterProfile {
    pub connect_success: u64,
    pub connect_timeout: u64,
    pub path_success: u64,
    pub path_fail: u64,
    pub last_updated: u64,
}

impl RouterProfile {
    fn total(&self) -> u64 {
        self.connect_success + self.connect_timeout + self.path_success + self.path_fail
    }

    fn failures(&self) -> u64 {
        self.connect_timeout + self.path_fail
    }

    pub fn is_bad(&self) -> bool {
        let total = self.total();
        if total < MIN_SAMPLES {
            return false;
        }
        self.failures() as f64 / total as f64 >= BAD_RATIO
    }
}

#[derive(Default, Serialize, Deserialize)]
pub struct Profiling {
    #[serde(skip)]
    enabled: bool,
    profiles: HashMap<RouterId, RouterProfile>,
    #[serde(skip)]
    last_save: u64,
    #[serde(skip)]
    dirty: bool,
}

impl Profiling {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn touch(&mut self, id: &RouterId, now: u64) -> Option<&mut RouterProfile> {
        if !self.enabled {
            return None;
        }
        self.dirty = true;
        let profile = self.profiles.entry(*id).or_default();
        profile.last_updated = now;
        Some(profile)
    }

    pub fn connect_succeeded(&mut self, id: &RouterId, now: u64) {
        if let Some(p) = self.touch(id, now) {
            p.connect_success += 1;
        }
    }

    pub fn connect_timed_out(&mut self, id: &RouterId, now: u64) {
        if let Some(p) = self.touch(id, now) {
            p.connect_timeout += 1;
        }
    }

    pub fn path_succeeded(&mut self, id: &RouterId, now: u64) {
        if let Some(p) = self.touch(id, now) {
            p.path_success += 1;
        }
    }

    pub fn path_failed(&mut self, id: &RouterId, now: u64) {
        if let Some(p) = self.touch(id, now) {
            p.path_fail += 1;
        }
    }

    /// Whether hop selection should avoid this router.
    pub fn is_bad(&self, id: &RouterId) -> bool {
        self.enabled
            && self
                .profiles
                .get(id)
                .map(|p| p.is_bad())
                .unwrap_or(false)
    }

    /// Drop stale profiles.
    pub fn tick(&mut self, now: u64) {
        self.profiles
            .retain(|_, p| now.saturating_sub(p.last_updated) < PROFILE_STALE_AFTER);
    }

    pub fn should_save(&self, now: u64) -> bool {
        self.enabled && self.dirty && now.saturating_sub(self.last_save) > PROFILE_SAVE_INTERVAL
    }

    /// Serialized form for the disk worker; clears the dirty flag.
    pub fn save_snapshot(&mut self, now: u64) -> Vec<u8> {
        self.last_save = now;
        self.dirty = false;
        bincode::serialize(&self.profiles).expect("profile serialization is infallible")
    }

    pub fn load(&mut self, path: &Path) {
        let Ok(bytes) = std::fs::read(path) else {
            return;
        };
        if let Ok(profiles) = crate::messages::deserialize_bounded(&bytes) {
            self.profiles = profiles;
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Disk-worker half of a profile save.
pub fn write_profiles(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> RouterId {
        RouterId::from_bytes([b; 32])
    }

    #[test]
    fn disabled_profiling_records_nothing() {
        let mut p = Profiling::new(false);
        p.connect_timed_out(&id(1), 100);
        assert!(p.is_empty());
        assert!(!p.is_bad(&id(1)));
    }

    #[test]
    fn repeated_failures_mark_bad() {
        let mut p = Profiling::new(true);
        for _ in 0..4 {
            p.connect_timed_out(&id(1), 100);
        }
        assert!(p.is_bad(&id(1)));
        assert!(!p.is_bad(&id(2)));
    }

    #[test]
    fn mixed_record_below_ratio_is_fine() {
        let mut p = Profiling::new(true);
        for _ in 0..6 {
            p.path_succeeded(&id(1), 100);
        }
        p.path_failed(&id(1), 100);
        assert!(!p.is_bad(&id(1)));
    }

    #[test]
    fn tick_drops_stale_profiles() {
        let mut p = Profiling::new(true);
        p.connect_succeeded(&id(1), 1000);
        p.tick(1000 + PROFILE_STALE_AFTER + 1);
        assert!(p.is_empty());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.dat");

        let mut p = Profiling::new(true);
        for _ in 0..4 {
            p.connect_timed_out(&id(9), 500);
        }
        assert!(p.should_save(500 + PROFILE_SAVE_INTERVAL + 1));
        let bytes = p.save_snapshot(500 + PROFILE_SAVE_INTERVAL + 1);
        write_profiles(&path, &bytes).unwrap();

        let mut reloaded = Profiling::new(true);
        reloaded.load(&path);
        assert!(reloaded.is_bad(&id(9)));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn should_save_respects_interval_and_dirtiness() {
        let mut p = Profiling::new(true);
        assert!(!p.should_save(u64::MAX), "clean profiles never save");

        p.path_succeeded(&id(1), 0);
        assert!(!p.should_save(PROFILE_SAVE_INTERVAL / 2));
        assert!(p.should_save(PROFILE_SAVE_INTERVAL + 1));

        let _ = p.save_snapshot(PROFILE_SAVE_INTERVAL + 1);
        assert!(!p.should_save(PROFILE_SAVE_INTERVAL + 2));
    }
}
