//! Kick and ban bookkeeping.
//!
//! Expiries live in one table under composite string keys: `"KICK"` plus the
//! player uuid for timed kicks, `"BAN"` plus the remote ip for bans. A value
//! is the epoch second the entry stops applying, `i64::MAX` meaning forever.
//! Entries already expired are treated as absent and evicted lazily on the
//! read that finds them; there is no sweeper.

use dashmap::DashMap;
use waypoint_net::current_millis;

pub const KICK_PREFIX: &str = "KICK";
pub const BAN_PREFIX: &str = "BAN";

/// Seconds a kicked player stays out.
pub const KICK_COOLDOWN_SECS: i64 = 60;

/// Bans are refused once the game has been running longer than this.
pub const BAN_GRACE_SECS: i64 = 300;

pub const FOREVER: i64 = i64::MAX;

/// Seconds since the epoch, the clock the expiry table runs on.
pub fn epoch_secs() -> i64 {
    current_millis() / 1000
}

#[derive(Debug, Default)]
pub struct BanTable {
    entries: DashMap<String, i64>,
}

impl BanTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Keep `uuid` out until the kick cooldown elapses.
    pub fn kick(&self, uuid: &str, now: i64) {
        self.entries
            .insert(format!("{KICK_PREFIX}{uuid}"), now + KICK_COOLDOWN_SECS);
    }

    /// Keep `uuid` out permanently.
    pub fn kick_forever(&self, uuid: &str) {
        self.entries.insert(format!("{KICK_PREFIX}{uuid}"), FOREVER);
    }

    /// Keep `ip` out permanently.
    pub fn ban_ip(&self, ip: &str) {
        self.entries.insert(format!("{BAN_PREFIX}{ip}"), FOREVER);
    }

    pub fn is_kicked_at(&self, uuid: &str, now: i64) -> bool {
        self.active(&format!("{KICK_PREFIX}{uuid}"), now)
    }

    pub fn is_banned_at(&self, ip: &str, now: i64) -> bool {
        self.active(&format!("{BAN_PREFIX}{ip}"), now)
    }

    /// The admission gate: neither the uuid nor the ip is blocked at `now`.
    pub fn admits(&self, uuid: &str, ip: &str, now: i64) -> bool {
        !self.is_kicked_at(uuid, now) && !self.is_banned_at(ip, now)
    }

    /// Drop every entry whose expiry has passed.
    pub fn cleanup_expired(&self, now: i64) {
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn active(&self, key: &str, now: i64) -> bool {
        // The guard must drop before the removal below can make progress.
        let expired = match self.entries.get(key) {
            Some(entry) => *entry.value() <= now,
            None => return false,
        };
        if expired {
            self.entries.remove(key);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kicks_expire_after_the_cooldown() {
        let table = BanTable::new();
        let now = 1_000;
        table.kick("uuid-1", now);

        assert!(table.is_kicked_at("uuid-1", now));
        assert!(table.is_kicked_at("uuid-1", now + KICK_COOLDOWN_SECS - 1));
        assert!(!table.is_kicked_at("uuid-1", now + KICK_COOLDOWN_SECS));
        // The expired read evicted the entry.
        assert!(table.is_empty());
    }

    #[test]
    fn bans_never_expire() {
        let table = BanTable::new();
        table.ban_ip("10.0.0.9");
        assert!(table.is_banned_at("10.0.0.9", 0));
        assert!(table.is_banned_at("10.0.0.9", i64::MAX - 1));
    }

    #[test]
    fn admission_checks_both_keys() {
        let table = BanTable::new();
        let now = 50;
        assert!(table.admits("uuid-1", "10.0.0.9", now));

        table.kick("uuid-1", now);
        assert!(!table.admits("uuid-1", "10.0.0.9", now));
        assert!(table.admits("uuid-2", "10.0.0.9", now));

        table.ban_ip("10.0.0.9");
        assert!(!table.admits("uuid-2", "10.0.0.9", now));
        assert!(table.admits("uuid-2", "10.0.0.8", now));
    }

    #[test]
    fn cleanup_drops_only_expired_entries() {
        let table = BanTable::new();
        table.kick("old", 0);
        table.kick("fresh", 10_000);
        table.ban_ip("10.0.0.9");

        table.cleanup_expired(10_000);
        assert_eq!(table.len(), 2);
        assert!(table.is_kicked_at("fresh", 10_000 + 1));
        assert!(table.is_banned_at("10.0.0.9", 10_000));
    }

    #[test]
    fn uuid_and_ip_keyspaces_do_not_collide() {
        let table = BanTable::new();
        table.ban_ip("same");
        assert!(!table.is_kicked_at("same", 0));
        assert!(table.is_banned_at("same", 0));
    }
}
