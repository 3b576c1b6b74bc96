use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

// Maps a connection id to the `https://host` prefix recorded from its
// CONNECT handshake. Requests inside an established tunnel carry only
// paths; the prefix reconstructs the true destination URL. Entries are
// owned by exactly one connection and released on teardown.
#[derive(Debug, Default)]
pub struct TunnelMap {
    entries: Mutex<HashMap<Uuid, String>>,
}

impl TunnelMap {
    pub fn record(&self, id: Uuid, authority: &str) {
        let host = authority.strip_suffix(":443").unwrap_or(authority);
        let prefix = format!("https://{host}");
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id, prefix);
        }
    }

    pub fn lookup(&self, id: Uuid) -> Option<String> {
        self.entries.lock().ok()?.get(&id).cloned()
    }

    // Called from a drop guard, so it must stay synchronous.
    pub fn release(&self, id: Uuid) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TunnelMap;
    use uuid::Uuid;

    #[test]
    fn records_prefix_with_default_port_stripped() {
        let map = TunnelMap::default();
        let id = Uuid::new_v4();

        map.record(id, "issues.example.com:443");

        assert_eq!(
            map.lookup(id),
            Some("https://issues.example.com".to_string())
        );
    }

    #[test]
    fn keeps_explicit_non_default_port() {
        let map = TunnelMap::default();
        let id = Uuid::new_v4();

        map.record(id, "issues.example.com:8443");

        assert_eq!(
            map.lookup(id),
            Some("https://issues.example.com:8443".to_string())
        );
    }

    #[test]
    fn connections_never_observe_each_other() {
        let map = TunnelMap::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        map.record(first, "one.example.com:443");
        map.record(second, "two.example.com:443");
        map.release(first);

        assert_eq!(map.lookup(first), None);
        assert_eq!(map.lookup(second), Some("https://two.example.com".to_string()));
    }

    #[test]
    fn release_is_safe_when_absent() {
        let map = TunnelMap::default();
        map.release(Uuid::new_v4());
    }
}
