use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use super::types::{LeafCertificate, TlsError, TlsErrorKind};

// LRU cache of minted leaf certificates, optionally backed by a directory
// so leaves survive restarts alongside the CA they were signed with.
#[derive(Debug)]
pub struct LeafCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, LeafCertificate>,
    disk_dir: Option<PathBuf>,
}

impl LeafCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
            disk_dir: None,
        }
    }

    pub fn with_disk_dir(capacity: usize, dir: impl AsRef<Path>) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
            disk_dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    pub fn fetch(&mut self, host: &str) -> Option<LeafCertificate> {
        if let Some(cert) = self.entries.get(host).cloned() {
            self.touch(host);
            return Some(cert);
        }
        let dir = self.disk_dir.clone()?;
        let cert = load_leaf(&dir, host).ok()?;
        self.remember(host, cert.clone());
        Some(cert)
    }

    pub fn store(&mut self, host: &str, cert: &LeafCertificate) -> Result<(), TlsError> {
        if let Some(dir) = &self.disk_dir {
            persist_leaf(dir, host, cert)?;
        }
        self.remember(host, cert.clone());
        Ok(())
    }

    fn remember(&mut self, host: &str, cert: LeafCertificate) {
        if !self.entries.contains_key(host) {
            self.order.push_back(host.to_string());
        }
        self.entries.insert(host.to_string(), cert);
        self.touch(host);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn touch(&mut self, host: &str) {
        if let Some(at) = self.order.iter().position(|entry| entry == host) {
            self.order.remove(at);
            self.order.push_back(host.to_string());
        }
    }
}

fn leaf_paths(dir: &Path, host: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{host}.pem")),
        dir.join(format!("{host}.key")),
    )
}

fn persist_leaf(dir: &Path, host: &str, cert: &LeafCertificate) -> Result<(), TlsError> {
    fs::create_dir_all(dir).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    let (cert_path, key_path) = leaf_paths(dir, host);
    fs::write(cert_path, &cert.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    fs::write(key_path, &cert.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    Ok(())
}

fn load_leaf(dir: &Path, host: &str) -> Result<LeafCertificate, TlsError> {
    let (cert_path, key_path) = leaf_paths(dir, host);
    let cert_pem =
        fs::read(cert_path).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    let key_pem =
        fs::read(key_path).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    Ok(LeafCertificate { cert_pem, key_pem })
}

#[cfg(test)]
mod tests {
    use super::LeafCache;
    use crate::tls::LeafCertificate;

    fn sample_leaf(tag: &str) -> LeafCertificate {
        LeafCertificate {
            cert_pem: format!("cert-{tag}").into_bytes(),
            key_pem: format!("key-{tag}").into_bytes(),
        }
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LeafCache::new(2);
        cache.store("a.example.com", &sample_leaf("a")).unwrap();
        cache.store("b.example.com", &sample_leaf("b")).unwrap();
        assert!(cache.fetch("a.example.com").is_some());

        cache.store("c.example.com", &sample_leaf("c")).unwrap();

        assert!(cache.fetch("b.example.com").is_none());
        assert!(cache.fetch("a.example.com").is_some());
        assert!(cache.fetch("c.example.com").is_some());
    }

    #[test]
    fn reloads_persisted_leaf_from_disk() {
        let dir = tempfile::tempdir().unwrap();

        let mut writer = LeafCache::with_disk_dir(8, dir.path());
        writer.store("a.example.com", &sample_leaf("a")).unwrap();

        let mut reader = LeafCache::with_disk_dir(8, dir.path());
        let cert = reader.fetch("a.example.com").expect("persisted leaf");
        assert_eq!(cert.cert_pem, b"cert-a");
    }
}
