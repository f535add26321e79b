//! Known hosts management for SSH host key verification
//!
//! `KnownHostsStore` is an in-memory view over an OpenSSH-style `known_hosts`
//! file. `HostKeyPolicy` layers trust-on-first-use on top of it and is what
//! the client handler consults during the handshake.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::SshConfig;
use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// No key of this type stored for the host
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// known_hosts file plus its parsed cache
pub struct KnownHostsStore {
    /// host lookup key -> keys (one host may carry several key types)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let mut store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.into(),
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {:?}: {}", store.path, e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("known_hosts {:?} does not exist yet", self.path);
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) cannot be matched without the salt
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} unique hosts) from {:?}",
            entry_count,
            hosts.len(),
            self.path
        );
        Ok(())
    }

    /// Normalize a known_hosts hostname field into a lookup key.
    ///
    /// `[host]:22` collapses to `host`; other bracketed ports are kept.
    fn normalize_hostname(host: &str) -> String {
        if let Some(rest) = host.strip_prefix('[') {
            if let Some(idx) = rest.find("]:") {
                let name = &rest[..idx];
                let port = rest[idx + 2..].parse::<u16>().unwrap_or(22);
                return Self::make_key(name, port);
            }
            return rest.trim_end_matches(']').to_lowercase();
        }
        host.to_lowercase()
    }

    /// Create lookup key for host:port
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        self.verify_encoded(
            host,
            port,
            key.algorithm().as_str(),
            &BASE64.encode(key.public_key_bytes()),
        )
    }

    /// Verify a key given in known_hosts form (key type + base64 wire encoding)
    pub fn verify_encoded(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_b64: &str,
    ) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let fingerprint = fingerprint_b64(key_b64);
        let hosts = self.hosts.read();

        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        match entries.iter().find(|e| e.key_type == key_type) {
            Some(entry) if entry.key_data == key_b64 => {
                debug!("Host key verified for {} (type: {})", lookup_key, key_type);
                HostKeyVerification::Verified
            }
            Some(entry) => {
                let expected_fingerprint = fingerprint_b64(&entry.key_data);
                warn!(
                    "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                    lookup_key, key_type, expected_fingerprint, fingerprint
                );
                HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: fingerprint,
                }
            }
            None => {
                debug!(
                    "Host {} known but no {} key stored, treating as new",
                    lookup_key, key_type
                );
                HostKeyVerification::Unknown { fingerprint }
            }
        }
    }

    /// Add a new host key to known_hosts
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        self.add_encoded(
            host,
            port,
            key.algorithm().as_str(),
            &BASE64.encode(key.public_key_bytes()),
        )
    }

    pub fn add_encoded(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_b64: &str,
    ) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);

        self.append_to_file(&lookup_key, key_type, key_b64)?;

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_b64.to_string(),
            });

        info!(
            "Added host key for {} (type: {}) to {:?}",
            lookup_key, key_type, self.path
        );
        Ok(())
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{} {} {}", host, key_type, key_b64)?;
        Ok(())
    }

    /// Remove a host from known_hosts (after a legitimate key rotation)
    pub fn remove_host(&self, host: &str, port: u16) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);

        self.hosts.write().remove(&lookup_key);
        self.rewrite_without_host(&lookup_key)?;

        info!("Removed host key for {} from {:?}", lookup_key, self.path);
        Ok(())
    }

    fn rewrite_without_host(&self, remove_host: &str) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&self.path)?;

        let filtered: Vec<&str> = content
            .lines()
            .filter(|line| {
                let Some(hostnames) = line.split_whitespace().next() else {
                    return true;
                };
                if hostnames.starts_with('#') {
                    return true;
                }
                !hostnames
                    .split(',')
                    .any(|h| Self::normalize_hostname(h) == remove_host)
            })
            .collect();

        let mut out = filtered.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        fs::write(&self.path, out)?;
        Ok(())
    }
}

/// Host key acceptance rules used during the handshake
#[derive(Clone)]
pub enum HostKeyPolicy {
    /// No known_hosts configured: accept anything, loudly
    AcceptAll,
    Verify {
        store: Arc<KnownHostsStore>,
        trust_on_first_use: bool,
    },
}

impl HostKeyPolicy {
    pub fn from_config(config: &SshConfig) -> Self {
        match &config.known_hosts_path {
            Some(path) => Self::Verify {
                store: Arc::new(KnownHostsStore::with_path(path.clone())),
                trust_on_first_use: config.trust_on_first_use,
            },
            None => Self::AcceptAll,
        }
    }

    /// Decide on a server key. `Ok(())` means accept.
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        self.check_encoded(
            host,
            port,
            key.algorithm().as_str(),
            &BASE64.encode(key.public_key_bytes()),
        )
    }

    pub fn check_encoded(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_b64: &str,
    ) -> Result<(), SshError> {
        let (store, trust_on_first_use) = match self {
            HostKeyPolicy::AcceptAll => {
                warn!(
                    "Host key verification disabled for {}:{}, accepting {} key {}",
                    host,
                    port,
                    key_type,
                    fingerprint_b64(key_b64)
                );
                return Ok(());
            }
            HostKeyPolicy::Verify {
                store,
                trust_on_first_use,
            } => (store, *trust_on_first_use),
        };

        match store.verify_encoded(host, port, key_type, key_b64) {
            HostKeyVerification::Verified => Ok(()),
            HostKeyVerification::Unknown { fingerprint } if trust_on_first_use => {
                info!(
                    "TOFU: trusting new host key for {}:{} (fingerprint: {})",
                    host, port, fingerprint
                );
                store.add_encoded(host, port, key_type, key_b64)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                warn!(
                    "Unknown host key for {}:{} (fingerprint: {}), trust on first use disabled",
                    host, port, fingerprint
                );
                Err(SshError::HostKeyMismatch(format!(
                    "unknown host {}:{} with fingerprint {}",
                    host, port, fingerprint
                )))
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(SshError::HostKeyMismatch(format!(
                "key for {}:{} has changed! Expected {}, got {}. \
                 Remove the stale entry from {:?} if the change is legitimate",
                host,
                port,
                expected_fingerprint,
                actual_fingerprint,
                store.path()
            ))),
        }
    }
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

fn fingerprint_b64(key_b64: &str) -> String {
    match BASE64.decode(key_b64) {
        Ok(bytes) => fingerprint_bytes(&bytes),
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIBIBIVGPzLp0pXQ8/UfITsgBkelv0gmGrUI5TWwxFr40";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIG9nvT/CM41mPkYb4Yk8gRv+XDL/ZTm1wOiqG2+a+Rwo";

    fn policy(path: PathBuf, tofu: bool) -> HostKeyPolicy {
        HostKeyPolicy::Verify {
            store: Arc::new(KnownHostsStore::with_path(path)),
            trust_on_first_use: tofu,
        }
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(
            KnownHostsStore::normalize_hostname("Game-01.Example.net"),
            "game-01.example.net"
        );
        assert_eq!(
            KnownHostsStore::normalize_hostname("[github.com]:22"),
            "github.com"
        );
        assert_eq!(
            KnownHostsStore::normalize_hostname("[server.example.com]:2222"),
            "[server.example.com]:2222"
        );
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_tofu_persists_unknown_host() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");

        let p = policy(path.clone(), true);
        p.check_encoded("10.0.0.5", 2222, "ssh-ed25519", KEY_A).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("[10.0.0.5]:2222 ssh-ed25519 {}\n", KEY_A));

        // A fresh store sees the persisted key
        let reloaded = KnownHostsStore::with_path(path);
        assert_eq!(
            reloaded.verify_encoded("10.0.0.5", 2222, "ssh-ed25519", KEY_A),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_changed_key_rejected_even_with_tofu() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, format!("game-01 ssh-ed25519 {}\n", KEY_A)).unwrap();

        let p = policy(path.clone(), true);
        let err = p
            .check_encoded("game-01", 22, "ssh-ed25519", KEY_B)
            .unwrap_err();
        assert!(matches!(err, SshError::HostKeyMismatch(_)));

        // The stored key must not have been replaced
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains(KEY_B));
    }

    #[test]
    fn test_unknown_host_rejected_without_tofu() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let p = policy(path.clone(), false);
        let err = p
            .check_encoded("game-02", 22, "ssh-ed25519", KEY_A)
            .unwrap_err();
        assert!(matches!(err, SshError::HostKeyMismatch(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_other_key_type_is_unknown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, format!("game-01 ssh-rsa {}\n", KEY_B)).unwrap();

        let store = KnownHostsStore::with_path(path);
        assert!(matches!(
            store.verify_encoded("game-01", 22, "ssh-ed25519", KEY_A),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_hashed_entries_and_comments_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            format!(
                "# managed by ops\n|1|c2FsdA==|aGFzaA== ssh-ed25519 {}\ngame-01,10.0.0.9 ssh-ed25519 {}\n",
                KEY_B, KEY_A
            ),
        )
        .unwrap();

        let store = KnownHostsStore::with_path(path);
        assert_eq!(
            store.verify_encoded("10.0.0.9", 22, "ssh-ed25519", KEY_A),
            HostKeyVerification::Verified
        );
        assert_eq!(
            store.verify_encoded("GAME-01", 22, "ssh-ed25519", KEY_A),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_remove_host() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            format!(
                "game-01 ssh-ed25519 {}\n[game-02]:2222 ssh-ed25519 {}\n",
                KEY_A, KEY_B
            ),
        )
        .unwrap();

        let store = KnownHostsStore::with_path(path.clone());
        store.remove_host("game-02", 2222).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("game-01 ssh-ed25519 {}\n", KEY_A));
        assert!(matches!(
            store.verify_encoded("game-02", 2222, "ssh-ed25519", KEY_B),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_accept_all_policy() {
        let p = HostKeyPolicy::AcceptAll;
        assert!(p.check_encoded("anything", 22, "ssh-ed25519", KEY_A).is_ok());
    }

    #[test]
    fn test_policy_from_config() {
        let config = SshConfig::default();
        assert!(matches!(
            HostKeyPolicy::from_config(&config),
            HostKeyPolicy::AcceptAll
        ));

        let dir = tempdir().unwrap();
        let config = SshConfig {
            known_hosts_path: Some(dir.path().join("known_hosts")),
            trust_on_first_use: false,
            ..SshConfig::default()
        };
        assert!(matches!(
            HostKeyPolicy::from_config(&config),
            HostKeyPolicy::Verify {
                trust_on_first_use: false,
                ..
            }
        ));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_b64(KEY_A);
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fingerprint_b64("not base64!"), "unknown");
    }
}
