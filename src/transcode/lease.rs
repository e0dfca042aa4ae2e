//! Cross-process generation locks.
//!
//! A lock is a file `{dir}/{digest}.lock` created with `O_EXCL`, holding a JSON
//! lease: owner token, pid, host and expiry. Holders renew the lease while they
//! work. A lease whose expiry has passed, or whose holder process on this host
//! is gone, is stale and may be taken over, so a crashed generator never wedges
//! its key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::Result;

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseInfo {
    owner: String,
    pid: u32,
    host: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Issues [`Lease`]s on artifact digests.
#[derive(Debug, Clone)]
pub struct LeaseRegistry {
    dir: PathBuf,
    lease: Duration,
    host: String,
}

impl LeaseRegistry {
    pub fn new(dir: impl Into<PathBuf>, lease: Duration) -> Self {
        Self {
            dir: dir.into(),
            lease,
            host: hostname(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", digest))
    }

    /// Try to take the lock on `digest` without waiting.
    ///
    /// Returns `Ok(None)` while another live holder has it.
    pub fn try_acquire(&self, digest: &str) -> Result<Option<Lease>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(digest);

        // Two rounds: a stale lease is removed in the first, taken in the second
        for _ in 0..2 {
            let info = self.new_info();
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let written = serde_json::to_vec(&info)
                        .map_err(io::Error::from)
                        .and_then(|json| file.write_all(&json));
                    if let Err(e) = written {
                        let _ = fs::remove_file(&path);
                        return Err(e.into());
                    }
                    return Ok(Some(Lease {
                        path,
                        info,
                        lease: self.lease,
                        renewed: Instant::now(),
                        released: false,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match self.current_holder(&path) {
                        Holder::Live => return Ok(None),
                        Holder::Gone => continue,
                        Holder::Stale(stale) => {
                            if !self.evict(&path, &stale)? {
                                return Ok(None);
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    /// Whether a live lease is held on `digest` by anyone.
    pub fn is_held(&self, digest: &str) -> bool {
        matches!(self.current_holder(&self.lock_path(digest)), Holder::Live)
    }

    fn new_info(&self) -> LeaseInfo {
        let now = Utc::now();
        LeaseInfo {
            owner: new_token(&self.host),
            pid: std::process::id(),
            host: self.host.clone(),
            acquired_at: now,
            expires_at: expiry(now, self.lease),
        }
    }

    fn current_holder(&self, path: &Path) -> Holder {
        match read_info(path) {
            Ok(Some(info)) if self.is_stale(&info) => Holder::Stale(info),
            Ok(Some(_)) => Holder::Live,
            Ok(None) => Holder::Gone,
            // Unparseable: either mid-write by its creator or a torn file
            // from a crash. Judge by age.
            Err(_) => {
                let age = fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok());
                match age {
                    Some(age) if age > self.lease => Holder::Stale(LeaseInfo {
                        owner: String::new(),
                        pid: 0,
                        host: String::new(),
                        acquired_at: Utc::now(),
                        expires_at: Utc::now(),
                    }),
                    _ => Holder::Live,
                }
            }
        }
    }

    fn is_stale(&self, info: &LeaseInfo) -> bool {
        if Utc::now() >= info.expires_at {
            return true;
        }
        info.host == self.host && !pid_alive(info.pid)
    }

    /// Remove the stale lock at `path`, checking nobody replaced it meanwhile.
    ///
    /// The lock is renamed to a private tombstone first; if the tombstone turns
    /// out not to be the stale lease that was judged, it is put back.
    fn evict(&self, path: &Path, stale: &LeaseInfo) -> Result<bool> {
        let tombstone = path.with_extension(format!("lock.{}.stale", new_token(&self.host)));
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let taken = match read_info(&tombstone) {
            Ok(Some(info)) => info.owner == stale.owner,
            Ok(None) => true,
            Err(_) => stale.owner.is_empty(),
        };

        if taken {
            tracing::debug!(
                "Evicted stale lease {} (pid {} on {:?})",
                path.display(),
                stale.pid,
                stale.host
            );
        } else {
            // Raced with a fresh holder; restore its lock unless the slot was refilled
            let _ = fs::hard_link(&tombstone, path);
        }
        let _ = fs::remove_file(&tombstone);
        Ok(taken)
    }
}

enum Holder {
    Live,
    Stale(LeaseInfo),
    Gone,
}

/// An exclusive claim on one digest. Released on [`release`](Lease::release)
/// or drop.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    info: LeaseInfo,
    lease: Duration,
    renewed: Instant,
    released: bool,
}

impl Lease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.info.expires_at
    }

    /// Push the expiry one lease length into the future.
    ///
    /// Fails if the lock no longer belongs to this holder.
    pub fn renew(&mut self) -> Result<()> {
        self.ensure_owned()?;

        let mut info = self.info.clone();
        info.expires_at = expiry(Utc::now(), self.lease);
        let json = serde_json::to_vec(&info).map_err(io::Error::from)?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        self.info = info;
        self.renewed = Instant::now();
        Ok(())
    }

    /// Renew once a third of the lease has passed since the last renewal.
    pub fn renew_if_due(&mut self) -> Result<bool> {
        if self.renewed.elapsed() < self.lease / 3 {
            return Ok(false);
        }
        self.renew()?;
        Ok(true)
    }

    /// Whether the lock file still names this holder.
    pub fn is_owned(&self) -> bool {
        self.ensure_owned().is_ok()
    }

    /// Give up the lock.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn ensure_owned(&self) -> Result<()> {
        match read_info(&self.path) {
            Ok(Some(info)) if info.owner == self.info.owner => Ok(()),
            _ => Err(io::Error::other(format!("lease {} was lost", self.path.display())).into()),
        }
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if self.ensure_owned().is_ok() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!("Failed to release lease {}: {}", self.path.display(), e);
        }
    }
}

/// `Ok(None)` when the file does not exist.
fn read_info(path: &Path) -> io::Result<Option<LeaseInfo>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn expiry(from: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
    from.checked_add_signed(lease).unwrap_or(from)
}

fn new_token(host: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "{}-{}-{:x}-{}",
        host,
        std::process::id(),
        nanos,
        TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
