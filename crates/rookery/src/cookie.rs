//! Cookies: the durable identity token pinning a bookie's directory
//! layout to its cluster identity.
//!
//! A cookie is generated from the configuration (plus the optional
//! cluster instance id), written once into the journal directory, every
//! ledger directory, and the metadata service, and verified against all
//! of those copies on every later start. A mismatch means the bookie is
//! being started over directories that belong to a different identity or
//! layout, which is refused outright.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use rook_error::{BookieError, Result};
use rook_types::{BookieConfig, Cx};
use rook_vfs::traits::read_exact_at;
use rook_vfs::{OpenFlags, Vfs, VfsFile};
use tracing::{info, warn};

use crate::meta::{MetadataClient, COOKIES_PATH, INSTANCEID_NODE};

/// Name of the cookie file inside each directory.
pub const COOKIE_FILE: &str = "cookie";

/// Cookie format version.
const COOKIE_VERSION: u32 = 1;

/// The bookie's identity fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub bookie_id: String,
    pub journal_dir: String,
    pub ledger_dirs: Vec<String>,
    pub instance_id: Option<String>,
}

impl Cookie {
    /// Generate the expected cookie for this configuration.
    #[must_use]
    pub fn generate(cfg: &BookieConfig, instance_id: Option<String>) -> Self {
        Self {
            bookie_id: cfg.bookie_id.clone(),
            journal_dir: cfg.journal_dir.display().to_string(),
            ledger_dirs: cfg
                .ledger_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect(),
            instance_id,
        }
    }

    /// Serialize to the line-oriented on-disk form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        let _ = writeln!(out, "{COOKIE_VERSION}");
        let _ = writeln!(out, "bookieId: {}", self.bookie_id);
        let _ = writeln!(out, "journalDir: {}", self.journal_dir);
        let _ = writeln!(out, "ledgerDirs: {}", self.ledger_dirs.join(","));
        if let Some(instance) = &self.instance_id {
            let _ = writeln!(out, "instanceId: {instance}");
        }
        out.into_bytes()
    }

    /// Parse the on-disk form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| BookieError::invalid_cookie("cookie is not utf-8"))?;
        let mut lines = text.lines();
        let version: u32 = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| BookieError::invalid_cookie("missing cookie version"))?;
        if version != COOKIE_VERSION {
            return Err(BookieError::invalid_cookie(format!(
                "unsupported cookie version {version}"
            )));
        }
        let mut bookie_id = None;
        let mut journal_dir = None;
        let mut ledger_dirs = None;
        let mut instance_id = None;
        for line in lines {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            match key {
                "bookieId" => bookie_id = Some(value.to_owned()),
                "journalDir" => journal_dir = Some(value.to_owned()),
                "ledgerDirs" => {
                    ledger_dirs = Some(value.split(',').map(str::to_owned).collect());
                }
                "instanceId" => instance_id = Some(value.to_owned()),
                _ => {}
            }
        }
        Ok(Self {
            bookie_id: bookie_id
                .ok_or_else(|| BookieError::invalid_cookie("cookie missing bookieId"))?,
            journal_dir: journal_dir
                .ok_or_else(|| BookieError::invalid_cookie("cookie missing journalDir"))?,
            ledger_dirs: ledger_dirs
                .ok_or_else(|| BookieError::invalid_cookie("cookie missing ledgerDirs"))?,
            instance_id,
        })
    }

    /// Verify this cookie matches `expected`.
    pub fn verify(&self, expected: &Self) -> Result<()> {
        if self == expected {
            Ok(())
        } else {
            Err(BookieError::invalid_cookie(format!(
                "cookie mismatch: found {self:?}, expected {expected:?}"
            )))
        }
    }

    /// Write the cookie file into a directory.
    pub fn write_to_dir<V: Vfs>(&self, vfs: &V, cx: &Cx, dir: &Path) -> Result<()> {
        let path = dir.join(COOKIE_FILE);
        let mut file = vfs.open(cx, &path, OpenFlags::read_write_create() | OpenFlags::TRUNCATE)?;
        file.write_at(cx, &self.encode(), 0)?;
        file.sync(cx, false)?;
        Ok(())
    }

    /// Read the cookie file from a directory; `None` when absent.
    pub fn read_from_dir<V: Vfs>(vfs: &V, cx: &Cx, dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(COOKIE_FILE);
        if !vfs.exists(cx, &path)? {
            return Ok(None);
        }
        let file = vfs.open(cx, &path, OpenFlags::read_only())?;
        let size = usize::try_from(file.size(cx)?)
            .map_err(|_| BookieError::invalid_cookie("cookie file too large"))?;
        let mut buf = vec![0u8; size];
        read_exact_at(&file, cx, &mut buf, 0)?;
        Ok(Some(Self::decode(&buf)?))
    }
}

/// Validate the environment: cookies on disk and in the metadata service
/// must all match the configuration, or this must be a first boot (no
/// cookie anywhere), in which case cookies are stamped everywhere.
pub fn check_environment<V: Vfs>(
    vfs: &V,
    cx: &Cx,
    cfg: &BookieConfig,
    meta: &dyn MetadataClient,
    cookie_dirs: &[PathBuf],
) -> Result<()> {
    let instance_id = meta
        .get(INSTANCEID_NODE)?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    let master = Cookie::generate(cfg, instance_id);

    let meta_path = format!("{COOKIES_PATH}/{}", cfg.bookie_id);
    let new_env = match meta.get(&meta_path)? {
        Some(bytes) => {
            Cookie::decode(&bytes)?.verify(&master)?;
            false
        }
        None => true,
    };

    let mut missing = Vec::new();
    for dir in cookie_dirs {
        match Cookie::read_from_dir(vfs, cx, dir)? {
            Some(found) => found.verify(&master)?,
            None => missing.push(dir.clone()),
        }
    }

    if new_env {
        if !missing.is_empty() {
            info!(dirs = missing.len(), "first boot, stamping cookies");
            for dir in cookie_dirs {
                master.write_to_dir(vfs, cx, dir)?;
            }
        }
        meta.put(&meta_path, &master.encode())?;
        Ok(())
    } else if missing.is_empty() {
        Ok(())
    } else {
        warn!(?missing, "cookie present in metadata but absent on disk");
        Err(BookieError::invalid_cookie(format!(
            "cookie registered in metadata service but missing from {} directories",
            missing.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::InMemoryMetadataService;
    use rook_vfs::MemoryVfs;
    use std::path::PathBuf;

    fn test_config() -> BookieConfig {
        BookieConfig {
            bookie_id: "10.0.0.1:3181".to_owned(),
            journal_dir: PathBuf::from("/j"),
            ledger_dirs: vec![PathBuf::from("/l0"), PathBuf::from("/l1")],
            ..BookieConfig::default()
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let cookie = Cookie::generate(&test_config(), Some("cluster-77".to_owned()));
        let decoded = Cookie::decode(&cookie.encode()).unwrap();
        assert_eq!(decoded, cookie);
    }

    #[test]
    fn verify_detects_changed_layout() {
        let cfg = test_config();
        let a = Cookie::generate(&cfg, None);
        let mut changed = cfg.clone();
        changed.ledger_dirs.push(PathBuf::from("/l2"));
        let b = Cookie::generate(&changed, None);
        assert!(matches!(
            a.verify(&b),
            Err(BookieError::InvalidCookie { .. })
        ));
    }

    #[test]
    fn first_boot_stamps_everywhere_then_verifies() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let cfg = test_config();
        let service = InMemoryMetadataService::new();
        let client = service.client();
        let dirs = vec![PathBuf::from("/j"), PathBuf::from("/l0/current")];
        for d in &dirs {
            vfs.create_dir_all(&cx, d).unwrap();
        }

        check_environment(&vfs, &cx, &cfg, client.as_ref(), &dirs).unwrap();
        assert!(service.node_exists("/ledgers/cookies/10.0.0.1:3181"));
        for d in &dirs {
            assert!(Cookie::read_from_dir(&vfs, &cx, d).unwrap().is_some());
        }

        // Second start verifies cleanly.
        check_environment(&vfs, &cx, &cfg, client.as_ref(), &dirs).unwrap();
    }

    #[test]
    fn missing_disk_cookie_with_metadata_cookie_is_refused() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let cfg = test_config();
        let service = InMemoryMetadataService::new();
        let client = service.client();
        let dirs = vec![PathBuf::from("/j")];
        vfs.create_dir_all(&cx, &dirs[0]).unwrap();

        check_environment(&vfs, &cx, &cfg, client.as_ref(), &dirs).unwrap();
        vfs.delete(&cx, &dirs[0].join(COOKIE_FILE)).unwrap();

        assert!(matches!(
            check_environment(&vfs, &cx, &cfg, client.as_ref(), &dirs),
            Err(BookieError::InvalidCookie { .. })
        ));
    }

    #[test]
    fn changed_config_is_refused() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let cfg = test_config();
        let service = InMemoryMetadataService::new();
        let client = service.client();
        let dirs = vec![PathBuf::from("/j")];
        vfs.create_dir_all(&cx, &dirs[0]).unwrap();
        check_environment(&vfs, &cx, &cfg, client.as_ref(), &dirs).unwrap();

        let mut changed = cfg;
        changed.ledger_dirs.push(PathBuf::from("/l-extra"));
        assert!(matches!(
            check_environment(&vfs, &cx, &changed, client.as_ref(), &dirs),
            Err(BookieError::InvalidCookie { .. })
        ));
    }

    #[test]
    fn instance_id_is_mixed_in() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let cfg = test_config();
        let service = InMemoryMetadataService::new();
        let client = service.client();
        client.put(INSTANCEID_NODE, b"cluster-a").unwrap();
        let dirs = vec![PathBuf::from("/j")];
        vfs.create_dir_all(&cx, &dirs[0]).unwrap();
        check_environment(&vfs, &cx, &cfg, client.as_ref(), &dirs).unwrap();

        // A different instance id invalidates the stamped cookies.
        client.put(INSTANCEID_NODE, b"cluster-b").unwrap();
        assert!(matches!(
            check_environment(&vfs, &cx, &cfg, client.as_ref(), &dirs),
            Err(BookieError::InvalidCookie { .. })
        ));
    }
}
