//! Backing filesystem contract.
//!
//! The session engine and the prepare scrubber drive storage through the
//! [`FileStore`] trait; [`NativeFs`] is the local-disk implementation with
//! localroot prefix rewriting. Errors are carried as [`Errno`] and mapped
//! to protocol errors exactly once, at the session boundary.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::num::NonZeroI32;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

/// A raw OS error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(NonZeroI32);

impl Errno {
    /// Wrap a raw errno; zero is coerced to `EIO`.
    pub fn from_raw(raw: i32) -> Errno {
        Errno(NonZeroI32::new(raw).unwrap_or(NonZeroI32::new(libc::EIO).expect("EIO is nonzero")))
    }

    /// The raw value.
    pub fn code(&self) -> i32 {
        self.0.get()
    }

    /// `strerror`-style text for the client-visible message.
    pub fn message(&self) -> String {
        io::Error::from_raw_os_error(self.code()).to_string()
    }
}

impl From<io::Error> for Errno {
    fn from(e: io::Error) -> Errno {
        Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {}", self.code())
    }
}

/// Decoded open disposition, independent of wire flag encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMode {
    /// Open for writing (read is always implied).
    pub write: bool,
    /// Create if absent.
    pub create: bool,
    /// Truncate an existing file.
    pub trunc: bool,
    /// Create missing parent directories.
    pub mkpath: bool,
}

/// Stat result flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Device/inode derived identifier.
    pub id: u64,
    /// Size in bytes.
    pub size: u64,
    /// True for directories.
    pub is_dir: bool,
    /// True for anything that is neither file nor directory.
    pub is_other: bool,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
}

/// Free-space summary for the `start`/`avkb` reports, in KiB.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpaceInfo {
    /// Largest free space in a single filesystem.
    pub max_free_kb: u64,
    /// Total free space across filesystems.
    pub tot_free_kb: u64,
    /// Number of filesystems.
    pub num_fs: u32,
}

/// An open file handle.
pub trait StoredFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `off`; returns the bytes read.
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, Errno>;
    /// Write all of `data` at `off`, retrying short writes.
    fn write_at(&self, data: &[u8], off: u64) -> Result<(), Errno>;
    /// Flush to stable storage.
    fn sync(&self) -> Result<(), Errno>;
    /// Current size in bytes.
    fn size(&self) -> Result<u64, Errno>;
}

/// The backing store the session engine drives.
pub trait FileStore: Send + Sync {
    /// Open `path`; `info` is the opaque string a client may append to an
    /// open request, passed through uninterpreted.
    fn open(&self, path: &str, mode: OpenMode, perm: u32, info: &str)
    -> Result<Arc<dyn StoredFile>, Errno>;
    /// Stat `path`.
    fn stat(&self, path: &str) -> Result<FileInfo, Errno>;
    /// Create a directory.
    fn mkdir(&self, path: &str, perm: u32) -> Result<(), Errno>;
    /// Rename a file or directory.
    fn rename(&self, from: &str, to: &str) -> Result<(), Errno>;
    /// Remove a file.
    fn remove(&self, path: &str) -> Result<(), Errno>;
    /// Remove an empty directory.
    fn rmdir(&self, path: &str) -> Result<(), Errno>;
    /// Change permission bits.
    fn chmod(&self, path: &str, perm: u32) -> Result<(), Errno>;
    /// Cheap existence probe for the prepare scrubber and state queries.
    fn exists(&self, path: &str) -> bool;
    /// Free-space summary.
    fn free_space(&self) -> SpaceInfo;
}

/// Local-disk store with localroot prefix rewriting.
pub struct NativeFs {
    local_root: Option<PathBuf>,
}

impl NativeFs {
    /// A store rooted at `local_root` (logical paths are re-anchored under
    /// it) or at `/` when `None`.
    pub fn new(local_root: Option<PathBuf>) -> NativeFs {
        NativeFs { local_root }
    }

    fn local_path(&self, path: &str) -> PathBuf {
        match &self.local_root {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }
}

struct NativeFile(File);

impl StoredFile for NativeFile {
    fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, Errno> {
        Ok(self.0.read_at(buf, off)?)
    }

    fn write_at(&self, data: &[u8], off: u64) -> Result<(), Errno> {
        Ok(self.0.write_all_at(data, off)?)
    }

    fn sync(&self) -> Result<(), Errno> {
        Ok(self.0.sync_all()?)
    }

    fn size(&self) -> Result<u64, Errno> {
        Ok(self.0.metadata()?.len())
    }
}

impl FileStore for NativeFs {
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        perm: u32,
        _info: &str,
    ) -> Result<Arc<dyn StoredFile>, Errno> {
        let lcl = self.local_path(path);
        if mode.mkpath {
            if let Some(parent) = lcl.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut opts = OpenOptions::new();
        opts.read(true);
        if mode.write {
            opts.write(true);
        }
        if mode.create {
            opts.create(true);
        }
        if mode.trunc {
            opts.truncate(true).write(true);
        }
        if mode.create {
            opts.mode(perm);
        }
        debug!("fs open {} -> {}", path, lcl.display());
        let file = opts.open(&lcl)?;
        Ok(Arc::new(NativeFile(file)))
    }

    fn stat(&self, path: &str) -> Result<FileInfo, Errno> {
        let md = fs::metadata(self.local_path(path))?;
        Ok(FileInfo {
            id: md.dev() << 32 | (md.ino() & 0xffff_ffff),
            size: md.len(),
            is_dir: md.is_dir(),
            is_other: !md.is_dir() && !md.is_file(),
            mtime: md.mtime(),
        })
    }

    fn mkdir(&self, path: &str, perm: u32) -> Result<(), Errno> {
        let lcl = self.local_path(path);
        fs::create_dir(&lcl)?;
        fs::set_permissions(&lcl, fs::Permissions::from_mode(perm))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), Errno> {
        Ok(fs::rename(self.local_path(from), self.local_path(to))?)
    }

    fn remove(&self, path: &str) -> Result<(), Errno> {
        Ok(fs::remove_file(self.local_path(path))?)
    }

    fn rmdir(&self, path: &str) -> Result<(), Errno> {
        Ok(fs::remove_dir(self.local_path(path))?)
    }

    fn chmod(&self, path: &str, perm: u32) -> Result<(), Errno> {
        Ok(fs::set_permissions(
            self.local_path(path),
            fs::Permissions::from_mode(perm),
        )?)
    }

    fn exists(&self, path: &str) -> bool {
        self.local_path(path).exists()
    }

    fn free_space(&self) -> SpaceInfo {
        let probe = self
            .local_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("/"));
        statvfs_kb(&probe)
            .map(|free| SpaceInfo {
                max_free_kb: free,
                tot_free_kb: free,
                num_fs: 1,
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for NativeFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.local_root {
            Some(root) => write!(f, "NativeFs({})", root.display()),
            None => write!(f, "NativeFs(/)"),
        }
    }
}

fn statvfs_kb(path: &Path) -> Option<u64> {
    let mut cpath = path.as_os_str().as_bytes().to_vec();
    cpath.push(0);
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr() as *const libc::c_char, &mut st) };
    if rc != 0 {
        return None;
    }
    Some((st.f_bavail as u64).saturating_mul(st.f_frsize as u64) / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, NativeFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new(Some(dir.path().to_path_buf()));
        (dir, fs)
    }

    #[test]
    fn localroot_rewrite() {
        let (dir, fs) = store();
        let mode = OpenMode {
            write: true,
            create: true,
            mkpath: true,
            ..Default::default()
        };
        let f = fs.open("/d/hello", mode, 0o644, "").unwrap();
        f.write_at(b"hello world", 0).unwrap();
        assert!(dir.path().join("d/hello").exists());
        let mut buf = [0u8; 5];
        assert_eq!(f.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn stat_and_meta_ops() {
        let (_dir, fs) = store();
        fs.mkdir("/sub", 0o755).unwrap();
        assert!(fs.stat("/sub").unwrap().is_dir);
        let mode = OpenMode {
            write: true,
            create: true,
            ..Default::default()
        };
        fs.open("/sub/a", mode, 0o600, "").unwrap();
        fs.rename("/sub/a", "/sub/b").unwrap();
        assert!(fs.exists("/sub/b"));
        assert!(!fs.exists("/sub/a"));
        fs.chmod("/sub/b", 0o400).unwrap();
        fs.remove("/sub/b").unwrap();
        fs.rmdir("/sub").unwrap();
        assert_eq!(
            fs.stat("/sub").unwrap_err().code(),
            libc::ENOENT,
            "stat of a removed dir reports ENOENT"
        );
    }

    #[test]
    fn free_space_reports_something() {
        let (_dir, fs) = store();
        assert!(fs.free_space().num_fs >= 1);
    }
}
