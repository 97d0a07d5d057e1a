//! Rotating, append-only log sink consumed as a child's standard error
//! (spec section 4.3).
//!
//! Writes never block on rotation failure: if rotation itself fails, the
//! write still happens, because losing log lines is worse than
//! overshooting the size cap. At most one writer may hold a given path at
//! a time, enforced by the internal mutex. Gzip compression of a rotated
//! generation is CPU-bound, so it is spawned onto `tokio::task::spawn_blocking`
//! and detached rather than awaited inline, when a runtime is available
//! (falling back to synchronous compression for sync callers, e.g. tests).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::write::GzEncoder;
use flate2::Compression;

/// One generation of a rotated log, as returned by
/// [`RotatingSink::list_generations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub path: PathBuf,
    pub index: u32,
    pub compressed: bool,
    pub modified: std::time::SystemTime,
}

struct Inner {
    file: File,
    current_size: u64,
}

/// Size-rotated, generation-retained, optionally-gzipped log sink.
pub struct RotatingSink {
    path: PathBuf,
    max_bytes: u64,
    max_generations: u32,
    compress: bool,
    inner: Mutex<Inner>,
}

impl RotatingSink {
    pub fn open(
        path: impl Into<PathBuf>,
        max_bytes: u64,
        max_generations: u32,
        compress: bool,
    ) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes: max_bytes.max(1),
            max_generations,
            compress,
            inner: Mutex::new(Inner {
                file,
                current_size,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `data`, rotating first if the write would push
    /// `current_size` past `max_bytes`. The write is performed even if
    /// rotation fails.
    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.current_size + data.len() as u64 > self.max_bytes {
            if let Err(e) = self.rotate_locked(&mut inner) {
                // Rotation failure is never fatal to the write itself.
                let _ = e;
            }
        }

        inner.file.write_all(data)?;
        inner.current_size += data.len() as u64;
        Ok(())
    }

    /// Forces a rotation regardless of current size. Used by tests and by
    /// callers that want a rotation boundary at a known point (e.g. log
    /// shipping before a restart).
    pub fn rotate(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.rotate_locked(&mut inner)
    }

    fn rotate_locked(&self, inner: &mut Inner) -> std::io::Result<()> {
        // Step 1: the current descriptor is replaced below; nothing to
        // explicitly close since `inner.file` is overwritten in place.

        // Step 2: shift existing numbered generations up by one.
        if self.max_generations > 0 {
            for i in (1..self.max_generations).rev() {
                let from_plain = self.generation_path(i, false);
                let to_plain = self.generation_path(i + 1, false);
                if from_plain.exists() {
                    let _ = fs::rename(&from_plain, &to_plain);
                }

                let from_gz = self.generation_path(i, true);
                let to_gz = self.generation_path(i + 1, true);
                if from_gz.exists() {
                    let _ = fs::rename(&from_gz, &to_gz);
                }
            }
        }

        // Step 3: current file becomes generation 1.
        let gen1 = self.generation_path(1, false);
        match fs::rename(&self.path, &gen1) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        // Step 4: optionally compress generation 1. The actual gzip work
        // is CPU-bound, so it's handed to the blocking pool and detached
        // rather than awaited here; a plain-text generation briefly
        // coexists with its eventual `.gz` replacement, which callers
        // tolerate (`list_generations` reports whichever exists).
        if self.compress && gen1.exists() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let gen1 = gen1.clone();
                    handle.spawn_blocking(move || Self::compress_generation_blocking(&gen1));
                }
                Err(_) => Self::compress_generation_blocking(&gen1),
            }
        }

        // Step 5: prune anything beyond the retention window.
        self.prune_beyond_cap();

        // Step 6: reopen the base path for append and refresh the size.
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        inner.current_size = file.metadata()?.len();
        inner.file = file;
        Ok(())
    }

    /// Compresses `gen1` into `gen1.gz`, removing the original on
    /// success. Any partial `.gz` is removed on failure, and the
    /// uncompressed generation is left intact.
    fn compress_generation_blocking(gen1: &Path) {
        let gz_path = Self::append_gz(gen1);
        let result = (|| -> std::io::Result<()> {
            let input = fs::read(gen1)?;
            let out = File::create(&gz_path)?;
            let mut encoder = GzEncoder::new(out, Compression::default());
            encoder.write_all(&input)?;
            encoder.finish()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                let _ = fs::remove_file(gen1);
            }
            Err(_) => {
                let _ = fs::remove_file(&gz_path);
            }
        }
    }

    fn prune_beyond_cap(&self) {
        // Scan a small window past the cap for leftover generations,
        // covering both off-by-one drift and leftover compressed copies.
        let window = self.max_generations.saturating_add(4);
        for i in (self.max_generations + 1)..=window {
            let plain = self.generation_path(i, false);
            let gz = self.generation_path(i, true);
            if plain.exists() {
                let _ = fs::remove_file(&plain);
            }
            if gz.exists() {
                let _ = fs::remove_file(&gz);
            }
        }
    }

    fn generation_path(&self, index: u32, gz: bool) -> PathBuf {
        let plain = PathBuf::from(format!("{}.{}", self.path.display(), index));
        if gz {
            Self::append_gz(&plain)
        } else {
            plain
        }
    }

    fn append_gz(path: &Path) -> PathBuf {
        PathBuf::from(format!("{}.gz", path.display()))
    }

    /// Lists rotated generations for this sink's base path, sorted
    /// newest-first by mtime, each tagged compressed or not.
    pub fn list_generations(&self) -> Vec<Generation> {
        let mut out = Vec::new();
        let window = self.max_generations.saturating_add(8).max(8);
        for i in 1..=window {
            for (gz, path) in [
                (false, self.generation_path(i, false)),
                (true, self.generation_path(i, true)),
            ] {
                if let Ok(meta) = fs::metadata(&path) {
                    out.push(Generation {
                        path,
                        index: i,
                        compressed: gz,
                        modified: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
                    });
                }
            }
        }
        out.sort_by(|a, b| b.modified.cmp(&a.modified));
        out
    }

    /// Sums the total size in bytes of every retained generation.
    pub fn total_generations_size(&self) -> u64 {
        self.list_generations()
            .iter()
            .filter_map(|g| fs::metadata(&g.path).ok())
            .map(|m| m.len())
            .sum()
    }

    /// Deletes all generations and the base file.
    pub fn delete_all(&self) -> std::io::Result<()> {
        for g in self.list_generations() {
            let _ = fs::remove_file(&g.path);
        }
        let _ = fs::remove_file(&self.path);
        Ok(())
    }
}
