// src/kernel/fs/mod.rs
//! Filesystem boundary
//!
//! The filesystem proper (inodes, block cache, the IDE driver behind
//! it) lives outside this crate; syscalls talk to whatever
//! implementation the embedder mounts here. Buffers cross the boundary
//! as scatter lists: per-page slices of physical memory obtained
//! through the direct map, so the filesystem never needs the user page
//! table loaded.

pub mod path;

use alloc::string::String;
use alloc::sync::Arc;
use spin::RwLock;

/// Negative errno, in the syscall return convention.
pub type Errno = i64;

/// Opaque handle to a filesystem object, plus one console sentinel the
/// filesystem never sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsHandle(pub i64);

/// The operations the kernel needs from a filesystem.
///
/// `read`/`write` operate on scatter lists and a byte offset and
/// return the byte count moved; path operations take pre-sanitized
/// component lists. Errors are negative errnos, propagated to user
/// space unchanged.
pub trait Filesystem: Send + Sync {
    /// Read from `file` at `offset` into the scatter list. Returns
    /// bytes read; 0 means end of file.
    fn read(&self, dsts: &mut [&mut [u8]], file: FsHandle, offset: usize) -> Result<usize, Errno>;

    /// Write the scatter list to `file` at `offset` (or at the end
    /// when `append` is set). Returns bytes written.
    fn write(
        &self,
        srcs: &[&[u8]],
        file: FsHandle,
        offset: usize,
        append: bool,
    ) -> Result<usize, Errno>;

    /// Open (and with `O_CREAT`, create) the object at `parts`.
    fn open(&self, parts: &[String], flags: i64, mode: i64) -> Result<FsHandle, Errno>;

    /// Create a directory.
    fn mkdir(&self, parts: &[String], mode: i64) -> Result<(), Errno>;

    /// Link `new` to the object at `old`.
    fn link(&self, old: &[String], new: &[String]) -> Result<(), Errno>;

    /// Remove the directory entry at `parts`.
    fn unlink(&self, parts: &[String]) -> Result<(), Errno>;
}

static FILESYSTEM: RwLock<Option<Arc<dyn Filesystem>>> = RwLock::new(None);

/// Mount the filesystem implementation. Called once at init by the
/// embedder, before user processes run.
pub fn mount(fs: Arc<dyn Filesystem>) {
    *FILESYSTEM.write() = Some(fs);
}

/// Whether a filesystem is mounted.
pub fn is_mounted() -> bool {
    FILESYSTEM.read().is_some()
}

/// The mounted filesystem.
///
/// # Panics
///
/// Panics when nothing is mounted - file syscalls before init are a
/// kernel bug, not a user error.
pub fn fs() -> Arc<dyn Filesystem> {
    FILESYSTEM
        .read()
        .as_ref()
        .map(Arc::clone)
        .expect("no filesystem mounted")
}

/// In-memory filesystem double used by the unit tests: a flat
/// namespace of byte files plus a verbatim log of every data call that
/// crosses the boundary.
#[cfg(test)]
pub mod testfs {
    use super::*;
    use crate::kernel::syscall::{EEXIST, ENOENT, O_CREAT};
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// One recorded `write` crossing the boundary.
    #[derive(Debug, Clone)]
    pub struct WriteCall {
        pub file: FsHandle,
        pub offset: usize,
        pub append: bool,
        pub slice_lens: Vec<usize>,
        pub bytes: Vec<u8>,
    }

    #[derive(Default)]
    struct State {
        by_path: BTreeMap<Vec<String>, i64>,
        data: BTreeMap<i64, Vec<u8>>,
        next: i64,
    }

    /// See the module docs.
    #[derive(Default)]
    pub struct TestFs {
        state: Mutex<State>,
        /// Every write observed, in order.
        pub writes: Mutex<Vec<WriteCall>>,
        /// Number of reads observed.
        pub reads: Mutex<usize>,
    }

    impl TestFs {
        pub fn new() -> Self {
            Self::default()
        }

        /// Pre-populate a file.
        pub fn add_file(&self, parts: &[&str], data: &[u8]) -> FsHandle {
            let mut st = self.state.lock();
            st.next += 1;
            let h = st.next;
            let key: Vec<String> = parts.iter().map(|s| String::from(*s)).collect();
            st.by_path.insert(key, h);
            st.data.insert(h, data.to_vec());
            FsHandle(h)
        }

        /// Stored contents of `file`.
        pub fn contents(&self, file: FsHandle) -> Vec<u8> {
            self.state.lock().data.get(&file.0).cloned().unwrap_or_default()
        }
    }

    impl Filesystem for TestFs {
        fn read(
            &self,
            dsts: &mut [&mut [u8]],
            file: FsHandle,
            offset: usize,
        ) -> Result<usize, Errno> {
            *self.reads.lock() += 1;
            let st = self.state.lock();
            let data = st.data.get(&file.0).ok_or(ENOENT)?;
            let mut copied = 0;
            let mut pos = offset;
            for dst in dsts.iter_mut() {
                if pos >= data.len() {
                    break;
                }
                let n = core::cmp::min(dst.len(), data.len() - pos);
                dst[..n].copy_from_slice(&data[pos..pos + n]);
                pos += n;
                copied += n;
            }
            Ok(copied)
        }

        fn write(
            &self,
            srcs: &[&[u8]],
            file: FsHandle,
            offset: usize,
            append: bool,
        ) -> Result<usize, Errno> {
            let mut st = self.state.lock();
            let flat: Vec<u8> = srcs.iter().flat_map(|s| s.iter().copied()).collect();
            let n = flat.len();
            self.writes.lock().push(WriteCall {
                file,
                offset,
                append,
                slice_lens: srcs.iter().map(|s| s.len()).collect(),
                bytes: flat.clone(),
            });
            let data = st.data.get_mut(&file.0).ok_or(ENOENT)?;
            let at = if append { data.len() } else { offset };
            if data.len() < at + n {
                data.resize(at + n, 0);
            }
            data[at..at + n].copy_from_slice(&flat);
            Ok(n)
        }

        fn open(&self, parts: &[String], flags: i64, _mode: i64) -> Result<FsHandle, Errno> {
            let mut st = self.state.lock();
            if let Some(&h) = st.by_path.get(parts) {
                return Ok(FsHandle(h));
            }
            if flags & O_CREAT == 0 {
                return Err(ENOENT);
            }
            st.next += 1;
            let h = st.next;
            st.by_path.insert(parts.to_vec(), h);
            st.data.insert(h, Vec::new());
            Ok(FsHandle(h))
        }

        fn mkdir(&self, parts: &[String], _mode: i64) -> Result<(), Errno> {
            let mut st = self.state.lock();
            if st.by_path.contains_key(parts) {
                return Err(EEXIST);
            }
            st.next += 1;
            let h = st.next;
            st.by_path.insert(parts.to_vec(), h);
            Ok(())
        }

        fn link(&self, old: &[String], new: &[String]) -> Result<(), Errno> {
            let mut st = self.state.lock();
            let h = *st.by_path.get(old).ok_or(ENOENT)?;
            if st.by_path.contains_key(new) {
                return Err(EEXIST);
            }
            st.by_path.insert(new.to_vec(), h);
            Ok(())
        }

        fn unlink(&self, parts: &[String]) -> Result<(), Errno> {
            let mut st = self.state.lock();
            st.by_path.remove(parts).map(|_| ()).ok_or(ENOENT)
        }
    }

    use spin::Lazy;

    /// The one filesystem instance shared by all unit tests; tests keep
    /// out of each other's way by using distinct paths.
    pub static TEST_FS: Lazy<Arc<TestFs>> = Lazy::new(|| Arc::new(TestFs::new()));

    /// Mount [`TEST_FS`], idempotently.
    pub fn mount_testfs() -> Arc<TestFs> {
        let fs = Arc::clone(&*TEST_FS);
        if !is_mounted() {
            mount(fs.clone());
        }
        fs
    }
}
