//! Cluster-addressed blob storage backed by a data file and an allocation bitmap.
//!
//! Layout on disk:
//! - `<base>.box`: record bytes, addressed in [`CLUSTER_SIZE`]-byte clusters.
//!   The key of a record is the index of its first cluster.
//! - `<base>.map`: one bit per cluster, set when the cluster is allocated.
//!   Bit `i` lives in byte `i / 8` at position `i % 8` (LSB first).
//!
//! The bitmap is kept in memory and written back (temp file + rename) on
//! flush and close. Allocation is first-fit.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{BlobStore, COMPACT_SUFFIX};
use crate::error::{Result, StoreError};

/// Size of one allocation unit in bytes.
pub const CLUSTER_SIZE: u64 = 128;

/// File-backed [`BlobStore`].
#[derive(Debug)]
pub struct ClusterStorage {
    dir: PathBuf,
    name: String,
    file: Option<File>,
    map: Vec<u8>,
    dirty: bool,
}

impl ClusterStorage {
    /// Open (or create) the store `<dir>/<name>.box` + `<dir>/<name>.map`.
    ///
    /// If a previous compaction was interrupted after the old files were
    /// removed, the compacted files are moved into place first. Leftovers
    /// of a compaction that never reached the swap are discarded.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        recover_swap(&dir, name)?;

        let map_path = map_path(&dir, name);
        let map = if map_path.exists() {
            fs::read(&map_path).map_err(|e| StoreError::io(&map_path, e))?
        } else {
            Vec::new()
        };
        debug!(store = name, clusters = map.len() * 8, "Opened cluster storage");

        Ok(Self {
            dir,
            name: name.to_string(),
            file: None,
            map,
            dirty: false,
        })
    }

    /// Create a new, empty store, replacing any files already using `name`.
    pub fn create(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for path in [box_path(&dir, name), map_path(&dir, name)] {
            remove_if_exists(&path)?;
        }
        Ok(Self {
            dir,
            name: name.to_string(),
            file: None,
            map: Vec::new(),
            dirty: true,
        })
    }

    /// Path of the data file.
    pub fn box_path(&self) -> PathBuf {
        box_path(&self.dir, &self.name)
    }

    /// Path of the allocation bitmap.
    pub fn map_path(&self) -> PathBuf {
        map_path(&self.dir, &self.name)
    }

    fn file(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let path = self.box_path();
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(|e| StoreError::io(&path, e))?
            }
        };
        Ok(self.file.insert(file))
    }

    fn cluster_count(&self) -> usize {
        self.map.len() * 8
    }

    fn is_set(&self, cluster: usize) -> bool {
        self.map
            .get(cluster / 8)
            .is_some_and(|byte| byte & (1 << (cluster % 8)) != 0)
    }

    fn set_range(&mut self, start: usize, count: usize, used: bool) {
        let end = start + count;
        let needed = end.div_ceil(8);
        if self.map.len() < needed {
            self.map.resize(needed, 0);
        }
        for cluster in start..end {
            let mask = 1u8 << (cluster % 8);
            if used {
                self.map[cluster / 8] |= mask;
            } else {
                self.map[cluster / 8] &= !mask;
            }
        }
        self.dirty = true;
    }

    fn check_allocated(&self, key: u32, count: usize) -> Result<()> {
        let start = key as usize;
        if (start..start + count).all(|c| self.is_set(c)) {
            Ok(())
        } else {
            Err(StoreError::InvalidKey {
                store: self.name.clone(),
                key,
            })
        }
    }

    /// First free run of `count` clusters starting below `limit`.
    fn find_free(&self, count: usize, limit: usize) -> Option<usize> {
        let total = self.cluster_count();
        let mut run_start = 0;
        let mut run_len = 0;
        for cluster in 0..total {
            if self.is_set(cluster) {
                run_len = 0;
                run_start = cluster + 1;
                continue;
            }
            if run_start >= limit {
                return None;
            }
            run_len += 1;
            if run_len == count {
                return Some(run_start);
            }
        }
        None
    }

    /// Reserve `count` clusters: first fit, else at the end of the map.
    fn allocate(&mut self, count: usize) -> Result<usize> {
        let total = self.cluster_count();
        let start = match self.find_free(count, total) {
            Some(start) => start,
            None => {
                let trailing = (0..total).rev().take_while(|&c| !self.is_set(c)).count();
                total - trailing
            }
        };
        if start + count > u32::MAX as usize {
            return Err(StoreError::io(
                self.box_path(),
                std::io::Error::other("cluster storage is full"),
            ));
        }
        self.set_range(start, count, true);
        Ok(start)
    }

    fn write_at(&mut self, cluster: usize, pieces: &[&[u8]]) -> Result<()> {
        let path = self.box_path();
        let file = self.file()?;
        file.seek(SeekFrom::Start(cluster as u64 * CLUSTER_SIZE))
            .map_err(|e| StoreError::io(&path, e))?;
        for piece in pieces {
            file.write_all(piece).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }

    fn read_at(&mut self, cluster: usize, length: u32) -> Result<Vec<u8>> {
        let path = self.box_path();
        let file = self.file()?;
        let pos = cluster as u64 * CLUSTER_SIZE;
        let available = file
            .metadata()
            .map_err(|e| StoreError::io(&path, e))?
            .len()
            .saturating_sub(pos);
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| StoreError::io(&path, e))?;
        // Never trust `length` further than the file reaches.
        let mut data = Vec::with_capacity(available.min(u64::from(length)) as usize);
        file.take(length as u64)
            .read_to_end(&mut data)
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(data)
    }

    fn save_map(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let path = self.map_path();
        let tmp = path.with_extension("map.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(&self.map)
                .map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        self.dirty = false;
        Ok(())
    }
}

/// Number of clusters a record of `length` bytes occupies (at least one).
pub fn clusters_for(length: u32) -> usize {
    (length as u64).div_ceil(CLUSTER_SIZE).max(1) as usize
}

impl BlobStore for ClusterStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn save(&mut self, pieces: &[&[u8]]) -> Result<u32> {
        let length: usize = pieces.iter().map(|p| p.len()).sum();
        let length = u32::try_from(length).map_err(|_| StoreError::InvalidRecord {
            key: crate::model::mail::ABSENT,
            reason: format!("record of {length} bytes is too large"),
        })?;
        let count = clusters_for(length);
        let start = self.allocate(count)?;
        if let Err(e) = self.write_at(start, pieces) {
            self.set_range(start, count, false);
            return Err(e);
        }
        debug!(store = %self.name, key = start, length, "Saved record");
        Ok(start as u32)
    }

    fn load(&mut self, key: u32, length: u32) -> Result<Vec<u8>> {
        self.check_allocated(key, 1)?;
        self.read_at(key as usize, length)
    }

    fn free(&mut self, key: u32, length: u32) -> Result<()> {
        let count = clusters_for(length);
        self.check_allocated(key, count)?;
        self.set_range(key as usize, count, false);
        debug!(store = %self.name, key, length, "Freed record");
        Ok(())
    }

    fn compact(
        &mut self,
        key: u32,
        length: u32,
        source: Option<&mut dyn BlobStore>,
    ) -> Result<u32> {
        let count = clusters_for(length);
        match source {
            Some(source) => {
                let data = source.load(key, length)?;
                if data.len() != length as usize {
                    return Err(StoreError::ShortRead {
                        key,
                        expected: length,
                        actual: data.len() as u32,
                    });
                }
                self.save(&[&data])
            }
            None => {
                self.check_allocated(key, count)?;
                let Some(target) = self.find_free(count, key as usize) else {
                    return Ok(key);
                };
                let data = self.read_at(key as usize, length)?;
                self.set_range(target, count, true);
                if let Err(e) = self.write_at(target, &[&data]) {
                    self.set_range(target, count, false);
                    return Err(e);
                }
                self.set_range(key as usize, count, false);
                debug!(store = %self.name, from = key, to = target, "Moved record");
                Ok(target as u32)
            }
        }
    }

    fn free_unreferenced(&mut self, refs: &[(u32, u32)]) -> Result<()> {
        let before = self.allocated_bytes();
        let old_len = self.map.len();
        self.map = vec![0; old_len];
        for &(key, length) in refs {
            self.set_range(key as usize, clusters_for(length), true);
        }
        self.dirty = true;
        info!(
            store = %self.name,
            reclaimed = before.saturating_sub(self.allocated_bytes()),
            "Rebuilt allocation map"
        );
        Ok(())
    }

    fn free_unused(&mut self) -> Result<()> {
        let used = self.map.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        if used < self.map.len() {
            self.map.truncate(used);
            self.dirty = true;
        }
        let len = self.cluster_count() as u64 * CLUSTER_SIZE;
        let path = self.box_path();
        let file = self.file()?;
        let current = file
            .metadata()
            .map_err(|e| StoreError::io(&path, e))?
            .len();
        if current > len {
            file.set_len(len).map_err(|e| StoreError::io(&path, e))?;
            info!(store = %self.name, from = current, to = len, "Truncated data file");
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.save_map()?;
        if let Some(file) = self.file.as_mut() {
            let path = box_path(&self.dir, &self.name);
            file.sync_data().map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.file = None;
        Ok(())
    }

    fn rename(&mut self, dir: &Path, base_name: &str) -> Result<()> {
        self.close()?;
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        for (from, to) in [
            (self.box_path(), box_path(dir, base_name)),
            (self.map_path(), map_path(dir, base_name)),
        ] {
            if from.exists() {
                fs::rename(&from, &to).map_err(|e| StoreError::io(&from, e))?;
            }
        }
        self.dir = dir.to_path_buf();
        self.name = base_name.to_string();
        // Make sure both files exist under the new name.
        self.dirty = true;
        self.save_map()?;
        Ok(())
    }

    fn create_empty(&self, base_name: &str) -> Result<Box<dyn BlobStore>> {
        Ok(Box::new(ClusterStorage::create(&self.dir, base_name)?))
    }

    fn remove(mut self: Box<Self>) -> Result<()> {
        self.file = None;
        self.dirty = false;
        for path in [self.box_path(), self.map_path()] {
            remove_if_exists(&path)?;
        }
        debug!(store = %self.name, "Removed cluster storage");
        Ok(())
    }

    fn allocated_bytes(&self) -> u64 {
        self.map.iter().map(|b| b.count_ones() as u64).sum::<u64>() * CLUSTER_SIZE
    }
}

impl Drop for ClusterStorage {
    fn drop(&mut self) {
        if let Err(e) = self.save_map() {
            warn!(store = %self.name, error = %e, "Failed to save allocation map");
        }
    }
}

fn box_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.box"))
}

fn map_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.map"))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn recover_swap(dir: &Path, name: &str) -> Result<()> {
    let compact_name = format!("{name}{COMPACT_SUFFIX}");
    let compact_box = box_path(dir, &compact_name);
    let compact_map = map_path(dir, &compact_name);
    if !compact_box.exists() && !compact_map.exists() {
        return Ok(());
    }

    if box_path(dir, name).exists() {
        warn!(store = name, "Discarding leftovers of an unfinished compaction");
        remove_if_exists(&compact_box)?;
        remove_if_exists(&compact_map)?;
    } else {
        warn!(store = name, "Completing an interrupted compaction swap");
        for (from, to) in [
            (compact_box, box_path(dir, name)),
            (compact_map, map_path(dir, name)),
        ] {
            if from.exists() {
                fs::rename(&from, &to).map_err(|e| StoreError::io(&from, e))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ClusterStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = ClusterStorage::open(dir.path(), "test").unwrap();
        (dir, storage)
    }

    #[test]
    fn test_save_load() {
        let (_dir, mut s) = store();
        let key = s.save(&[b"hello ", b"world"]).unwrap();
        assert_eq!(s.load(key, 11).unwrap(), b"hello world");
    }

    #[test]
    fn test_first_fit_reuses_freed_clusters() {
        let (_dir, mut s) = store();
        let a = s.save(&[&[1u8; 300]]).unwrap();
        let b = s.save(&[&[2u8; 10]]).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 3);
        s.free(a, 300).unwrap();
        let c = s.save(&[&[3u8; 200]]).unwrap();
        assert_eq!(c, 0);
        assert_eq!(s.load(b, 10).unwrap(), vec![2u8; 10]);
    }

    #[test]
    fn test_load_short_at_end_of_file() {
        let (_dir, mut s) = store();
        let key = s.save(&[b"abc"]).unwrap();
        assert_eq!(s.load(key, 50).unwrap(), b"abc");
    }

    #[test]
    fn test_oversized_load_is_bounded_by_file() {
        let (_dir, mut s) = store();
        let key = s.save(&[&[0xF0, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, b'x']]).unwrap();
        let data = s.load(key, 0xFFFF_FFF0).unwrap();
        assert_eq!(data.len(), 9);
        assert!(data.capacity() <= CLUSTER_SIZE as usize);
    }

    #[test]
    fn test_free_unallocated_key() {
        let (_dir, mut s) = store();
        assert!(matches!(
            s.free(5, 10),
            Err(StoreError::InvalidKey { key: 5, .. })
        ));
    }

    #[test]
    fn test_in_place_compaction_moves_down() {
        let (_dir, mut s) = store();
        let a = s.save(&[&[1u8; 128]]).unwrap();
        let b = s.save(&[&[2u8; 128]]).unwrap();
        s.free(a, 128).unwrap();
        let moved = s.compact(b, 128, None).unwrap();
        assert_eq!(moved, a);
        assert_eq!(s.load(moved, 128).unwrap(), vec![2u8; 128]);
        assert_eq!(s.compact(moved, 128, None).unwrap(), moved);
    }

    #[test]
    fn test_copy_compaction() {
        let (dir, mut old) = store();
        let _gap = old.save(&[&[0u8; 500]]).unwrap();
        let key = old.save(&[b"payload"]).unwrap();
        let mut fresh = ClusterStorage::create(dir.path(), "fresh").unwrap();
        let new_key = fresh.compact(key, 7, Some(&mut old)).unwrap();
        assert_eq!(new_key, 0);
        assert_eq!(fresh.load(new_key, 7).unwrap(), b"payload");
    }

    #[test]
    fn test_free_unreferenced_and_unused() {
        let (_dir, mut s) = store();
        let a = s.save(&[&[1u8; 100]]).unwrap();
        let _leaked = s.save(&[&[2u8; 1000]]).unwrap();
        s.free_unreferenced(&[(a, 100)]).unwrap();
        assert_eq!(s.allocated_bytes(), CLUSTER_SIZE);
        s.free_unused().unwrap();
        s.flush().unwrap();
        let len = std::fs::metadata(s.box_path()).unwrap().len();
        assert!(len <= 8 * CLUSTER_SIZE);
    }

    #[test]
    fn test_map_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = {
            let mut s = ClusterStorage::open(dir.path(), "p").unwrap();
            let key = s.save(&[b"persist"]).unwrap();
            s.close().unwrap();
            key
        };
        let mut s = ClusterStorage::open(dir.path(), "p").unwrap();
        assert_eq!(s.load(key, 7).unwrap(), b"persist");
        assert_eq!(s.save(&[b"next"]).unwrap(), key + 1);
    }

    #[test]
    fn test_recover_interrupted_swap() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = ClusterStorage::create(dir.path(), "idx.compact").unwrap();
            s.save(&[b"compacted"]).unwrap();
            s.close().unwrap();
        }
        let mut s = ClusterStorage::open(dir.path(), "idx").unwrap();
        assert_eq!(s.load(0, 9).unwrap(), b"compacted");
        assert!(!dir.path().join("idx.compact.box").exists());
    }

    #[test]
    fn test_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = ClusterStorage::create(dir.path(), "a").unwrap();
        let key = s.save(&[b"moved"]).unwrap();
        s.rename(dir.path(), "b").unwrap();
        assert!(dir.path().join("b.box").exists());
        assert!(!dir.path().join("a.box").exists());
        assert_eq!(s.load(key, 5).unwrap(), b"moved");
    }
}
