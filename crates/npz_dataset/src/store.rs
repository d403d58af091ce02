//! Indexed, read-only sample store backed by `<root>/<index>.npz` files.
//!
//! The size is found once, at construction, by probing `0.npz`, `1.npz`, ...
//! until the first missing index. Files past a gap are never counted: a
//! directory holding `0.npz`, `1.npz` and `3.npz` is a store of size 2.

use crate::archive::{read_archive, ARCHIVE_EXTENSION};
use crate::aug::SampleTransform;
use crate::types::{DatasetError, DatasetResult, Sample, Target};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct SampleStore {
    root: PathBuf,
    len: usize,
    transform: Option<Arc<dyn SampleTransform>>,
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleStore")
            .field("root", &self.root)
            .field("len", &self.len)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl SampleStore {
    /// Open a store without a transform. A missing or empty directory gives size 0.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let len = count_contiguous(&root);
        tracing::info!(root = %root.display(), "found dataset with {len} files");
        Self {
            root,
            len,
            transform: None,
        }
    }

    pub fn with_transform<T>(root: impl Into<PathBuf>, transform: T) -> Self
    where
        T: SampleTransform + 'static,
    {
        Self::open(root).set_transform(Arc::new(transform))
    }

    pub fn set_transform(mut self, transform: Arc<dyn SampleTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Archive path for `index`, whether or not it exists.
    pub fn path_for(&self, index: usize) -> PathBuf {
        sample_path(&self.root, index)
    }

    /// Decode sample `index` and run the transform, if any.
    pub fn get(&self, index: usize) -> DatasetResult<Sample> {
        let path = self.path_for(index);
        if index >= self.len || !path.is_file() {
            return Err(DatasetError::NotFound { path });
        }

        let contents = read_archive(&path)?;
        let target = Target {
            boxes: contents.boxes,
            labels: contents.labels,
            image_id: index as u64,
        };
        target.check_paired()?;

        let (image, target) = match &self.transform {
            Some(transform) => transform.apply(contents.image, target)?,
            None => (contents.image, target),
        };
        target.check_paired()?;

        Ok(Sample { image, target })
    }

    pub fn iter(&self) -> impl Iterator<Item = DatasetResult<Sample>> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }
}

pub fn sample_path(root: &Path, index: usize) -> PathBuf {
    root.join(format!("{index}.{ARCHIVE_EXTENSION}"))
}

fn count_contiguous(root: &Path) -> usize {
    let mut count = 0usize;
    while sample_path(root, count).is_file() {
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn counts_only_the_contiguous_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["0.npz", "1.npz", "3.npz", "notes.txt", "2.png"] {
            fs::write(tmp.path().join(name), b"").unwrap();
        }
        let store = SampleStore::open(tmp.path());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn missing_root_is_an_empty_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SampleStore::open(tmp.path().join("absent"));
        assert!(store.is_empty());
        match store.get(0) {
            Err(DatasetError::NotFound { path }) => assert!(path.ends_with("0.npz")),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn directories_named_like_samples_are_not_counted() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("0.npz")).unwrap();
        assert_eq!(SampleStore::open(tmp.path()).len(), 0);
    }
}
