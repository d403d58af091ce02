//! Store behaviour over synthetic `.npz` archives laid out like `numpy.savez` output.

use ndarray::{Array1, Array2, Array3};
use ndarray_npy::NpzWriter;
use npz_dataset::{
    DataLoader, DatasetError, LoaderConfig, SampleStore, TransformPipelineBuilder,
};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

type B = burn_ndarray::NdArray<f32>;

fn write_sample(
    root: &Path,
    index: usize,
    (w, h): (usize, usize),
    boxes: &[[f32; 4]],
    labels: &[i64],
) -> anyhow::Result<()> {
    let image = Array3::<u8>::from_shape_fn((h, w, 3), |(y, x, c)| match c {
        0 => (x * 10) as u8,
        1 => (y * 10) as u8,
        _ => index as u8,
    });
    let flat: Vec<f32> = boxes.iter().flatten().copied().collect();
    let boxes = Array2::from_shape_vec((boxes.len(), 4), flat)?;
    let labels = Array1::from_vec(labels.to_vec());

    let mut npz = NpzWriter::new(File::create(root.join(format!("{index}.npz")))?);
    npz.add_array("arr_0", &image)?;
    npz.add_array("arr_1", &boxes)?;
    npz.add_array("arr_2", &labels)?;
    npz.finish()?;
    Ok(())
}

fn write_contiguous(root: &Path, n: usize) -> anyhow::Result<()> {
    for i in 0..n {
        write_sample(root, i, (4, 3), &[[0.0, 0.0, 2.0, 2.0]], &[1])?;
    }
    Ok(())
}

#[test]
fn size_is_the_contiguous_file_count() -> anyhow::Result<()> {
    for n in [0usize, 1, 3, 5] {
        let tmp = tempfile::tempdir()?;
        write_contiguous(tmp.path(), n)?;
        fs::write(tmp.path().join("readme.txt"), b"ignored")?;
        fs::write(tmp.path().join(format!("{}.npy", n)), b"wrong extension")?;
        fs::write(tmp.path().join(format!("{}.npz", n + 2)), b"after a gap")?;
        let store = SampleStore::open(tmp.path());
        assert_eq!(store.len(), n, "store over {n} contiguous files");
    }
    Ok(())
}

#[test]
fn get_succeeds_in_range_and_is_not_found_at_len() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_contiguous(tmp.path(), 3)?;
    let store = SampleStore::open(tmp.path());
    for i in 0..store.len() {
        let sample = store.get(i)?;
        assert_eq!(sample.target.image_id, i as u64);
        assert_eq!(sample.image.dimensions(), (4, 3));
    }
    match store.get(3) {
        Err(DatasetError::NotFound { path }) => {
            assert_eq!(path, tmp.path().join("3.npz"));
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert!(matches!(
        store.get(usize::MAX),
        Err(DatasetError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn decode_round_trips_boxes_labels_and_pixels() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let boxes = [[1.0, 2.0, 5.0, 6.0], [0.5, 0.25, 7.0, 3.0]];
    let labels = [3i64, 1];
    write_sample(tmp.path(), 0, (8, 7), &boxes, &labels)?;

    let store = SampleStore::open(tmp.path());
    let sample = store.get(0)?;
    assert_eq!(sample.target.boxes, boxes.to_vec());
    assert_eq!(sample.target.labels, labels.to_vec());
    assert_eq!(sample.target.image_id, 0);
    assert_eq!(sample.target.boxes.len(), sample.target.labels.len());

    assert_eq!(sample.image.dimensions(), (8, 7));
    let px = sample.image.get_pixel(3, 2);
    assert_eq!(px.0, [30, 20, 0]);
    Ok(())
}

#[test]
fn gap_stops_the_count_even_though_later_files_exist() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_contiguous(tmp.path(), 2)?;
    write_sample(tmp.path(), 3, (4, 3), &[[0.0, 0.0, 1.0, 1.0]], &[2])?;

    let store = SampleStore::open(tmp.path());
    assert_eq!(store.len(), 2);
    let visited: Vec<u64> = store
        .iter()
        .map(|s| s.map(|s| s.target.image_id))
        .collect::<Result<_, _>>()?;
    assert_eq!(visited, vec![0, 1]);
    assert!(matches!(store.get(2), Err(DatasetError::NotFound { .. })));
    Ok(())
}

#[test]
fn empty_directory_has_size_zero_and_every_get_fails() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = SampleStore::open(tmp.path());
    assert_eq!(store.len(), 0);
    for i in [0usize, 1, 42] {
        assert!(matches!(store.get(i), Err(DatasetError::NotFound { .. })));
    }
    Ok(())
}

#[test]
fn samples_without_boxes_decode_to_empty_targets() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_sample(tmp.path(), 0, (2, 2), &[], &[])?;
    let sample = SampleStore::open(tmp.path()).get(0)?;
    assert!(sample.target.is_empty());
    assert!(sample.target.labels.is_empty());
    Ok(())
}

/// Writes a 2x2 image, then lets the caller add `arr_1` and `arr_2` in any dtype.
fn write_with<F>(root: &Path, index: usize, add: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut NpzWriter<File>) -> Result<(), ndarray_npy::WriteNpzError>,
{
    let mut npz = NpzWriter::new(File::create(root.join(format!("{index}.npz")))?);
    npz.add_array("arr_0", &Array3::<u8>::zeros((2, 2, 3)))?;
    add(&mut npz)?;
    npz.finish()?;
    Ok(())
}

#[test]
fn empty_float64_boxes_and_labels_decode_to_empty_targets() -> anyhow::Result<()> {
    // numpy stores `[]` as float64
    let tmp = tempfile::tempdir()?;
    write_with(tmp.path(), 0, |npz| {
        npz.add_array("arr_1", &Array2::<f64>::zeros((0, 4)))?;
        npz.add_array("arr_2", &Array1::<f64>::zeros(0))
    })?;
    let sample = SampleStore::open(tmp.path()).get(0)?;
    assert!(sample.target.is_empty());
    assert!(sample.target.labels.is_empty());
    Ok(())
}

#[test]
fn float_and_narrow_int_labels_are_converted() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_with(tmp.path(), 0, |npz| {
        npz.add_array("arr_1", &Array2::<i16>::from_elem((1, 4), 1))?;
        npz.add_array("arr_2", &Array1::from_vec(vec![2.0f64]))
    })?;
    write_with(tmp.path(), 1, |npz| {
        npz.add_array("arr_1", &Array2::<u16>::from_elem((2, 4), 3))?;
        npz.add_array("arr_2", &Array1::from_vec(vec![1i8, 4]))
    })?;

    let store = SampleStore::open(tmp.path());
    let first = store.get(0)?;
    assert_eq!(first.target.labels, vec![2]);
    assert_eq!(first.target.boxes, vec![[1.0; 4]]);
    let second = store.get(1)?;
    assert_eq!(second.target.labels, vec![1, 4]);
    assert_eq!(second.target.boxes, vec![[3.0; 4], [3.0; 4]]);
    Ok(())
}

#[test]
fn unsupported_dtype_names_the_stored_descriptor() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_with(tmp.path(), 0, |npz| {
        npz.add_array("arr_1", &Array2::<f32>::zeros((0, 4)))?;
        npz.add_array("arr_2", &Array1::from_vec(vec![true]))
    })?;
    match SampleStore::open(tmp.path()).get(0) {
        Err(DatasetError::Malformed { msg, .. }) => {
            assert!(msg.contains("arr_2"), "{msg}");
            assert!(msg.contains("b1"), "{msg}");
        }
        other => panic!("expected Malformed, got {other:?}"),
    }
    Ok(())
}

#[test]
fn unpaired_boxes_and_labels_are_rejected() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_sample(tmp.path(), 0, (2, 2), &[[0.0, 0.0, 1.0, 1.0]], &[1, 2])?;
    let err = SampleStore::open(tmp.path()).get(0).unwrap_err();
    assert!(matches!(err, DatasetError::Unpaired { boxes: 1, labels: 2, .. }));
    Ok(())
}

#[test]
fn corrupt_archive_surfaces_a_decode_error() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    fs::write(tmp.path().join("0.npz"), b"not a zip file")?;
    let store = SampleStore::open(tmp.path());
    assert_eq!(store.len(), 1);
    assert!(matches!(store.get(0), Err(DatasetError::Archive { .. })));
    Ok(())
}

#[test]
fn transform_runs_on_every_get_and_keeps_pairing() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_sample(tmp.path(), 0, (10, 4), &[[1.0, 0.0, 4.0, 2.0]], &[4])?;
    let flip = TransformPipelineBuilder::new()
        .flip_horizontal_prob(1.0)
        .build();
    let store = SampleStore::with_transform(tmp.path(), flip);
    let sample = store.get(0)?;
    assert_eq!(sample.target.boxes, vec![[6.0, 0.0, 9.0, 2.0]]);
    assert_eq!(sample.target.labels, vec![4]);
    Ok(())
}

#[test]
fn loader_visits_every_sample_once_per_epoch() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_contiguous(tmp.path(), 5)?;
    let store = Arc::new(SampleStore::open(tmp.path()));
    let loader = DataLoader::new(
        store,
        LoaderConfig {
            batch_size: 2,
            shuffle: true,
            seed: Some(11),
            num_workers: 2,
            drop_last: false,
        },
    )?;
    assert_eq!(loader.num_batches(), 3);

    let device = Default::default();
    let mut iter = loader.iter(0);
    let expected_order = iter.order().to_vec();
    let mut seen = Vec::new();
    let mut sizes = Vec::new();
    while let Some(batch) = iter.next_batch::<B>(&device)? {
        sizes.push(batch.len());
        assert_eq!(&batch.images.dims()[1..], &[3, 3, 4]);
        seen.extend(batch.targets.iter().map(|t| t.image_id as usize));
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(seen, expected_order);

    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2, 3, 4]);

    // Same seed and epoch reproduce the order.
    assert_eq!(loader.iter(0).order(), expected_order.as_slice());
    Ok(())
}

#[test]
fn loader_drop_last_skips_partial_batch() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_contiguous(tmp.path(), 3)?;
    let loader = DataLoader::new(
        Arc::new(SampleStore::open(tmp.path())),
        LoaderConfig {
            batch_size: 2,
            shuffle: false,
            seed: None,
            num_workers: 0,
            drop_last: true,
        },
    )?;
    assert_eq!(loader.num_batches(), 1);
    let device = Default::default();
    let mut iter = loader.iter(0);
    let first = iter.next_batch::<B>(&device)?.expect("one full batch");
    assert_eq!(
        first.targets.iter().map(|t| t.image_id).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert!(iter.next_batch::<B>(&device)?.is_none());
    Ok(())
}

#[test]
fn loader_propagates_sample_errors() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_contiguous(tmp.path(), 1)?;
    fs::write(tmp.path().join("1.npz"), b"garbage")?;
    let loader = DataLoader::new(
        Arc::new(SampleStore::open(tmp.path())),
        LoaderConfig {
            batch_size: 2,
            shuffle: false,
            num_workers: 2,
            ..Default::default()
        },
    )?;
    let device = Default::default();
    assert!(loader.iter(0).next_batch::<B>(&device).is_err());
    Ok(())
}
