//! End-to-end annotation workflow on an in-memory database
//!
//! Annotate, read back through cutouts and locations, resolve conflicts with
//! each policy, shave, then delete the entity.

use bytes::Bytes;
use ndarray::Array4;
use spatialdb::keys::{exception_row, exception_table, index_table};
use spatialdb::{
    morton, Channel, ConflictPolicy, CuboidData, CutoutOptions, DatasetLayout, EngineConfig,
    MemoryRowStore, RowStore, SpatialDb, StorageBackends,
};
use std::sync::Arc;

fn create_db() -> SpatialDb {
    let layout = DatasetLayout::new([64, 64, 16], [8, 8, 4], 3)
        .unwrap()
        .with_super_cuboid([2, 2, 2]);
    SpatialDb::new(
        &EngineConfig::new("scenario"),
        layout,
        StorageBackends::in_memory(u64::MAX),
    )
    .unwrap()
}

/// Database over a row store the test can reach into
fn create_db_with_rows() -> (SpatialDb, Arc<MemoryRowStore>) {
    let rows = Arc::new(MemoryRowStore::new());
    let layout = DatasetLayout::new([64, 64, 16], [8, 8, 4], 3)
        .unwrap()
        .with_super_cuboid([2, 2, 2]);
    let backends = StorageBackends {
        rows: rows.clone(),
        ..StorageBackends::in_memory(u64::MAX)
    };
    let db = SpatialDb::new(&EngineConfig::new("scenario"), layout, backends).unwrap();
    (db, rows)
}

/// Commit a row no reader can decode
async fn corrupt_row(rows: &MemoryRowStore, table: &str, row: &str) {
    let mut txn = rows.begin().await.unwrap();
    txn.insert(table, row, Bytes::from_static(b"garbage"))
        .await
        .unwrap();
    txn.commit().await.unwrap();
}

fn sorted(mut voxels: Vec<[u64; 3]>) -> Vec<[u64; 3]> {
    voxels.sort();
    voxels.dedup();
    voxels
}

#[tokio::test]
async fn test_annotate_cutout_locations() {
    let db = create_db();
    let neurons = Channel::annotation("neurons").unwrap();
    let voxels = [[7, 7, 3], [8, 8, 4], [20, 30, 10]];

    db.annotate(&neurons, 7, 0, 0, &voxels, ConflictPolicy::Overwrite)
        .await
        .unwrap();

    let cube = db
        .cutout(&neurons, [4, 4, 2], [24, 30, 10], 0, &CutoutOptions::default())
        .await
        .unwrap();
    assert_eq!(cube.dims(), [24, 30, 10]);
    for v in voxels {
        let local = [v[0] - 4, v[1] - 4, v[2] - 2];
        assert_eq!(cube.label_at(0, local).unwrap(), 7);
    }
    assert_eq!(cube.label_at(0, [0, 0, 0]).unwrap(), 0);

    let locations = db.get_locations(&neurons, 7, 0, 0).await.unwrap();
    assert_eq!(locations, sorted(voxels.to_vec()));
    assert_eq!(db.get_voxel(&neurons, 0, 0, [20, 30, 10]).await.unwrap(), 7);
}

#[tokio::test]
async fn test_repeated_annotation_merges() {
    let db = create_db();
    let neurons = Channel::annotation("neurons").unwrap();

    db.annotate(&neurons, 7, 0, 0, &[[1, 1, 1]], ConflictPolicy::Overwrite)
        .await
        .unwrap();
    db.annotate(&neurons, 7, 0, 0, &[[40, 40, 12]], ConflictPolicy::Overwrite)
        .await
        .unwrap();

    let locations = db.get_locations(&neurons, 7, 0, 0).await.unwrap();
    assert_eq!(locations, vec![[1, 1, 1], [40, 40, 12]]);

    let (corner, dim) = db
        .get_bounding_box(&neurons, &[7], 0, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(corner, [1, 1, 1]);
    assert_eq!(dim, [40, 40, 12]);
}

#[tokio::test]
async fn test_conflict_policies() {
    let db = create_db();
    let neurons = Channel::annotation("neurons").unwrap();

    db.annotate(&neurons, 7, 0, 0, &[[8, 8, 4], [9, 9, 4]], ConflictPolicy::Overwrite)
        .await
        .unwrap();

    // Preserve keeps the first label
    db.annotate(&neurons, 11, 0, 0, &[[9, 9, 4]], ConflictPolicy::Preserve)
        .await
        .unwrap();
    assert_eq!(db.get_voxel(&neurons, 0, 0, [9, 9, 4]).await.unwrap(), 7);

    // Exception keeps the first label and records the second
    db.annotate(&neurons, 9, 0, 0, &[[8, 8, 4], [10, 8, 4]], ConflictPolicy::Exception)
        .await
        .unwrap();
    assert_eq!(db.get_voxel(&neurons, 0, 0, [8, 8, 4]).await.unwrap(), 7);
    assert_eq!(db.get_voxel(&neurons, 0, 0, [10, 8, 4]).await.unwrap(), 9);

    let address = morton::encode([1, 1, 1]).unwrap();
    let offsets = db
        .get_exceptions(&neurons, 0, address, 0, 9)
        .await
        .unwrap();
    assert_eq!(offsets, vec![[0, 0, 0]]);

    // Exceptions count as locations of the entity
    let locations = db.get_locations(&neurons, 9, 0, 0).await.unwrap();
    assert_eq!(locations, vec![[8, 8, 4], [10, 8, 4]]);

    // An id-filtered cutout shows the exception voxel as the entity
    let cube = db
        .anno_cutout(&neurons, &[9], 0, 0, [8, 8, 4], [4, 4, 1], Some(1))
        .await
        .unwrap();
    assert_eq!(cube.label_at(0, [0, 0, 0]).unwrap(), 1);
    assert_eq!(cube.label_at(0, [2, 0, 0]).unwrap(), 1);
    assert_eq!(cube.label_at(0, [1, 1, 0]).unwrap(), 0);

    // Overwrite replaces it
    db.annotate(&neurons, 11, 0, 0, &[[9, 9, 4]], ConflictPolicy::Overwrite)
        .await
        .unwrap();
    assert_eq!(db.get_voxel(&neurons, 0, 0, [9, 9, 4]).await.unwrap(), 11);
}

#[tokio::test]
async fn test_shave_then_delete() {
    let db = create_db();
    let neurons = Channel::annotation("neurons").unwrap();
    let voxels = [[2, 2, 0], [3, 2, 0], [33, 17, 9]];

    db.annotate(&neurons, 5, 0, 0, &voxels, ConflictPolicy::Overwrite)
        .await
        .unwrap();
    db.shave(&neurons, 5, 0, 0, &[[3, 2, 0]]).await.unwrap();

    assert_eq!(db.get_voxel(&neurons, 0, 0, [3, 2, 0]).await.unwrap(), 0);
    let locations = db.get_locations(&neurons, 5, 0, 0).await.unwrap();
    assert_eq!(locations, vec![[2, 2, 0], [33, 17, 9]]);

    let touched = db.delete_anno_data(&neurons, 5).await.unwrap();
    assert!(touched >= 2);
    assert!(db.get_locations(&neurons, 5, 0, 0).await.unwrap().is_empty());
    assert!(db
        .get_bounding_box(&neurons, &[5], 0, 0)
        .await
        .unwrap()
        .is_none());
    assert_eq!(db.get_voxel(&neurons, 0, 0, [33, 17, 9]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_coarser_channel_reads_at_finer_resolution() {
    let db = create_db();
    let coarse = Channel::annotation("coarse").unwrap().with_resolution(1);

    db.annotate(&coarse, 3, 0, 1, &[[5, 6, 2]], ConflictPolicy::Overwrite)
        .await
        .unwrap();

    let locations = db.get_locations(&coarse, 3, 0, 0).await.unwrap();
    assert_eq!(
        locations,
        vec![[10, 12, 2], [10, 13, 2], [11, 12, 2], [11, 13, 2]]
    );

    let cube = db
        .cutout(&coarse, [10, 12, 2], [2, 2, 1], 0, &CutoutOptions::default())
        .await
        .unwrap();
    for x in 0..2 {
        for y in 0..2 {
            assert_eq!(cube.label_at(0, [x, y, 0]).unwrap(), 3);
        }
    }
}

#[tokio::test]
async fn test_failed_annotate_changes_nothing() {
    let (db, rows) = create_db_with_rows();
    let neurons = Channel::annotation("neurons").unwrap();
    db.annotate(&neurons, 3, 0, 0, &[[1, 1, 1]], ConflictPolicy::Overwrite)
        .await
        .unwrap();
    let dirty = db.coordinator().cache_index().dirty_len().await.unwrap();
    corrupt_row(&rows, &index_table("neurons", 0), "7&0").await;

    // Conflicts with 3 at [1, 1, 1] would become exceptions of 7
    assert!(db
        .annotate(&neurons, 7, 0, 0, &[[1, 1, 1], [20, 20, 5]], ConflictPolicy::Exception)
        .await
        .is_err());

    assert_eq!(db.get_voxel(&neurons, 0, 0, [1, 1, 1]).await.unwrap(), 3);
    assert_eq!(db.get_voxel(&neurons, 0, 0, [20, 20, 5]).await.unwrap(), 0);
    assert_eq!(db.get_locations(&neurons, 3, 0, 0).await.unwrap(), vec![[1, 1, 1]]);
    assert!(db.get_exceptions(&neurons, 0, 0, 0, 7).await.unwrap().is_empty());
    assert_eq!(rows.table_len(&exception_table("neurons", 0)), 0);
    assert_eq!(db.coordinator().cache_index().dirty_len().await.unwrap(), dirty);
}

#[tokio::test]
async fn test_failed_shave_changes_nothing() {
    let (db, rows) = create_db_with_rows();
    let neurons = Channel::annotation("neurons").unwrap();
    db.annotate(&neurons, 5, 0, 0, &[[2, 2, 0], [40, 40, 8]], ConflictPolicy::Overwrite)
        .await
        .unwrap();
    db.annotate(&neurons, 6, 0, 0, &[[3, 2, 0]], ConflictPolicy::Overwrite)
        .await
        .unwrap();
    corrupt_row(&rows, &exception_table("neurons", 0), &exception_row(0, 0, 5)).await;

    // [3, 2, 0] belongs to 6, so 5 looks for an exception there
    assert!(db
        .shave(&neurons, 5, 0, 0, &[[40, 40, 8], [2, 2, 0], [3, 2, 0]])
        .await
        .is_err());

    assert_eq!(db.get_voxel(&neurons, 0, 0, [2, 2, 0]).await.unwrap(), 5);
    assert_eq!(db.get_voxel(&neurons, 0, 0, [3, 2, 0]).await.unwrap(), 6);
    assert_eq!(db.get_voxel(&neurons, 0, 0, [40, 40, 8]).await.unwrap(), 5);
    assert_eq!(db.coordinator().cache_index().dirty_len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_failed_dense_annotate_changes_nothing() {
    let (db, rows) = create_db_with_rows();
    let neurons = Channel::annotation("neurons").unwrap();
    db.annotate(&neurons, 2, 0, 0, &[[9, 0, 0]], ConflictPolicy::Overwrite)
        .await
        .unwrap();
    corrupt_row(&rows, &index_table("neurons", 0), "4&0").await;

    let data = CuboidData::U32(Array4::from_shape_fn((1, 2, 2, 12), |(_, _, _, x)| {
        if x < 6 {
            3
        } else {
            4
        }
    }));
    assert!(db
        .annotate_dense(&neurons, 0, [0, 0, 0], 0, &data, ConflictPolicy::Overwrite)
        .await
        .is_err());

    let cube = db
        .cutout(&neurons, [0, 0, 0], [12, 2, 2], 0, &CutoutOptions::default())
        .await
        .unwrap();
    for x in 0..12 {
        let expected = if x == 9 { 2 } else { 0 };
        assert_eq!(cube.label_at(0, [x, 0, 0]).unwrap(), expected);
    }
    assert!(db.get_locations(&neurons, 3, 0, 0).await.unwrap().is_empty());
    assert_eq!(db.get_locations(&neurons, 2, 0, 0).await.unwrap(), vec![[9, 0, 0]]);
}

#[tokio::test]
async fn test_zoom_out_over_odd_extent() {
    let layout = DatasetLayout::new([63, 64, 16], [8, 8, 4], 2)
        .unwrap()
        .with_super_cuboid([2, 2, 2]);
    let db = SpatialDb::new(
        &EngineConfig::new("scenario"),
        layout,
        StorageBackends::in_memory(u64::MAX),
    )
    .unwrap();
    let neurons = Channel::annotation("neurons").unwrap();
    db.annotate(&neurons, 7, 0, 0, &[[62, 0, 0], [60, 2, 0]], ConflictPolicy::Overwrite)
        .await
        .unwrap();

    // The last coarse column only half overlaps the finer image
    let cube = db
        .cutout(&neurons, [31, 0, 0], [1, 1, 1], 1, &CutoutOptions::default())
        .await
        .unwrap();
    assert_eq!(cube.dims(), [1, 1, 1]);
    assert_eq!(cube.label_at(0, [0, 0, 0]).unwrap(), 7);

    let cube = db
        .cutout(&neurons, [28, 0, 0], [4, 2, 1], 1, &CutoutOptions::default())
        .await
        .unwrap();
    assert_eq!(cube.dims(), [4, 2, 1]);
    assert_eq!(cube.label_at(0, [3, 0, 0]).unwrap(), 7);
    assert_eq!(cube.label_at(0, [2, 1, 0]).unwrap(), 7);
    assert_eq!(cube.label_at(0, [0, 0, 0]).unwrap(), 0);
}
