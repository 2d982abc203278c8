use lsmt::{CreateArgs, Error, RandomAccessFile, RoFile, RwFile};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use test_log::test;
use uuid::Uuid;

fn rw_pair(dir: &Path, name: &str) -> (Arc<std::fs::File>, Arc<std::fs::File>) {
    let open = |suffix: &str| {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(format!("{name}.{suffix}")))
            .expect("should open");
        Arc::new(file)
    };
    (open("data"), open("index"))
}

struct SealedLayer {
    file: Arc<std::fs::File>,
    uuid: Uuid,
}

fn sealed_layer(
    dir: &Path,
    name: &str,
    vsize: u64,
    parent: Option<Uuid>,
    fill: impl FnOnce(&RwFile) -> lsmt::Result<()>,
) -> lsmt::Result<SealedLayer> {
    let (data, index) = rw_pair(dir, name);

    let mut args = CreateArgs::new(vsize);
    if let Some(parent) = parent {
        args = args.with_parent_uuid(parent);
    }
    let uuid = args.uuid;

    let layer = RwFile::create(data.clone(), index, &args)?;
    fill(&layer)?;
    layer.close_seal(false)?;

    Ok(SealedLayer { file: data, uuid })
}

/// L1 (bottom) .. L3 (top), chained by parent uuid, each writing its own
/// pattern at its own 4 KiB block.
fn chain(dir: &Path) -> lsmt::Result<[SealedLayer; 3]> {
    let l1 = sealed_layer(dir, "l1", 1 << 20, None, |f| {
        f.pwrite(&[0x11; 4096], 0).map(|_| ())
    })?;
    let l2 = sealed_layer(dir, "l2", 1 << 20, Some(l1.uuid), |f| {
        f.pwrite(&[0x22; 4096], 4096).map(|_| ())
    })?;
    let l3 = sealed_layer(dir, "l3", 1 << 20, Some(l2.uuid), |f| {
        f.pwrite(&[0x33; 4096], 8192).map(|_| ())
    })?;
    Ok([l1, l2, l3])
}

fn files_of(layers: &[SealedLayer]) -> Vec<Arc<dyn RandomAccessFile>> {
    layers
        .iter()
        .map(|l| l.file.clone() as Arc<dyn RandomAccessFile>)
        .collect()
}

#[test]
fn stacked_layers_read_as_one_device() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;
    let layers = chain(dir.path())?;

    let stack = RoFile::open_stack(files_of(&layers))?;
    assert_eq!(3, stack.layer_count());

    let mut buf = [0u8; 12288];
    assert_eq!(12288, stack.pread(&mut buf, 0)?);
    assert!(buf[..4096].iter().all(|&b| b == 0x11));
    assert!(buf[4096..8192].iter().all(|&b| b == 0x22));
    assert!(buf[8192..].iter().all(|&b| b == 0x33));
    Ok(())
}

#[test]
fn upper_layer_shadows_lower() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;

    let bottom = sealed_layer(dir.path(), "bottom", 1 << 20, None, |f| {
        f.pwrite(&[0xAA; 8192], 0).map(|_| ())
    })?;
    let top = sealed_layer(dir.path(), "top", 1 << 20, Some(bottom.uuid), |f| {
        f.pwrite(&[0xBB; 4096], 0).map(|_| ())
    })?;

    let stack = RoFile::open_stack(files_of(&[bottom, top]))?;

    let mut buf = [0u8; 8192];
    stack.pread(&mut buf, 0)?;
    assert!(buf[..4096].iter().all(|&b| b == 0xBB));
    assert!(buf[4096..].iter().all(|&b| b == 0xAA));
    Ok(())
}

#[test]
fn fully_zeroed_middle_layer_masks_bottom() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;

    let bottom = sealed_layer(dir.path(), "bottom", 1 << 20, None, |f| {
        f.pwrite(&[0xAA; 12288], 0).map(|_| ())
    })?;
    let middle = sealed_layer(dir.path(), "middle", 1 << 20, Some(bottom.uuid), |f| {
        f.trim(0, 12288)
    })?;
    let top = sealed_layer(dir.path(), "top", 1 << 20, Some(middle.uuid), |f| {
        f.pwrite(&[0xCC; 4096], 0).map(|_| ())
    })?;

    let stack = RoFile::open_stack(files_of(&[bottom, middle, top]))?;

    let mut buf = [0xFFu8; 12288];
    stack.pread(&mut buf, 0)?;
    assert!(buf[..4096].iter().all(|&b| b == 0xCC));
    // the middle layer's hole shadows the bottom layer's data
    assert!(buf[4096..].iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn broken_parent_chain_is_rejected() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;

    let l1 = sealed_layer(dir.path(), "l1", 1 << 20, None, |f| {
        f.pwrite(&[1u8; 512], 0).map(|_| ())
    })?;
    // parent uuid names a layer that is not in the stack
    let l2 = sealed_layer(dir.path(), "l2", 1 << 20, Some(Uuid::new_v4()), |f| {
        f.pwrite(&[2u8; 512], 512).map(|_| ())
    })?;

    assert!(matches!(
        RoFile::open_stack(files_of(&[l1, l2])),
        Err(Error::ParentChainMismatch(_))
    ));
    Ok(())
}

#[test]
fn null_parent_uuid_skips_chain_check() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;

    let l1 = sealed_layer(dir.path(), "l1", 1 << 20, None, |f| {
        f.pwrite(&[1u8; 512], 0).map(|_| ())
    })?;
    // no parent recorded at all: tolerated with a warning
    let l2 = sealed_layer(dir.path(), "l2", 1 << 20, None, |f| {
        f.pwrite(&[2u8; 512], 512).map(|_| ())
    })?;

    assert!(RoFile::open_stack(files_of(&[l1, l2])).is_ok());
    Ok(())
}

#[test]
fn rw_layer_stacks_over_ro_set() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;
    let layers = chain(dir.path())?;
    let top_uuid = layers[2].uuid;

    let stack = RoFile::open_stack(files_of(&layers))?;

    let (data, index) = rw_pair(dir.path(), "writable");
    let writable = RwFile::create(
        data,
        index,
        &CreateArgs::new(1 << 20).with_parent_uuid(top_uuid),
    )?;
    let device = writable.stack(stack, true)?;
    assert_eq!(4, device.layer_count());

    // the writable layer shadows the read-only set
    device.pwrite(&[0xDD; 4096], 4096)?;

    let mut buf = [0u8; 12288];
    device.pread(&mut buf, 0)?;
    assert!(buf[..4096].iter().all(|&b| b == 0x11));
    assert!(buf[4096..8192].iter().all(|&b| b == 0xDD));
    assert!(buf[8192..].iter().all(|&b| b == 0x33));
    Ok(())
}

#[test]
fn read_only_stack_rejects_seal_and_commit() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;
    let layers = chain(dir.path())?;
    let stack = RoFile::open_stack(files_of(&layers))?;

    assert!(matches!(stack.close_seal(), Err(Error::NotWritable)));

    let dst = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dir.path().join("dst"))?;
    assert!(matches!(
        stack.commit(&dst, &lsmt::CommitArgs::default()),
        Err(Error::NotWritable)
    ));
    Ok(())
}

#[test]
fn stacked_read_only_file_reports_stat() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;
    let layers = chain(dir.path())?;
    let stack = RoFile::open_stack(files_of(&layers))?;

    let stat = stack.stat();
    assert_eq!(1 << 20, stat.size);
    assert_eq!(24, stat.blocks);

    let data_stat = stack.data_stat();
    assert_eq!(24 * 512, data_stat.valid_data_size);
    Ok(())
}
