use lsmt::{CreateArgs, RandomAccessFile, RoFile, RwFile};
use rand::prelude::*;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use test_log::test;

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

const VSIZE: u64 = 1 << 20;

#[test]
fn close_seal_then_open_ro_preserves_reads() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;
    let (data, index) = rw_pair(dir.path(), "layer");

    let mut rng = StdRng::seed_from_u64(42);
    let mut shadow = vec![0u8; VSIZE as usize];

    let file = RwFile::create(data.clone(), index, &CreateArgs::new(VSIZE))?;
    for _ in 0..100 {
        let sectors = rng.random_range(1..=16u64);
        let offset = rng.random_range(0..(VSIZE / 512 - sectors)) * 512;
        let fill: u8 = rng.random();
        let payload = vec![fill; (sectors * 512) as usize];
        file.pwrite(&payload, offset)?;
        shadow[offset as usize..offset as usize + payload.len()].fill(fill);
    }
    file.close_seal(false)?;

    let sealed = RoFile::open(data)?;
    assert_eq!(VSIZE, sealed.virtual_size());

    let mut buf = vec![0u8; VSIZE as usize];
    sealed.pread(&mut buf, 0)?;
    assert_eq!(shadow, buf);
    Ok(())
}

#[test]
fn close_seal_reopen_matches_fresh_open() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;
    let (data, index) = rw_pair(dir.path(), "layer");

    let file = RwFile::create(data.clone(), index, &CreateArgs::new(VSIZE))?;
    file.pwrite(&[0x5A; 16384], 8192)?;
    file.trim(12288, 4096)?;

    let reopened = file.close_seal(true)?.expect("asked for a reopen");
    let fresh = RoFile::open(data)?;

    let mut from_reopened = vec![0u8; 65536];
    let mut from_fresh = vec![0u8; 65536];
    reopened.pread(&mut from_reopened, 0)?;
    fresh.pread(&mut from_fresh, 0)?;

    assert_eq!(from_fresh, from_reopened);
    assert_eq!(fresh.index().len(), reopened.index().len());
    assert_eq!(fresh.stat(), reopened.stat());
    Ok(())
}

#[test]
fn sealed_trailer_records_grown_virtual_size() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;
    let (data, index) = rw_pair(dir.path(), "layer");

    let file = RwFile::create(data.clone(), index, &CreateArgs::new(4096))?;
    file.pwrite(&[1u8; 4096], 1 << 20)?;
    file.close_seal(false)?;

    let sealed = RoFile::open(data)?;
    assert_eq!((1 << 20) + 4096, sealed.virtual_size());
    Ok(())
}

#[test]
fn sealed_layer_keeps_user_tag_and_uuid() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;
    let (data, index) = rw_pair(dir.path(), "layer");

    let args = CreateArgs::new(VSIZE).with_user_tag("golden image");
    let uuid = args.uuid;

    let file = RwFile::create(data.clone(), index, &args)?;
    file.pwrite(&[2u8; 512], 0)?;
    file.close_seal(false)?;

    let size = data.metadata()?.len();
    let trailer = lsmt::header::read_block(&*data, size - 4096)?;
    assert!(trailer.is_sealed());
    assert_eq!(Some(uuid), trailer.uuid());
    assert_eq!(b"golden image", trailer.user_tag());

    let sealed = RoFile::open(data)?;
    assert_eq!(Some(uuid), sealed.uuid(0));
    Ok(())
}

#[test]
fn sealed_layer_joins_a_stack() -> lsmt::Result<()> {
    let dir = tempfile::tempdir()?;

    let (bottom_data, bottom_index) = rw_pair(dir.path(), "bottom");
    let bottom_args = CreateArgs::new(VSIZE);
    let bottom_uuid = bottom_args.uuid;
    let bottom = RwFile::create(bottom_data.clone(), bottom_index, &bottom_args)?;
    bottom.pwrite(&[0x10; 8192], 0)?;
    bottom.close_seal(false)?;

    let (top_data, top_index) = rw_pair(dir.path(), "top");
    let top = RwFile::create(
        top_data.clone(),
        top_index,
        &CreateArgs::new(VSIZE).with_parent_uuid(bottom_uuid),
    )?;
    top.pwrite(&[0x20; 4096], 4096)?;
    top.close_seal(false)?;

    let stack = RoFile::open_stack(vec![
        bottom_data as Arc<dyn RandomAccessFile>,
        top_data as Arc<dyn RandomAccessFile>,
    ])?;

    let mut buf = [0u8; 8192];
    stack.pread(&mut buf, 0)?;
    assert!(buf[..4096].iter().all(|&b| b == 0x10));
    assert!(buf[4096..].iter().all(|&b| b == 0x20));
    Ok(())
}
