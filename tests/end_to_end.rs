use std::io::Cursor;
use std::num::NonZeroU32;

use ubi_engine::ubi::{
    generate, reconcile::GapPolicy, scan::IssueKind, scan_image, Actions, Geometry, ImageReader,
    ScanConfig, Ubinizer, VolType, VolumeDescriptor,
};

const PEB_SIZE: u32 = 16 * 1024;

fn geometry() -> Geometry {
    Geometry::new(PEB_SIZE, NonZeroU32::new(512).unwrap()).unwrap()
}

fn contents(len: usize) -> Vec<u8> {
    (0..len).map(|x| (x * 7 % 251) as u8).collect()
}

#[test]
fn three_lebs_reconcile_cleanly() -> anyhow::Result<()> {
    let geometry = geometry();
    let leb_size = geometry.max_leb_size() as usize;
    let source = contents(3 * leb_size);

    let descriptor = VolumeDescriptor::new(VolType::Dynamic)
        .id(0)
        .size(source.len() as u64);
    let mut image = Vec::new();
    let mut generator = generate(geometry, &descriptor, &source[..])?;
    assert_eq!(generator.write_all(&mut image)?, 3);

    let scan = scan_image(&image[..], &ScanConfig::new(PEB_SIZE))?;
    assert!(scan.issues.is_empty());

    let reconciler = &scan.reconciler;
    assert_eq!(reconciler.len(), 3);
    let lnums: Vec<u32> = reconciler.volume_lebs(0).map(|eb| eb.vid.lnum).collect();
    assert_eq!(lnums, [0, 1, 2]);
    for lnum in 0..3 {
        assert_eq!(reconciler.history(0, lnum).count(), 0);
    }

    let mut rebuilt = Vec::new();
    let reader = ImageReader::new(Cursor::new(&image), PEB_SIZE);
    reconciler.rebuild_volume(0, reader, &mut rebuilt, GapPolicy::Fail)?;
    assert_eq!(rebuilt, source);

    Ok(())
}

#[test]
fn interrupted_move_keeps_original() -> anyhow::Result<()> {
    let geometry = geometry();
    let leb_size = geometry.max_leb_size() as usize;
    let source = contents(3 * leb_size);

    let descriptor = VolumeDescriptor::new(VolType::Dynamic)
        .id(0)
        .size(source.len() as u64);
    let mut image = Vec::new();
    generate(geometry, &descriptor, &source[..])?.write_all(&mut image)?;

    // A wear-leveling move of LEB 1 that lost power before its data was fully written
    let moved = descriptor.clone().leb_version(1);
    let mut generator = generate(geometry, &moved, std::io::repeat(0x00))?;
    generator.emit_next_leb(Actions::NO_ERROR)?;
    generator
        .emit_next_leb(Actions::MARK_AS_UPDATE | Actions::BROKEN_DATA_CRC)?
        .write_to(&mut image)?;

    let scan = scan_image(&image[..], &ScanConfig::new(PEB_SIZE))?;
    assert_eq!(scan.ebt.len(), 4);
    assert_eq!(scan.issues.len(), 1);
    assert_eq!(scan.issues[0].pnum, 3);
    assert_eq!(scan.issues[0].kind, IssueKind::DataCrc);

    let reconciler = &scan.reconciler;
    assert_eq!(reconciler.authoritative(0, 1).map(|eb| eb.pnum), Some(1));
    assert_eq!(reconciler.rejected().map(|eb| eb.pnum).collect::<Vec<_>>(), [3]);

    let mut rebuilt = Vec::new();
    let reader = ImageReader::new(Cursor::new(&image), PEB_SIZE);
    reconciler.rebuild_volume(0, reader, &mut rebuilt, GapPolicy::Fail)?;
    assert_eq!(rebuilt, source);

    Ok(())
}

#[test]
fn image_with_volume_table() -> anyhow::Result<()> {
    let geometry = geometry();
    let rootfs = contents(40_000);
    let kernel = contents(20_000);

    let mut image = Vec::new();
    let table = Ubinizer::new(geometry)
        .volume(
            VolumeDescriptor::new(VolType::Dynamic)
                .name("rootfs")
                .size(rootfs.len() as u64)
                .autoresize(),
            &rootfs[..],
        )
        .volume(
            VolumeDescriptor::new(VolType::Static)
                .name("kernel")
                .size(kernel.len() as u64),
            &kernel[..],
        )
        .write_image(&mut image)?;

    let scan = scan_image(&image[..], &ScanConfig::from_geometry(&geometry))?;
    assert!(scan.issues.is_empty());
    assert_eq!(scan.reconciler.volume_ids().len(), 3);

    let records = scan
        .reconciler
        .volume_table(ImageReader::new(Cursor::new(&image), PEB_SIZE))?;
    assert_eq!(records.len(), table.records().len());
    for (decoded, written) in records.iter().zip(table.records()) {
        assert_eq!(decoded.as_ref().ok(), Some(written));
    }

    let rootfs_record = records[0].as_ref().ok().and_then(Option::as_ref);
    assert_eq!(rootfs_record.map(|x| x.autoresize()), Some(true));

    let mut rebuilt = Vec::new();
    let reader = ImageReader::new(Cursor::new(&image), PEB_SIZE);
    scan.reconciler
        .rebuild_volume(1, reader, &mut rebuilt, GapPolicy::Fail)?;
    assert_eq!(rebuilt, kernel);

    Ok(())
}
