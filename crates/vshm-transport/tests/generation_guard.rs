use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use vshm_abi::{device_id, hdr_offset, FeatureBits, CONFIG_VERSION};
use vshm_transport::config_space::{HeaderInit, GENERATION_BUSY_BIT};
use vshm_transport::{
    read_with_generation_guard, DeviceConfig, DriverConfig, ProtocolViolation, TransportError,
};

fn config(blob: &[u8]) -> DeviceConfig {
    DeviceConfig::create(&HeaderInit {
        device: device_id::NET,
        vendor: 1,
        version: CONFIG_VERSION,
        host_features: FeatureBits::empty(),
        guest_page_size: 4096,
        queue_num_max: &[256, 256],
        device_config: blob,
        device_config_reserve: 0,
    })
    .unwrap()
}

#[test]
fn readers_never_see_a_torn_update() {
    let dev = config(&[0u8; 16]);
    let drv = DriverConfig::attach(dev.memory(), 1 << 20).unwrap();
    let blob = u64::from(dev.layout().dev_cfg_offset);
    dev.update(|v| v.write_u32_le(blob + 8, !0)).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(3));
    let clean = Arc::new(AtomicU64::new(0));

    let writer = {
        let stop = stop.clone();
        let start = start.clone();
        thread::spawn(move || {
            start.wait();
            let mut k = 0u32;
            while !stop.load(Ordering::Relaxed) {
                k = k.wrapping_add(1);
                dev.update(|v| {
                    v.write_u32_le(blob, k)?;
                    v.write_u32_le(blob + 4, k.rotate_left(7))?;
                    v.write_u32_le(blob + 8, !k)
                })
                .unwrap();
                thread::yield_now();
            }
            dev
        })
    };

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let drv = drv.clone();
            let start = start.clone();
            let clean = clean.clone();
            thread::spawn(move || {
                start.wait();
                for _ in 0..20_000 {
                    let read = drv.read_with_generation_guard(|v| {
                        Ok((
                            v.read_u32_le(blob)?,
                            v.read_u32_le(blob + 4)?,
                            v.read_u32_le(blob + 8)?,
                        ))
                    });
                    match read {
                        Ok((a, b, c)) => {
                            assert_eq!(b, a.rotate_left(7), "torn read: {a:#x} {b:#x} {c:#x}");
                            assert_eq!(c, !a, "torn read: {a:#x} {b:#x} {c:#x}");
                            clean.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TransportError::Protocol(ProtocolViolation::GenerationUnstable {
                            ..
                        })) => {}
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
            })
        })
        .collect();

    for reader in readers {
        reader.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    let dev = writer.join().unwrap();

    assert!(clean.load(Ordering::Relaxed) > 0);
    assert_eq!(dev.generation().unwrap() & GENERATION_BUSY_BIT, 0);
}

#[test]
fn a_stuck_writer_exhausts_the_retry_limit() {
    let dev = config(&[]);
    dev.view()
        .store_u32(
            hdr_offset::GENERATION as u64,
            GENERATION_BUSY_BIT | 6,
            Ordering::Release,
        )
        .unwrap();

    let err = read_with_generation_guard(dev.view(), 3, |v| v.read_u32_le(0)).unwrap_err();
    assert_eq!(
        err,
        TransportError::Protocol(ProtocolViolation::GenerationUnstable { attempts: 3 })
    );

    // A zero limit still makes one attempt.
    let err = read_with_generation_guard(dev.view(), 0, |v| v.read_u32_le(0)).unwrap_err();
    assert_eq!(
        err,
        TransportError::Protocol(ProtocolViolation::GenerationUnstable { attempts: 1 })
    );
}

#[test]
fn every_published_update_advances_the_generation() {
    let dev = config(&[0u8; 8]);
    let drv = DriverConfig::attach(dev.memory(), 8).unwrap();
    let g0 = drv.generation().unwrap();

    dev.write_device_config(0, &[1, 2, 3, 4]).unwrap();
    let g1 = drv.generation().unwrap();
    assert_eq!(g1, g0 + 1);
    assert_eq!(&drv.device_config_bytes().unwrap()[..4], &[1, 2, 3, 4]);

    dev.reset().unwrap();
    assert_eq!(drv.generation().unwrap(), g1 + 1);

    // Out-of-range writes fail but still publish a fresh generation.
    assert!(dev.write_device_config(6, &[0; 4]).is_err());
    assert_eq!(drv.generation().unwrap(), g1 + 2);
}
