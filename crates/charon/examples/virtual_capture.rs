//! Drive the whole control plane against the virtual device port: open a
//! camera, bundle two streams, inject frames and print the matched
//! super-buffers.
//!
//! Run with: `cargo run -p charon --example virtual_capture`

use std::sync::Arc;
use std::time::Duration;

use charon::prelude::*;
use parking_lot::Mutex;

fn main() -> Result<(), CamError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let port = Arc::new(VirtualPort::new()?);
    let registry = CameraRegistry::new(vec![Arc::clone(&port) as Arc<dyn DevicePort>]);

    let cam = registry.open(0)?;
    let session = registry.session(cam).ok_or(CamError::InvalidHandle)?;
    println!("capability: {:?}", session.query_capability()?);

    let ch = session.add_channel()?;
    let channel = session.channel(ch)?;

    let mut streams = Vec::new();
    for stream_type in [StreamType::Preview, StreamType::Video] {
        let stream = channel.add_stream()?;
        channel.config_stream(
            stream,
            StreamConfig {
                stream_type,
                format: StreamFormat::new(
                    FourCc::new(*b"NV12"),
                    Resolution::new(640, 480).ok_or(CamError::InvalidHandle)?,
                ),
                buf_count: 4,
                buf_size: 640 * 480 * 3 / 2,
            },
        )?;
        streams.push(stream);
    }

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let log = delivered.clone();
    channel.init_bundle(
        BundleAttr::default(),
        Arc::new(move |superbuf: SuperBuf| {
            println!(
                "superbuf frame {} with {} buffers",
                superbuf.frame_idx,
                superbuf.bufs.len()
            );
            log.lock().push(superbuf);
        }),
    )?;
    channel.start()?;

    let server_ids: Vec<u32> = streams
        .iter()
        .filter_map(|s| channel.stream(*s).ok()?.server_id())
        .collect();
    let mut returned = 0usize;
    for frame_idx in 0..8 {
        for id in &server_ids {
            port.inject_frame(*id, frame_idx)?;
        }
        // Hand each matched set's buffers back so the hardware queue
        // never starves.
        while returned <= frame_idx as usize {
            let ready: Vec<SuperBuf> = delivered.lock().drain(..).collect();
            for superbuf in &ready {
                for buf in &superbuf.bufs {
                    channel.return_buf(buf.stream, buf.buf_index)?;
                }
            }
            returned += ready.len();
            if returned <= frame_idx as usize {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    channel.stop()?;
    session.del_channel(ch)?;
    registry.close(cam)?;
    println!("done");
    Ok(())
}
