//! End-to-end display round trip over a localhost socket: Open, four Data
//! buckets tiling a 4×4 image, Close, CloseAcknowledge.

use dspy::{
    BucketPixels, ClientState, DisplayClient, DisplayManager, DisplayRegistry, DisplayRequest,
    OpenParams,
};
use std::thread;

fn request(name: &str) -> DisplayRequest {
    DisplayRequest {
        name: name.to_string(),
        display_type: "file".to_string(),
        mode: "rgb".to_string(),
        required: true,
    }
}

fn solid_bucket(x: usize, y: usize, rgb: [f32; 3]) -> BucketPixels {
    BucketPixels {
        x_min: x,
        y_min: y,
        width: 2,
        height: 2,
        rgba: vec![[rgb[0], rgb[1], rgb[2], 1.0]; 4],
        depth: vec![0.0; 4],
    }
}

#[test]
fn quadrant_buckets_arrive_in_order_and_composite() {
    let dir = tempfile::tempdir().unwrap();
    let out_name = dir.path().join("frame.tif");
    let out_str = out_name.to_string_lossy().into_owned();

    let mut manager = DisplayManager::bind(0).unwrap();
    let port = manager.port();

    let client_thread = thread::spawn(move || {
        let mut client = DisplayClient::connect("127.0.0.1", port).unwrap();
        let run = client.run().unwrap();
        assert_eq!(client.state(), ClientState::Closed);
        let image = client.image().expect("Open allocated an image");
        // The four quadrants hold exactly the bucket colors.
        assert_eq!(image.display_pixel(0, 0)[..3], [255, 0, 0]);
        assert_eq!(image.display_pixel(1, 1)[..3], [255, 0, 0]);
        assert_eq!(image.display_pixel(2, 0)[..3], [0, 255, 0]);
        assert_eq!(image.display_pixel(3, 1)[..3], [0, 255, 0]);
        assert_eq!(image.display_pixel(0, 2)[..3], [0, 0, 255]);
        assert_eq!(image.display_pixel(1, 3)[..3], [0, 0, 255]);
        assert_eq!(image.display_pixel(2, 2)[..3], [255, 255, 255]);
        assert_eq!(image.display_pixel(3, 3)[..3], [255, 255, 255]);
        run
    });

    let open = OpenParams {
        x_res: 4,
        y_res: 4,
        channels: 3,
        bits_per_sample: 0,
        crop_x_min: 0,
        crop_x_max: 4,
        crop_y_min: 0,
        crop_y_max: 4,
    };
    manager
        .attach(
            request(&out_str),
            None,
            &open,
            [0.0; 16],
            [0.0; 16],
        )
        .unwrap();
    assert_eq!(manager.display_count(), 1);

    manager.send_bucket(&solid_bucket(0, 0, [1.0, 0.0, 0.0]));
    manager.send_bucket(&solid_bucket(2, 0, [0.0, 1.0, 0.0]));
    manager.send_bucket(&solid_bucket(0, 2, [0.0, 0.0, 1.0]));
    manager.send_bucket(&solid_bucket(2, 2, [1.0, 1.0, 1.0]));
    manager.close_all();

    let run = client_thread.join().expect("client thread panicked");
    let saved = run.saved.expect("Close saved a TIFF");
    assert_eq!(saved, out_name);
    let reloaded = image::open(&saved).unwrap().to_rgba8();
    assert_eq!(reloaded.dimensions(), (4, 4));
    assert_eq!(reloaded.get_pixel(0, 0).0[..3], [255, 0, 0]);
    assert_eq!(reloaded.get_pixel(3, 3).0[..3], [255, 255, 255]);
}

#[test]
fn abandon_drops_the_frame_without_saving() {
    let mut manager = DisplayManager::bind(0).unwrap();
    let port = manager.port();
    let client_thread = thread::spawn(move || {
        let mut client = DisplayClient::connect("127.0.0.1", port).unwrap();
        client.run().unwrap()
    });
    let open = OpenParams {
        x_res: 2,
        y_res: 2,
        channels: 3,
        bits_per_sample: 0,
        crop_x_min: 0,
        crop_x_max: 2,
        crop_y_min: 0,
        crop_y_max: 2,
    };
    manager
        .attach(request("unused.tif"), None, &open, [0.0; 16], [0.0; 16])
        .unwrap();
    manager.abandon_all();
    let run = client_thread.join().unwrap();
    assert!(run.abandoned);
    assert!(run.saved.is_none());
}
