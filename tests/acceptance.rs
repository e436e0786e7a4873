//! Reference results on the 512x512 "lena" test image.
//!
//! The image is not shipped with the crate. Point `TV_REGULARISERS_LENA` at a
//! copy and run `cargo test -- --ignored`.

use std::path::PathBuf;

use approx::assert_abs_diff_eq;
use tv_regularisers::{
    fgp_tv, rmse, rof_tv, Device, DeviceError, Error, FgpTvParams, Image, RofTvParams, Shape,
    TvMethod,
};

const ROF_RMSE: f32 = 0.006812507;
const FGP_RMSE: f32 = 0.019152347;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn lena() -> Image {
    let path = std::env::var_os("TV_REGULARISERS_LENA")
        .map(PathBuf::from)
        .expect("set TV_REGULARISERS_LENA to the path of the lena test image");
    let gray = image::open(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
        .to_luma8();
    let (width, height) = (gray.width() as usize, gray.height() as usize);
    let data = gray.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
    Image::new(Shape::D2 { height, width }, data).unwrap()
}

fn check(device: Device) {
    init();
    let input = lena();

    let params = RofTvParams::new(0.04, 50, 0.0025).with_device(device);
    let output = match rof_tv(&input, &params) {
        Err(Error::Device(DeviceError::Unavailable(reason))) => {
            eprintln!("skipping {device} acceptance: {reason}");
            return;
        }
        other => other.unwrap(),
    };
    assert_abs_diff_eq!(rmse(&input, &output).unwrap(), ROF_RMSE, epsilon = 1e-5);

    let params = FgpTvParams::new(0.04, 50, 1e-8)
        .with_method(TvMethod::Isotropic)
        .with_device(device);
    let output = fgp_tv(&input, &params).unwrap();
    assert_abs_diff_eq!(rmse(&input, &output).unwrap(), FGP_RMSE, epsilon = 1e-5);
}

#[test]
#[ignore = "needs the lena image, see TV_REGULARISERS_LENA"]
fn lena_cpu() {
    check(Device::Cpu);
}

#[test]
#[ignore = "needs the lena image and a GPU adapter"]
fn lena_gpu() {
    check(Device::Gpu);
}
