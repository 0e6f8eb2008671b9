use std::path::Path;

use image::GrayImage;
use ndarray::Array2;

use crate::error::Result;
use crate::frame::Frame;

/// Load an image file as an untimed grayscale frame in [0, 1].
/// Color images are converted to luma; 16-bit sources keep their precision.
pub fn load_frame(path: &Path) -> Result<Frame> {
    let img = image::open(path)?;
    let gray = img.to_luma16();
    let (w, h) = gray.dimensions();
    let mut data = Array2::<f32>::zeros((h as usize, w as usize));

    for (col, row, pixel) in gray.enumerate_pixels() {
        data[[row as usize, col as usize]] = pixel.0[0] as f32 / 65535.0;
    }

    Ok(Frame::untimed(data))
}

/// Save a frame as 8-bit grayscale; the format follows the file extension.
pub fn save_frame(frame: &Frame, path: &Path) -> Result<()> {
    let mut img = GrayImage::new(frame.width() as u32, frame.height() as u32);
    for ((row, col), &v) in frame.data.indexed_iter() {
        let val = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        img.put_pixel(col as u32, row as u32, image::Luma([val]));
    }
    img.save(path)?;
    Ok(())
}
