//! Single forward pass over one image or tile.

use ndarray::{s, Array3, Array4};
use tracing::trace;

use crate::error::{SrError, SrResult};
use crate::loader::ModelHandle;
use crate::nn::{ChannelOrder, TensorLayout};
use crate::types::BgrImage;

/// Run `handle` over `image` and return the `native_scale`× result.
///
/// The input is never modified. Forward errors and outputs of the wrong size
/// surface as [`SrError::InferenceFailure`] without a tile index; tiled
/// callers attach one.
pub fn run(handle: &ModelHandle, image: &BgrImage) -> SrResult<BgrImage> {
    let layout = handle.layout();
    let scale = handle.native_scale() as usize;
    let (h, w) = (image.height(), image.width());

    let input = to_nchw(image, &layout);
    let input = pad_nchw(&input, h, w, layout.pad_align);

    trace!(
        network = handle.network().name(),
        height = h,
        width = w,
        padded_h = input.dim().2,
        padded_w = input.dim().3,
        "Running forward pass"
    );

    let output = handle
        .network()
        .forward(&input)
        .map_err(|e| SrError::inference(e.context("forward pass failed")))?;

    let (_, channels, out_h, out_w) = output.dim();
    let (padded_h, padded_w) = (input.dim().2, input.dim().3);
    if channels != 3 || out_h != padded_h * scale || out_w != padded_w * scale {
        return Err(SrError::inference(anyhow::anyhow!(
            "network returned {channels}x{out_h}x{out_w}, expected 3x{}x{} for native scale {scale}",
            padded_h * scale,
            padded_w * scale
        )));
    }

    let cropped = output.slice(s![0, .., ..h * scale, ..w * scale]);
    Ok(from_chw(&cropped.to_owned(), &layout))
}

fn to_nchw(image: &BgrImage, layout: &TensorLayout) -> Array4<f32> {
    let pixels = image.pixels();
    let (h, w) = (image.height(), image.width());
    let norm = layout.value_range.max() / 255.0;
    let rgb = layout.channel_order == ChannelOrder::Rgb;
    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        let src_c = if rgb { 2 - c } else { c };
        pixels[[y, x, src_c]] as f32 * norm
    })
}

fn from_chw(output: &Array3<f32>, layout: &TensorLayout) -> BgrImage {
    let (_, h, w) = output.dim();
    let max = layout.value_range.max();
    let rgb = layout.channel_order == ChannelOrder::Rgb;
    let pixels = Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
        let src_c = if rgb { 2 - c } else { c };
        let v = output[[src_c, y, x]].clamp(0.0, max) / max * 255.0;
        v.round().clamp(0.0, 255.0) as u8
    });
    BgrImage::from_array_unchecked(pixels)
}

/// Reflection-pad an NCHW array so H and W are multiples of `align`.
fn pad_nchw(arr: &Array4<f32>, h: usize, w: usize, align: usize) -> Array4<f32> {
    let pad_h = pad_amount(h, align);
    let pad_w = pad_amount(w, align);

    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    let new_h = h + pad_h;
    let new_w = w + pad_w;
    let mut padded = Array4::<f32>::zeros((1, 3, new_h, new_w));

    padded
        .slice_mut(s![.., .., ..h, ..w])
        .assign(&arr.slice(s![.., .., ..h, ..w]));

    for y in 0..pad_h {
        let src_y = reflect_index(h + y, h);
        for c in 0..3 {
            for x in 0..w {
                padded[[0, c, h + y, x]] = arr[[0, c, src_y, x]];
            }
        }
    }

    for x in 0..pad_w {
        let src_x = reflect_index(w + x, w);
        for c in 0..3 {
            for y in 0..new_h {
                let src_y = if y < h { y } else { reflect_index(y, h) };
                padded[[0, c, y, w + x]] = arr[[0, c, src_y, src_x]];
            }
        }
    }

    padded
}

/// Mirror index `i >= len` back into `0..len`, without repeating the edge.
/// Degenerates to edge replication for 1-pixel extents.
pub(crate) fn reflect_index(i: usize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let m = i % period;
    if m < len {
        m
    } else {
        period - m
    }
}

fn pad_amount(dim: usize, align: usize) -> usize {
    if align <= 1 {
        return 0;
    }
    (align - (dim % align)) % align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Checkpoint;
    use crate::nn::{Network, ValueRange};

    /// Nearest-neighbour upscaler.
    struct Replicate {
        scale: usize,
    }

    impl Network for Replicate {
        fn forward(&self, input: &Array4<f32>) -> anyhow::Result<Array4<f32>> {
            let (n, c, h, w) = input.dim();
            let s = self.scale;
            Ok(Array4::from_shape_fn((n, c, h * s, w * s), |(b, c, y, x)| {
                input[[b, c, y / s, x / s]]
            }))
        }

        fn name(&self) -> &str {
            "replicate"
        }
    }

    struct Failing;

    impl Network for Failing {
        fn forward(&self, _input: &Array4<f32>) -> anyhow::Result<Array4<f32>> {
            anyhow::bail!("device lost")
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn handle(network: Box<dyn Network>, scale: u32, layout: TensorLayout) -> ModelHandle {
        ModelHandle::new(network, scale, "mock", Checkpoint::DirectModel, layout)
    }

    fn gradient(h: usize, w: usize) -> BgrImage {
        let pixels =
            Array3::from_shape_fn((h, w, 3), |(y, x, c)| ((y * 31 + x * 7 + c * 50) % 256) as u8);
        BgrImage::new(pixels).unwrap()
    }

    #[test]
    fn test_run_replicates_pixels() {
        let image = gradient(5, 7);
        let model = handle(Box::new(Replicate { scale: 3 }), 3, TensorLayout::default());
        let out = run(&model, &image).unwrap();
        assert_eq!((out.height(), out.width()), (15, 21));
        for y in 0..15 {
            for x in 0..21 {
                assert_eq!(out.pixel(y, x), image.pixel(y / 3, x / 3));
            }
        }
    }

    #[test]
    fn test_run_with_padding_and_byte_range_bgr() {
        let image = gradient(5, 6);
        let layout = TensorLayout {
            channel_order: ChannelOrder::Bgr,
            value_range: ValueRange::ByteRange,
            pad_align: 4,
        };
        let model = handle(Box::new(Replicate { scale: 2 }), 2, layout);
        let out = run(&model, &image).unwrap();
        assert_eq!((out.height(), out.width()), (10, 12));
        assert_eq!(out.pixel(9, 11), image.pixel(4, 5));
        assert_eq!(out.pixel(0, 0), image.pixel(0, 0));
    }

    #[test]
    fn test_run_rejects_wrong_output_scale() {
        let image = gradient(4, 4);
        let model = handle(Box::new(Replicate { scale: 2 }), 4, TensorLayout::default());
        let err = run(&model, &image).unwrap_err();
        assert!(matches!(err, SrError::InferenceFailure { tile_index: None, .. }));
    }

    #[test]
    fn test_run_wraps_forward_error() {
        let model = handle(Box::new(Failing), 2, TensorLayout::default());
        let err = run(&model, &gradient(2, 2)).unwrap_err();
        let source = std::error::Error::source(&err).unwrap();
        assert!(format!("{source:#}").contains("forward pass failed"));
    }

    #[test]
    fn test_pad_nchw_reflects_edges() {
        let arr = Array4::from_shape_fn((1, 3, 3, 3), |(_, _, y, x)| (y * 3 + x) as f32);
        let padded = pad_nchw(&arr, 3, 3, 4);
        assert_eq!(padded.dim(), (1, 3, 4, 4));
        // Row 3 mirrors row 1, column 3 mirrors column 1.
        assert_eq!(padded[[0, 0, 3, 0]], arr[[0, 0, 1, 0]]);
        assert_eq!(padded[[0, 0, 0, 3]], arr[[0, 0, 0, 1]]);
        assert_eq!(padded[[0, 0, 3, 3]], arr[[0, 0, 1, 1]]);
    }

    #[test]
    fn test_pad_amount() {
        assert_eq!(pad_amount(5, 4), 3);
        assert_eq!(pad_amount(8, 4), 0);
        assert_eq!(pad_amount(7, 1), 0);
    }

    #[test]
    fn test_reflect_single_pixel_extent() {
        assert_eq!(reflect_index(1, 1), 0);
        assert_eq!(reflect_index(3, 1), 0);
    }
}
