use std::any::Any;
use std::io::Cursor;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;

use bytes::Bytes;
use image::{guess_format, load_from_memory_with_format, DynamicImage};

use crate::asset::{ResizeMode, SizeLabel, SizeParams, SizeSpecs};

/// Produces the bytes of one size variant from the original's bytes.
pub trait Deriver: Send + Sync + 'static {
    fn derive(&self, source: &[u8], params: &SizeParams) -> anyhow::Result<Bytes>;
}

impl<F> Deriver for F
where
    F: Fn(&[u8], &SizeParams) -> anyhow::Result<Bytes> + Send + Sync + 'static,
{
    fn derive(&self, source: &[u8], params: &SizeParams) -> anyhow::Result<Bytes> {
        (self)(source, params)
    }
}

pub type SharedDeriver = Arc<dyn Deriver>;

/// Resizes images with the `image` crate, keeping the source's encoding.
#[derive(Debug, Default, Copy, Clone)]
pub struct ImageResizer;

impl Deriver for ImageResizer {
    fn derive(&self, source: &[u8], params: &SizeParams) -> anyhow::Result<Bytes> {
        let format = guess_format(source)?;
        let img = load_from_memory_with_format(source, format)?;
        let resized = resize(params, &img);

        let mut buff = Cursor::new(Vec::new());
        resized.write_to(&mut buff, format)?;
        Ok(Bytes::from(buff.into_inner()))
    }
}

pub fn resize(params: &SizeParams, img: &DynamicImage) -> DynamicImage {
    let filter = params.filter.into();
    match params.mode {
        ResizeMode::Fit => img.resize(params.width, params.height, filter),
        ResizeMode::Fill => img.resize_to_fill(params.width, params.height, filter),
        ResizeMode::Exact => img.resize_exact(params.width, params.height, filter),
    }
}

pub struct DerivedVariant {
    pub label: SizeLabel,
    pub result: anyhow::Result<Bytes>,
}

/// Derives every requested size from the original on the rayon pool.
///
/// Each size gets its own result, a failing size never stops the others.
/// A deriver that panics fails only the size it was deriving.
/// This blocks until every derivation is done so it belongs on a blocking
/// thread, not the async runtime.
pub fn derive_variants(
    source: Bytes,
    sizes: &SizeSpecs,
    deriver: &SharedDeriver,
) -> Vec<DerivedVariant> {
    let (tx, rx) = crossbeam::channel::bounded(sizes.len().max(1));
    for (label, params) in sizes {
        let label = label.clone();
        let params = *params;
        let local_tx = tx.clone();
        let local_source = source.clone();
        let local_deriver = deriver.clone();
        rayon::spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| local_deriver.derive(&local_source, &params)))
                .unwrap_or_else(|payload| Err(anyhow!("deriver panicked: {}", panic_message(&*payload))));

            // The receiver only goes away once every sender is gone.
            let _ = local_tx.send(DerivedVariant { label, result });
        });
    }

    // Needed to prevent deadlock.
    drop(tx);

    let mut finished = Vec::with_capacity(sizes.len());
    while let Ok(derived) = rx.recv() {
        finished.push(derived);
    }

    finished
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown cause"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use image::{ImageBuffer, ImageOutputFormat, Rgb};

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 255) as u8, (y % 255) as u8, 128]));
        let mut buff = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buff, ImageOutputFormat::Png)
            .unwrap();
        buff.into_inner()
    }

    #[test]
    fn test_image_resizer_fill() -> anyhow::Result<()> {
        let source = sample_png(64, 32);
        let out = ImageResizer.derive(&source, &SizeParams::new(16, 16))?;

        let img = image::load_from_memory(&out)?;
        assert_eq!((img.width(), img.height()), (16, 16));
        assert_eq!(guess_format(&out)?, image::ImageFormat::Png);
        Ok(())
    }

    #[test]
    fn test_image_resizer_fit_keeps_aspect_ratio() -> anyhow::Result<()> {
        let source = sample_png(64, 32);
        let mut params = SizeParams::new(16, 16);
        params.mode = ResizeMode::Fit;

        let img = image::load_from_memory(&ImageResizer.derive(&source, &params)?)?;
        assert_eq!((img.width(), img.height()), (16, 8));
        Ok(())
    }

    #[test]
    fn test_image_resizer_rejects_garbage() {
        assert!(ImageResizer.derive(b"definitely not an image", &SizeParams::new(8, 8)).is_err());
    }

    #[test]
    fn test_derive_variants_reports_each_size() {
        let deriver: SharedDeriver = Arc::new(|source: &[u8], params: &SizeParams| -> anyhow::Result<Bytes> {
            if params.width == 13 {
                return Err(anyhow!("unlucky size"));
            }
            Ok(Bytes::from(format!("{}:{}", params.width, source.len())))
        });

        let mut sizes = SizeSpecs::new();
        sizes.insert(SizeLabel::new("small").unwrap(), SizeParams::new(10, 10));
        sizes.insert(SizeLabel::new("broken").unwrap(), SizeParams::new(13, 13));
        sizes.insert(SizeLabel::new("large").unwrap(), SizeParams::new(40, 40));

        let mut derived = derive_variants(Bytes::from_static(b"abcd"), &sizes, &deriver);
        derived.sort_by(|a, b| a.label.cmp(&b.label));

        assert_eq!(derived.len(), 3);
        assert_eq!(derived[0].label.as_str(), "broken");
        assert!(derived[0].result.is_err());
        assert_eq!(derived[1].result.as_ref().unwrap().as_ref(), b"40:4");
        assert_eq!(derived[2].result.as_ref().unwrap().as_ref(), b"10:4");
    }

    #[test]
    fn test_derive_variants_survives_panics() {
        let deriver: SharedDeriver = Arc::new(|_: &[u8], params: &SizeParams| -> anyhow::Result<Bytes> {
            if params.width == 30 {
                panic!("cannot handle {}x{}", params.width, params.height);
            }
            Ok(Bytes::from_static(b"ok"))
        });

        let mut sizes = SizeSpecs::new();
        sizes.insert(SizeLabel::new("small").unwrap(), SizeParams::new(10, 10));
        sizes.insert(SizeLabel::new("large").unwrap(), SizeParams::new(30, 30));

        let mut derived = derive_variants(Bytes::from_static(b"abcd"), &sizes, &deriver);
        derived.sort_by(|a, b| a.label.cmp(&b.label));

        assert_eq!(derived.len(), 2);
        let err = derived[0].result.as_ref().unwrap_err().to_string();
        assert_eq!(err, "deriver panicked: cannot handle 30x30");
        assert!(derived[1].result.is_ok());
    }

    #[test]
    fn test_derive_variants_without_sizes() {
        let deriver: SharedDeriver = Arc::new(ImageResizer);
        assert!(derive_variants(Bytes::new(), &SizeSpecs::new(), &deriver).is_empty());
    }
}
