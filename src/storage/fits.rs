//! FITS output through `fitsio`.
//!
//! One primary HDU holds the 16-bit unsigned image. cfitsio stores it as
//! `BITPIX = 16` with `BZERO = 32768`; the header record follows the structural
//! keywords in assembly order.

use std::fs;
use std::io;
use std::path::Path;

use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;

use crate::ccd::Frame;
use crate::error::{AppResult, DaqError};
use crate::header::{HeaderRecord, HeaderValue};

/// Length of a header card.
pub const CARD: usize = 80;

/// Write `frame` with `header` to `path`, creating parent directories.
///
/// Refuses to overwrite an existing file.
pub fn write_image(path: &Path, frame: &Frame, header: &HeaderRecord) -> AppResult<()> {
    if !frame.is_consistent() {
        return Err(DaqError::Controller {
            controller: frame.detector.clone(),
            message: format!(
                "frame has {} pixels, expected {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            ),
        });
    }
    if path.exists() {
        return Err(DaqError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", path.display()),
        )));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Row-major shape: rows first
    let description = ImageDescription {
        data_type: ImageType::UnsignedShort,
        dimensions: &[frame.height, frame.width],
    };
    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .open()?;
    let hdu = fptr.primary_hdu()?;
    hdu.write_image(&mut fptr, &frame.data)?;

    for card in header.cards() {
        let comment = card.comment.as_str();
        match &card.value {
            HeaderValue::Int(v) => hdu.write_key(&mut fptr, &card.name, (*v, comment))?,
            HeaderValue::Float(v) if v.is_finite() => {
                hdu.write_key(&mut fptr, &card.name, (*v, comment))?
            }
            HeaderValue::Float(v) => hdu.write_key(&mut fptr, &card.name, (v.to_string(), comment))?,
            HeaderValue::Str(s) => hdu.write_key(&mut fptr, &card.name, (s.as_str(), comment))?,
        }
    }
    drop(fptr);

    tracing::info!(
        path = %path.display(),
        detector = %frame.detector,
        width = frame.width,
        height = frame.height,
        "Wrote FITS file"
    );
    Ok(())
}

/// Header cards of a FITS file, up to and excluding `END`.
pub fn read_cards(path: &Path) -> AppResult<Vec<String>> {
    let bytes = fs::read(path)?;
    let mut cards = Vec::new();
    for chunk in bytes.chunks(CARD) {
        let card = String::from_utf8_lossy(chunk).into_owned();
        if card.trim_end() == "END" {
            return Ok(cards);
        }
        cards.push(card);
    }
    Err(DaqError::Configuration(format!(
        "{} has no END card",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CardSource;

    fn frame() -> Frame {
        Frame {
            detector: "r2".to_string(),
            width: 3,
            height: 2,
            data: vec![0, 1, 32768, 65535, 1000, 2],
        }
    }

    #[test]
    fn test_image_and_cards_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("60370").join("sdR-r2-00000001.fit");
        let mut header = HeaderRecord::new();
        header.set("CCD", "r2", "CCD name", CardSource::Core);
        header.set("EXPOSURE", HeaderValue::Int(12), "Exposure number", CardSource::Core);

        write_image(&path, &frame(), &header).unwrap();

        let mut fptr = FitsFile::open(&path).unwrap();
        let hdu = fptr.primary_hdu().unwrap();
        let pixels: Vec<u16> = hdu.read_image(&mut fptr).unwrap();
        assert_eq!(pixels, frame().data);
        assert_eq!(hdu.read_key::<i64>(&mut fptr, "NAXIS1").unwrap(), 3);
        assert_eq!(hdu.read_key::<i64>(&mut fptr, "NAXIS2").unwrap(), 2);
        assert_eq!(hdu.read_key::<String>(&mut fptr, "CCD").unwrap(), "r2");

        let cards = read_cards(&path).unwrap();
        assert!(cards[0].starts_with("SIMPLE  =                    T"));
        assert!(cards.iter().any(|c| c.starts_with("BZERO   =                32768")));
        assert!(cards.iter().any(|c| c.starts_with("EXPOSURE=                   12")));
        assert_eq!(cards.last().map(|c| c.len()), Some(CARD));
    }

    #[test]
    fn test_existing_file_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sdR-r2-00000001.fit");
        std::fs::write(&path, b"keep").unwrap();

        let err = write_image(&path, &frame(), &HeaderRecord::new()).unwrap_err();
        assert!(matches!(err, DaqError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep");
    }

    #[test]
    fn test_inconsistent_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = frame();
        bad.data.pop();

        let err = write_image(&dir.path().join("x.fit"), &bad, &HeaderRecord::new()).unwrap_err();
        assert!(matches!(err, DaqError::Controller { .. }));
    }
}
