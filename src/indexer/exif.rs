//! Best-effort camera metadata extraction.
//!
//! Reads EXIF-like fields out of the image container. Every failure mode
//! collapses to "no metadata" — a corrupt or absent EXIF segment must never
//! stop the ingest pipeline.

use std::collections::BTreeMap;
use std::path::Path;

use exif::{In, Tag, Value};

/// Parsed camera metadata plus GPS coordinates when present.
#[derive(Debug, Default, Clone)]
pub struct ImageMetadata {
    pub fields: BTreeMap<String, String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Fields surfaced to the UI, keyed by the names stored in the JSON blob.
const FIELDS: [(Tag, &str); 11] = [
    (Tag::Make, "camera_make"),
    (Tag::Model, "camera_model"),
    (Tag::FNumber, "f_number"),
    (Tag::ExposureTime, "exposure_time"),
    (Tag::PhotographicSensitivity, "iso"),
    (Tag::ExposureBiasValue, "exposure_bias"),
    (Tag::FocalLength, "focal_length"),
    (Tag::MaxApertureValue, "max_aperture"),
    (Tag::MeteringMode, "metering_mode"),
    (Tag::Flash, "flash"),
    (Tag::FocalLengthIn35mmFilm, "focal_length_35mm"),
];

/// Extracts metadata from an image file. Parse failures yield an empty map.
pub fn extract(path: &Path) -> ImageMetadata {
    match try_extract(path) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::debug!("No EXIF metadata for {:?}: {}", path.file_name(), e);
            ImageMetadata::default()
        }
    }
}

fn try_extract(path: &Path) -> Result<ImageMetadata, exif::Error> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader)?;

    let mut meta = ImageMetadata::default();
    for (tag, key) in FIELDS {
        if let Some(field) = exif.get_field(tag, In::PRIMARY) {
            let value = field.display_value().with_unit(&exif).to_string();
            if !value.is_empty() {
                meta.fields.insert(key.to_string(), value);
            }
        }
    }

    meta.latitude = read_coordinate(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S");
    meta.longitude = read_coordinate(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W");
    Ok(meta)
}

/// Reads a GPS coordinate as decimal degrees, negated when the reference
/// hemisphere matches `negative_ref`.
fn read_coordinate(
    exif: &exif::Exif,
    value_tag: Tag,
    ref_tag: Tag,
    negative_ref: &str,
) -> Option<f64> {
    let field = exif.get_field(value_tag, In::PRIMARY)?;
    let Value::Rational(ref dms) = field.value else {
        return None;
    };
    if dms.len() < 3 {
        return None;
    }
    let decimal = dms_to_decimal(dms[0].to_f64(), dms[1].to_f64(), dms[2].to_f64());

    let reference = exif
        .get_field(ref_tag, In::PRIMARY)
        .map(|f| f.display_value().to_string())
        .unwrap_or_default();
    if reference.contains(negative_ref) {
        Some(-decimal)
    } else {
        Some(decimal)
    }
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dms_conversion() {
        // 48° 51' 29.6" (Paris latitude)
        let d = dms_to_decimal(48.0, 51.0, 29.6);
        assert!((d - 48.858222).abs() < 1e-5);
        assert_eq!(dms_to_decimal(0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_extract_without_exif_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plain.png");
        image::RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        let meta = extract(&path);
        assert!(meta.fields.is_empty());
        assert!(meta.latitude.is_none());
        assert!(meta.longitude.is_none());
    }

    #[test]
    fn test_extract_missing_file_is_empty() {
        let meta = extract(Path::new("/definitely/not/here.jpg"));
        assert!(meta.fields.is_empty());
    }
}
