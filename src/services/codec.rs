//! Image codec service
//!
//! Stateless helpers for moving image bytes in and out of base64 data URIs, inferring
//! media types from upload filenames, and re-encoding decoded layers as PNG.

use crate::error::{LayerFlowError, Result};
use base64::{engine::general_purpose, Engine as _};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;

/// Media type assumed when a filename carries no recognised extension
pub const DEFAULT_MEDIA_TYPE: &str = "image/png";

/// Service for data URI and media type conversions
pub struct ImageCodec;

impl ImageCodec {
    /// Wrap raw bytes as `data:<media_type>;base64,<payload>`
    ///
    /// The bytes are not inspected; callers are expected to pass image content.
    ///
    /// # Examples
    /// ```rust
    /// use layerflow::services::ImageCodec;
    ///
    /// let uri = ImageCodec::bytes_to_data_uri(b"abc", "image/png");
    /// assert_eq!(uri, "data:image/png;base64,YWJj");
    /// ```
    #[must_use]
    pub fn bytes_to_data_uri(bytes: &[u8], media_type: &str) -> String {
        let payload = general_purpose::STANDARD.encode(bytes);
        format!("data:{media_type};base64,{payload}")
    }

    /// Split a base64 data URI back into its media type and decoded bytes
    ///
    /// # Errors
    /// - The string does not start with `data:`
    /// - The `;base64,` marker is missing
    /// - The payload is not valid standard base64
    pub fn data_uri_to_bytes(uri: &str) -> Result<(String, Vec<u8>)> {
        let rest = uri
            .strip_prefix("data:")
            .ok_or_else(|| LayerFlowError::invalid_request("data URI must start with 'data:'"))?;
        let (media_type, payload) = rest.split_once(";base64,").ok_or_else(|| {
            LayerFlowError::invalid_request("data URI is missing the ';base64,' marker")
        })?;

        let bytes = general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| LayerFlowError::invalid_request(format!("base64 decode failed: {e}")))?;

        Ok((media_type.to_string(), bytes))
    }

    /// Infer the media type from a filename's extension
    ///
    /// Only the text after the last `.` is considered, case-insensitively. Unknown or
    /// missing extensions fall back to [`DEFAULT_MEDIA_TYPE`].
    ///
    /// # Examples
    /// ```rust
    /// use layerflow::services::ImageCodec;
    ///
    /// assert_eq!(ImageCodec::media_type_from_filename("photo.JPG"), "image/jpeg");
    /// assert_eq!(ImageCodec::media_type_from_filename("scan"), "image/png");
    /// ```
    #[must_use]
    pub fn media_type_from_filename(name: &str) -> &'static str {
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            "gif" => "image/gif",
            "avif" => "image/avif",
            _ => DEFAULT_MEDIA_TYPE,
        }
    }

    /// Encode an RGBA layer as PNG bytes
    ///
    /// # Errors
    /// - PNG encoder failure
    pub fn encode_png(layer: &RgbaImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        layer.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
        Ok(buffer)
    }

    /// Encode an RGBA layer as a `data:image/png;base64,...` URI
    ///
    /// # Errors
    /// - PNG encoder failure
    pub fn png_data_uri(layer: &RgbaImage) -> Result<String> {
        let png = Self::encode_png(layer)?;
        Ok(Self::bytes_to_data_uri(&png, "image/png"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_media_type_table() {
        let cases = [
            ("a.png", "image/png"),
            ("a.jpg", "image/jpeg"),
            ("a.jpeg", "image/jpeg"),
            ("a.webp", "image/webp"),
            ("a.gif", "image/gif"),
            ("a.avif", "image/avif"),
        ];
        for (name, expected) in cases {
            assert_eq!(ImageCodec::media_type_from_filename(name), expected, "{name}");
        }
    }

    #[test]
    fn test_media_type_case_and_fallbacks() {
        assert_eq!(ImageCodec::media_type_from_filename("PHOTO.JPEG"), "image/jpeg");
        assert_eq!(ImageCodec::media_type_from_filename("archive.tar.WebP"), "image/webp");
        assert_eq!(ImageCodec::media_type_from_filename("image.bmp"), "image/png");
        assert_eq!(ImageCodec::media_type_from_filename("noextension"), "image/png");
        assert_eq!(ImageCodec::media_type_from_filename(""), "image/png");
        assert_eq!(ImageCodec::media_type_from_filename("trailing."), "image/png");
    }

    #[test]
    fn test_data_uri_round_trip() {
        let samples: [&[u8]; 4] = [b"", b"\x00", b"\x89PNG\r\n\x1a\n", &[0xff; 1027]];
        for bytes in samples {
            let uri = ImageCodec::bytes_to_data_uri(bytes, "image/webp");
            assert!(uri.starts_with("data:image/webp;base64,"));
            let (media_type, decoded) = ImageCodec::data_uri_to_bytes(&uri).unwrap();
            assert_eq!(media_type, "image/webp");
            assert_eq!(decoded, bytes);
        }
    }

    #[test]
    fn test_empty_payload_has_empty_suffix() {
        assert_eq!(ImageCodec::bytes_to_data_uri(&[], "image/png"), "data:image/png;base64,");
    }

    #[test]
    fn test_data_uri_rejects_malformed_input() {
        assert!(ImageCodec::data_uri_to_bytes("https://x/1.png").is_err());
        assert!(ImageCodec::data_uri_to_bytes("data:image/png,abc").is_err());
        assert!(ImageCodec::data_uri_to_bytes("data:image/png;base64,@@@").is_err());
    }

    #[test]
    fn test_png_data_uri_decodes_to_same_layer() {
        let layer = RgbaImage::from_pixel(3, 2, Rgba([10, 20, 30, 40]));
        let uri = ImageCodec::png_data_uri(&layer).unwrap();
        let (media_type, bytes) = ImageCodec::data_uri_to_bytes(&uri).unwrap();
        assert_eq!(media_type, "image/png");

        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(1, 1), &Rgba([10, 20, 30, 40]));
    }
}
