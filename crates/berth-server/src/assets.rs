//! Embedded branding assets served in place of a handful of editor-internal
//! static URLs.

use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;

static LOGO_PNG: &[u8] = include_bytes!("../assets/logo.png");

const CACHE_CONTROL: &str = "public, max-age=86400";

pub fn logo_png() -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static(CACHE_CONTROL),
            ),
        ],
        LOGO_PNG,
    )
        .into_response()
}

/// The same logo wrapped in a trivial SVG carrying the PNG as a data URI,
/// for the editor's dark-mode favicon variant.
pub fn logo_svg() -> Response {
    let encoded = base64::engine::general_purpose::STANDARD.encode(LOGO_PNG);
    let svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="48" height="48" viewBox="0 0 48 48">
  <image href="data:image/png;base64,{encoded}" width="48" height="48"/>
</svg>"#
    );
    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("image/svg+xml"),
            ),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static(CACHE_CONTROL),
            ),
        ],
        svg,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_logo_is_a_png() {
        assert_eq!(&LOGO_PNG[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn responses_carry_content_types() {
        let png = logo_png();
        assert_eq!(png.headers()[header::CONTENT_TYPE], "image/png");
        let svg = logo_svg();
        assert_eq!(svg.headers()[header::CONTENT_TYPE], "image/svg+xml");
    }
}
