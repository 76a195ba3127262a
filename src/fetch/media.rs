//! Stateless helpers for images and resource hints.

use url::Url;

use crate::network::NetworkSpeed;

/// Widest image requested on a slow link.
pub const SLOW_MAX_WIDTH: u32 = 640;

const FAST_QUALITY: u32 = 85;
const SLOW_QUALITY: u32 = 60;

/// Rewrite an image URL with `quality` (and `width`) parameters for the link speed.
///
/// Existing `quality`/`width` parameters are replaced. URLs that do not parse
/// are returned unchanged.
pub fn adaptive_image_url(url: &str, speed: NetworkSpeed, width: Option<u32>) -> String {
  let Ok(mut parsed) = Url::parse(url) else {
    return url.to_string();
  };

  let (quality, width) = match speed {
    NetworkSpeed::Fast => (FAST_QUALITY, width),
    NetworkSpeed::Slow => (
      SLOW_QUALITY,
      Some(width.map_or(SLOW_MAX_WIDTH, |w| w.min(SLOW_MAX_WIDTH))),
    ),
  };

  let kept: Vec<(String, String)> = parsed
    .query_pairs()
    .filter(|(key, _)| key != "quality" && key != "width")
    .map(|(key, value)| (key.into_owned(), value.into_owned()))
    .collect();

  {
    let mut query = parsed.query_pairs_mut();
    query.clear();
    for (key, value) in &kept {
      query.append_pair(key, value);
    }
    if let Some(width) = width {
      query.append_pair("width", &width.to_string());
    }
    query.append_pair("quality", &quality.to_string());
  }

  parsed.to_string()
}

/// `srcset` attribute value for `widths`. Widths above [`SLOW_MAX_WIDTH`] are
/// left out on slow links, keeping at least the smallest.
pub fn generate_srcset(url: &str, widths: &[u32], speed: NetworkSpeed) -> String {
  let mut widths: Vec<u32> = widths.to_vec();
  widths.sort_unstable();
  widths.dedup();

  if speed == NetworkSpeed::Slow {
    let smallest = widths.first().copied();
    widths.retain(|w| *w <= SLOW_MAX_WIDTH);
    if widths.is_empty() {
      widths.extend(smallest);
    }
  }

  widths
    .iter()
    .map(|w| format!("{} {}w", adaptive_image_url(url, speed, Some(*w)), w))
    .collect::<Vec<_>>()
    .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintKind {
  /// Needed for the current view
  Preload,
  /// Likely needed soon
  Prefetch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHint {
  pub kind: HintKind,
  pub url: String,
  /// Destination for preloads (`image`, `script`, `style`, `fetch`)
  pub as_type: &'static str,
}

impl ResourceHint {
  pub fn new(kind: HintKind, url: impl Into<String>) -> Self {
    let url = url.into();
    let as_type = destination(&url);
    Self { kind, url, as_type }
  }

  /// Render as an HTML `<link>` tag.
  pub fn to_link_tag(&self) -> String {
    let href = self.url.replace('&', "&amp;").replace('"', "&quot;");
    match self.kind {
      HintKind::Preload => format!(r#"<link rel="preload" href="{}" as="{}">"#, href, self.as_type),
      HintKind::Prefetch => format!(r#"<link rel="prefetch" href="{}">"#, href),
    }
  }
}

fn destination(url: &str) -> &'static str {
  let path = url.split(['?', '#']).next().unwrap_or(url);
  let extension = path
    .rsplit_once('.')
    .map(|(_, ext)| ext.to_ascii_lowercase())
    .unwrap_or_default();
  match extension.as_str() {
    "png" | "jpg" | "jpeg" | "gif" | "webp" | "avif" | "svg" => "image",
    "js" | "mjs" => "script",
    "css" => "style",
    "woff" | "woff2" => "font",
    _ => "fetch",
  }
}

/// Hints for the next view. Prefetches are dropped on slow links.
pub fn resource_hints(preload: &[&str], prefetch: &[&str], speed: NetworkSpeed) -> Vec<ResourceHint> {
  let mut hints: Vec<ResourceHint> = preload
    .iter()
    .map(|url| ResourceHint::new(HintKind::Preload, *url))
    .collect();
  if speed == NetworkSpeed::Fast {
    hints.extend(
      prefetch
        .iter()
        .map(|url| ResourceHint::new(HintKind::Prefetch, *url)),
    );
  }
  hints
}
