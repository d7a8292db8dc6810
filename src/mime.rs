//! Media-type helpers for `Accept` negotiation and text classification

/// Pick a media type out of an `Accept`-style header value.
///
/// The value is split on `,` and `;` and scanned in order: the first fully
/// specified `type/subtype` wins, then the first `type/*`, then `*/*`. When
/// `no_wildcard` is set a bare wildcard match is discarded and `default` is
/// returned instead. An empty value yields `default`.
pub fn parse_accepted_type(header_value: &str, default: &str, no_wildcard: bool) -> String {
  let mut first_partial: Option<&str> = None;
  let mut saw_wildcard = false;

  for part in header_value.split([',', ';']) {
    let candidate = part.trim();
    if candidate.is_empty() || !candidate.contains('/') {
      continue;
    }
    if candidate == "*/*" {
      saw_wildcard = true;
      continue;
    }
    if candidate.ends_with("/*") {
      first_partial.get_or_insert(candidate);
      continue;
    }
    if candidate.contains('*') {
      saw_wildcard = true;
      continue;
    }
    return candidate.to_string();
  }

  if let Some(partial) = first_partial {
    return partial.to_string();
  }
  if saw_wildcard && !no_wildcard {
    return "*/*".to_string();
  }
  default.to_string()
}

/// Whether a media type names a textual body.
///
/// True for `text/*` plus the XML family (`/xml`, `/xhtml+xml`); everything
/// else, including an empty value, is treated as binary.
pub fn is_text(mime: &str) -> bool {
  if mime.is_empty() {
    return false;
  }
  mime.starts_with("text/") || mime.ends_with("/xhtml+xml") || mime.ends_with("/xml")
}
