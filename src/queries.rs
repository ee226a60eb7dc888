//! Query parameter cleaning for forwarded paths

use std::collections::HashSet;

use url::form_urlencoded;

/// Remove the named query parameters from a path's query string.
///
/// Parameter names are compared percent-decoded and case-sensitively.
/// Retained pairs keep their original order and their original encoding:
/// the query string is filtered segment-by-segment, never re-serialized.
pub fn clean_path_queries(params_to_clean: &HashSet<String>, path: &str) -> String {
    if params_to_clean.is_empty() {
        return path.to_string();
    }

    let Some((base, query)) = path.split_once('?') else {
        return path.to_string();
    };

    let retained: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && !params_to_clean.contains(&pair_name(pair)))
        .collect();

    if retained.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", retained.join("&"))
    }
}

/// Percent-decoded name of one `name=value` query segment.
fn pair_name(pair: &str) -> String {
    let raw = pair.split('=').next().unwrap_or(pair);
    form_urlencoded::parse(raw.as_bytes())
        .map(|(name, _)| name.into_owned())
        .collect()
}
