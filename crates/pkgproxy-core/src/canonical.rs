//! Canonical request URLs.

use reqwest::Url;

/// Returns the canonical form of `url` used for cache keys.
///
/// Scheme and host are lowercased and default ports dropped by the parser
/// already. On top of that the fragment is removed and query pairs are
/// sorted so that parameter order does not split the cache.
pub fn canonical_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    match url.query() {
        Some("") => url.set_query(None),
        Some(_) => {
            let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
            pairs.sort();
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        None => {}
    }

    url.into()
}
