//! Display helpers for secrets.

/// Mask all but the last four characters of an API key.
///
/// Keys of four characters or fewer are returned unchanged; an empty key
/// stays empty.
pub fn mask_api_key(api_key: &str) -> String {
    let count = api_key.chars().count();
    if count <= 4 {
        return api_key.to_string();
    }
    let visible: String = api_key.chars().skip(count - 4).collect();
    format!("{}{visible}", "*".repeat(count - 4))
}
