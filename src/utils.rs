//! Feature bitmap helpers.
//!
//! A feature bitmap maps feature names to whether they are enabled. Devices
//! usually report short feature codes; [`translate_bitmap`] turns those into
//! readable camel-case names.

use std::collections::{BTreeMap, HashMap};

/// Feature name to enabled flag.
pub type FeatureBitmap = BTreeMap<String, bool>;

/// Build a bitmap with every flag in `flags` enabled.
///
/// # Example
///
/// ```
/// use ble_role_provisioner::feature_bitmap;
///
/// let bitmap = feature_bitmap(["WI", "TH"]);
/// assert_eq!(bitmap.get("WI"), Some(&true));
/// assert_eq!(bitmap.len(), 2);
/// ```
pub fn feature_bitmap<I, S>(flags: I) -> FeatureBitmap
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    flags.into_iter().map(|flag| (flag.into(), true)).collect()
}

/// Rename the keys of `bitmap` through `names`.
///
/// Every key is replaced by its entry in `names` (or kept when there is none)
/// and camel-cased with a lowercase first letter. Values are unchanged.
///
/// # Example
///
/// ```
/// use ble_role_provisioner::{feature_bitmap, translate_bitmap};
/// use std::collections::HashMap;
///
/// let names = HashMap::from([("WI".to_string(), "Wi-Fi Network Interface".to_string())]);
/// let bitmap = translate_bitmap(&feature_bitmap(["WI", "XX"]), &names);
///
/// assert_eq!(bitmap.get("wiFiNetworkInterface"), Some(&true));
/// assert_eq!(bitmap.get("xx"), Some(&true));
/// ```
pub fn translate_bitmap(bitmap: &FeatureBitmap, names: &HashMap<String, String>) -> FeatureBitmap {
    bitmap
        .iter()
        .map(|(code, enabled)| {
            let name = names.get(code).map(String::as_str).unwrap_or(code);
            (camelize(name, false), *enabled)
        })
        .collect()
}

/// Convert `name` to camel case.
///
/// Words break at non-alphanumeric characters, at lowercase to uppercase
/// transitions, and at the end of an acronym (`HTTPServer` is `HTTP`,
/// `Server`). Digits stay with the word they follow.
pub fn camelize(name: &str, upper_first: bool) -> String {
    let mut out = String::with_capacity(name.len());

    for (index, word) in split_words(name).iter().enumerate() {
        let lower = word.to_lowercase();
        if index == 0 && !upper_first {
            out.push_str(&lower);
            continue;
        }

        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }

    out
}

fn split_words(name: &str) -> Vec<String> {
    let chars: Vec<char> = name.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }

        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let starts_word =
                prev.is_lowercase() || prev.is_numeric() || (prev.is_uppercase() && next_is_lower);
            if starts_word {
                words.push(std::mem::take(&mut current));
            }
        }

        current.push(c);
    }

    if !current.is_empty() {
        words.push(current);
    }

    words
}
