//! URL parsing: split a request target into its path and an ordered,
//! multi-value query map.
//!
//! The path is left exactly as received; decoding of path parameters happens
//! after matching, one parameter at a time, so an encoded `/` (`%2F`) can
//! never change which route matches.

use std::borrow::Cow;

/// Splits a raw request target at the first `?`.
///
/// ```
/// assert_eq!(fsrouter::url::split_target("/a?b=c"), ("/a", Some("b=c")));
/// assert_eq!(fsrouter::url::split_target("/a"), ("/a", None));
/// ```
pub fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// Percent-decodes one URL component, treating `+` as a space.
///
/// Malformed escapes or sequences that do not decode to UTF-8 leave the input
/// untouched.
pub fn decode_component(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['%', '+']) {
        return Cow::Borrowed(raw);
    }
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => Cow::Owned(decoded.into_owned()),
        Err(_) => Cow::Borrowed(raw),
    }
}

/// Percent-decodes one path segment. Unlike [`decode_component`], `+` is kept.
///
/// ```
/// use fsrouter::url::decode_path_segment;
///
/// assert_eq!(decode_path_segment("blue%20dream"), "blue dream");
/// assert_eq!(decode_path_segment("a+b"), "a+b");
/// ```
pub fn decode_path_segment(raw: &str) -> Cow<'_, str> {
    if !raw.contains('%') {
        return Cow::Borrowed(raw);
    }
    urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
}

/// Query parameters in first-seen key order, each key holding every value it
/// was given.
///
/// # Examples
///
/// ```
/// use fsrouter::url::parse_query;
///
/// let query = parse_query("tag=a&page=2&tag=b", false);
/// assert_eq!(query.get("page"), Some("2"));
/// assert_eq!(query.get_all("tag"), ["a", "b"]);
/// let keys: Vec<_> = query.keys().collect();
/// assert_eq!(keys, ["tag", "page"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMap {
    entries: Vec<(String, Vec<String>)>,
}

impl QueryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, keeping earlier values for the same key.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value.into()),
            None => self.entries.push((key, vec![value.into()])),
        }
    }

    /// Returns the first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// Returns every value for `key`, in order of appearance.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, values)| values.as_slice())
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses `key=value&key2=value2` into a [`QueryMap`].
///
/// Empty pairs are skipped; a pair without `=` yields an empty value. Keys and
/// values are decoded with [`decode_component`] when `decode` is set.
pub fn parse_query(query: &str, decode: bool) -> QueryMap {
    let mut map = QueryMap::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if decode {
            map.append(decode_component(key), decode_component(value));
        } else {
            map.append(key, value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undecoded_query_keeps_raw_text() {
        let query = parse_query("name=a%20b&x=1+2", false);
        assert_eq!(query.get("name"), Some("a%20b"));
        assert_eq!(query.get("x"), Some("1+2"));
    }

    #[test]
    fn decoding_applies_to_keys_and_values() {
        let query = parse_query("first%20name=J%C3%BCrgen", true);
        assert_eq!(query.get("first name"), Some("Jürgen"));
    }

    #[test]
    fn malformed_escape_is_left_alone() {
        assert_eq!(decode_component("100%zz"), "100%zz");
    }

    #[test]
    fn flags_and_empty_pairs() {
        let query = parse_query("debug&&a=1&", false);
        assert_eq!(query.get("debug"), Some(""));
        assert_eq!(query.len(), 2);
    }

    #[test]
    fn value_may_contain_equals() {
        let query = parse_query("expr=a=b", false);
        assert_eq!(query.get("expr"), Some("a=b"));
    }

    #[test]
    fn repeated_keys_keep_first_seen_order() {
        let query = parse_query("a=1&b=2&a=3", false);
        assert_eq!(query.keys().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(query.get_all("a"), ["1", "3"]);
        assert_eq!(query.get("a"), Some("1"));
    }

    #[test]
    fn target_without_query() {
        assert_eq!(split_target("/strains/"), ("/strains/", None));
        assert_eq!(split_target("/strains?"), ("/strains", Some("")));
    }
}
