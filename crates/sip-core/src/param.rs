use std::fmt;

/// Ordered `;name=value` parameter list shared by URIs, name-addrs and Via.
///
/// Names compare case-insensitively; values keep their original spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn new() -> Self {
        Params(Vec::new())
    }

    /// Parse the text that follows the first `;` (e.g. `lr;transport=udp`).
    pub fn parse(s: &str) -> Self {
        let mut params = Params::new();
        for raw in s.split(';') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match raw.split_once('=') {
                Some((name, value)) => params
                    .0
                    .push((name.trim().to_string(), Some(value.trim().to_string()))),
                None => params.0.push((raw.to_string(), None)),
            }
        }
        params
    }

    /// `Some(None)` for a flag parameter, `Some(Some(v))` for a valued one.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(str::to_string);
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Split a header value on top-level commas, ignoring commas inside
/// quoted strings and `<...>` URIs.
pub fn split_comma_list(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                escaped = true;
                current.push(c);
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(c);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(c);
            }
            ',' if !in_quotes && !in_angle => {
                let item = current.trim();
                if !item.is_empty() {
                    out.push(item.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let item = current.trim();
    if !item.is_empty() {
        out.push(item.to_string());
    }
    out
}

/// Remove one level of surrounding double quotes, if present.
pub fn unquote(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_flags_and_values() {
        let p = Params::parse("lr;transport=UDP;maddr=10.0.0.1");
        assert_eq!(p.get("lr"), Some(None));
        assert_eq!(p.value("Transport"), Some("UDP"));
        assert!(!p.contains("ttl"));
        assert_eq!(p.to_string(), ";lr;transport=UDP;maddr=10.0.0.1");
    }

    #[test]
    fn test_split_comma_list_respects_quotes_and_brackets() {
        let items = split_comma_list(r#""Doe, John" <sip:a@b;x=1,2>, <sip:c@d>"#);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], "<sip:c@d>");
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"example.com\""), "example.com");
        assert_eq!(unquote("example.com"), "example.com");
    }
}
