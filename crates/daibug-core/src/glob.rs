use crate::error::CoreError;
use regex::Regex;
use url::Url;

/// Anchored, case-insensitive URL matcher compiled from a `*`/`**` glob.
///
/// Both wildcard forms match any run of characters (path separators
/// included); the distinction is kept in the translation so patterns read
/// the way their authors wrote them. Absolute URLs are reduced to
/// `pathname + search` before matching; anything that does not parse as a
/// URL is matched as-is.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    pattern: String,
    regex: Regex,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Result<Self, CoreError> {
        let regex = Regex::new(&translate(pattern))
            .map_err(|err| CoreError::InvalidFormat(format!("bad glob {pattern:?}: {err}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches_url(&self, url: &str) -> bool {
        self.regex.is_match(&reduce_url(url))
    }
}

/// Strip scheme and host, keeping `pathname + search`. Relative inputs
/// come back unchanged.
fn reduce_url(input: &str) -> String {
    match Url::parse(input) {
        Ok(url) if url.has_host() => match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        },
        _ => input.to_string(),
    }
}

fn translate(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push_str("(?i)^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                }
                out.push_str(".*");
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}
