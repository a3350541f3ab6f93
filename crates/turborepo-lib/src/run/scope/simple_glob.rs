/// Package-name matching for filters. Unlike path globs, package names only
/// support `*` wildcards, and a pattern without any wildcard is an exact
/// match.
#[derive(Debug)]
pub enum SimpleGlob {
    Exact(String),
    Pattern(regex::Regex),
}

impl SimpleGlob {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        if !pattern.contains('*') {
            return Ok(SimpleGlob::Exact(pattern.to_string()));
        }
        let regex_pattern = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Ok(SimpleGlob::Pattern(regex::Regex::new(&format!(
            "^{regex_pattern}$"
        ))?))
    }

    pub fn is_match(&self, name: &str) -> bool {
        match self {
            SimpleGlob::Exact(exact) => exact == name,
            SimpleGlob::Pattern(regex) => regex.is_match(name),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, SimpleGlob::Exact(_))
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("web", "web", true ; "exact match")]
    #[test_case("web", "webs", false ; "exact mismatch")]
    #[test_case("@scope/*", "@scope/ui", true ; "scoped glob")]
    #[test_case("@scope/*", "@other/ui", false ; "scoped glob mismatch")]
    #[test_case("*", "anything", true ; "bare star")]
    #[test_case("a*c", "abc", true ; "infix star")]
    #[test_case("a*c", "ab", false ; "infix star mismatch")]
    #[test_case("a.c", "abc", false ; "dot is literal")]
    fn test_simple_glob(pattern: &str, name: &str, expected: bool) {
        assert_eq!(SimpleGlob::new(pattern).unwrap().is_match(name), expected);
    }
}
