//! Search query parsing: `from:<nick>`, `in:<channel>` and free text.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Exact sender nick, compared case-insensitively.
    pub from: Option<String>,
    /// Conversation to search instead of the current one.
    pub channel: Option<String>,
    /// Lower-cased free text left after the filters were removed.
    pub text: String,
}

impl SearchQuery {
    pub fn parse(query: &str) -> Self {
        let mut parsed = SearchQuery::default();
        let mut words = Vec::new();
        for token in query.split_whitespace() {
            if let Some(nick) = strip_filter(token, "from:") {
                if !nick.is_empty() {
                    parsed.from = Some(nick.to_string());
                }
            } else if let Some(channel) = strip_filter(token, "in:") {
                if !channel.is_empty() {
                    parsed.channel = Some(channel.to_string());
                }
            } else {
                words.push(token);
            }
        }
        parsed.text = words.join(" ").to_lowercase();
        parsed
    }

    pub fn matches_sender(&self, nick: &str) -> bool {
        self.from
            .as_deref()
            .is_none_or(|from| from.eq_ignore_ascii_case(nick))
    }
}

fn strip_filter<'a>(token: &'a str, filter: &str) -> Option<&'a str> {
    let head = token.get(..filter.len())?;
    head.eq_ignore_ascii_case(filter).then(|| &token[filter.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_are_extracted() {
        let q = SearchQuery::parse("from:Alice  in:#dev Hello   World");
        assert_eq!(q.from.as_deref(), Some("Alice"));
        assert_eq!(q.channel.as_deref(), Some("#dev"));
        assert_eq!(q.text, "hello world");
        assert!(q.matches_sender("alice"));
        assert!(!q.matches_sender("alicia"));
    }

    #[test]
    fn filter_only_query_has_no_text() {
        let q = SearchQuery::parse("FROM:bob");
        assert_eq!(q.from.as_deref(), Some("bob"));
        assert!(q.text.is_empty());
    }

    #[test]
    fn non_ascii_tokens_do_not_panic() {
        let q = SearchQuery::parse("é日本 in:");
        assert_eq!(q.text, "é日本");
        assert_eq!(q.channel, None);
    }
}
