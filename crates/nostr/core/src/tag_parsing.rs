//! Positional access to `["name", value, ...]` tag arrays.

pub(crate) fn tag_field(tag: &[String], index: usize) -> Option<&str> {
    tag.get(index).map(String::as_str)
}

/// Tags whose first element is `name`, in order.
pub(crate) fn tags_named<'a>(
    tags: &'a [Vec<String>],
    name: &'a str,
) -> impl Iterator<Item = &'a [String]> + 'a {
    tags.iter()
        .map(Vec::as_slice)
        .filter(move |tag| tag_field(tag, 0) == Some(name))
}

/// First values of every `name` tag; tags without a value are skipped.
pub(crate) fn collect_tag_values(tags: &[Vec<String>], name: &str) -> Vec<String> {
    tags_named(tags, name)
        .filter_map(|tag| tag_field(tag, 1).map(str::to_owned))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|tag| tag.iter().map(|field| (*field).to_string()).collect())
            .collect()
    }

    #[test]
    fn selects_tags_by_name() {
        let tags = tags(&[
            &["r", "wss://a"],
            &["p", "abc"],
            &[],
            &["r"],
            &["r", "wss://b", "read"],
        ]);

        assert_eq!(tags_named(&tags, "r").count(), 3);
        assert_eq!(collect_tag_values(&tags, "r"), vec!["wss://a", "wss://b"]);
        assert_eq!(collect_tag_values(&tags, "e"), Vec::<String>::new());
        assert_eq!(tag_field(&tags[4], 2), Some("read"));
        assert_eq!(tag_field(&tags[2], 0), None);
    }
}
