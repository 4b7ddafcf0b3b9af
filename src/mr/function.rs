//! Built-in map/reduce applications workers can run.

/// Word count: one record per word occurrence, reduced to a count per word.
pub mod wc {
    use regex::Regex;

    use crate::mr::worker::KeyValue;

    pub fn map(_input: &str, contents: &str) -> Vec<KeyValue> {
        let word = Regex::new(r"[A-Za-z]+").unwrap();
        word.find_iter(contents)
            .map(|m| KeyValue::new(m.as_str().to_owned(), "1".to_owned()))
            .collect()
    }

    pub fn reduce(_key: &str, values: &[String]) -> String {
        values.len().to_string()
    }
}
