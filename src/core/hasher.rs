//! Canonical field hashing.
//!
//! Fields are serialized as `key:value` records and digested with SHA-256.
//! The encoding is fixed so that independent implementations produce the
//! same digest: strings are double-quoted with `\` and `"` escaped, booleans
//! are `true`/`false`, out-of-range unsigned 32-bit values become `0`, and
//! unordered string collections are sorted and written as `["a","b",]`.
//! Records are separated by `,`.

use sha2::{Digest, Sha256};

/// A single named value to be hashed
#[derive(Debug, Clone, Copy)]
pub enum Field<'a> {
    Str(&'a str, &'a str),
    Bool(&'a str, bool),
    Uint32(&'a str, u64),
    /// An unordered collection; iteration order never reaches the digest
    StrSet(&'a str, &'a [String]),
}

const RECORD_SEPARATOR: char = ',';

fn write_quoted(value: &str, out: &mut String) {
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

/// Append the canonical encoding of `field` to `out`
pub fn write_field(field: &Field<'_>, out: &mut String) {
    match field {
        Field::Str(key, value) => {
            out.push_str(key);
            out.push(':');
            write_quoted(value, out);
        }
        Field::Bool(key, value) => {
            out.push_str(key);
            out.push(':');
            out.push_str(if *value { "true" } else { "false" });
        }
        Field::Uint32(key, value) => {
            let value = if *value > u64::from(u32::MAX) { 0 } else { *value };
            out.push_str(key);
            out.push(':');
            out.push_str(&value.to_string());
        }
        Field::StrSet(key, values) => {
            let mut sorted: Vec<&String> = values.iter().collect();
            sorted.sort();
            out.push_str(key);
            out.push_str(":[");
            for value in sorted {
                write_quoted(value, out);
                out.push(',');
            }
            out.push(']');
        }
    }
}

/// Canonical text of a list of fields
pub fn canonical(fields: &[Field<'_>]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(RECORD_SEPARATOR);
        }
        write_field(field, &mut out);
    }
    out
}

/// Lowercase hex SHA-256 of the canonical encoding
pub fn hash(fields: &[Field<'_>]) -> String {
    let digest = Sha256::digest(canonical(fields).as_bytes());
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_encoding() {
        let allow = vec!["b".to_string(), "a".to_string()];
        let text = canonical(&[
            Field::Str("name", "say \"hi\""),
            Field::Bool("on", true),
            Field::Uint32("max", 10),
            Field::StrSet("allow", &allow),
        ]);
        assert_eq!(text, r#"name:"say \"hi\"",on:true,max:10,allow:["a","b",]"#);
    }

    #[test]
    fn test_uint32_overflow_clamps_to_zero() {
        assert_eq!(canonical(&[Field::Uint32("n", u64::from(u32::MAX) + 1)]), "n:0");
        assert_eq!(canonical(&[Field::Uint32("n", u64::from(u32::MAX))]), "n:4294967295");
    }

    #[test]
    fn test_set_order_does_not_leak() {
        let one = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let two = vec!["z".to_string(), "x".to_string(), "y".to_string()];
        assert_eq!(hash(&[Field::StrSet("s", &one)]), hash(&[Field::StrSet("s", &two)]));
    }

    #[test]
    fn test_known_digest() {
        // sha256("") is a fixed, well-known value
        assert_eq!(
            hash(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(hash(&[Field::Str("a", "b")]).len(), 64);
    }
}
