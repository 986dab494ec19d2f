//! Field and method descriptor utilities.
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

// The return type is everything after the argument list; `)` cannot
// occur outside it, and inner-class names legally contain `$`
// (`Ljava/util/Map$Entry;`), so the capture must not exclude anything.
fn method_descriptor_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\(([^\)]*)\)(.+)$").expect("descriptor pattern"))
}

/// Splits a method descriptor into its argument string and return string.
pub(crate) fn split_method_descriptor(descriptor: &str) -> Result<(&str, &str)> {
    let caps = method_descriptor_pattern()
        .captures(descriptor)
        .ok_or_else(|| Error::malformed(format!("invalid method descriptor {descriptor}")))?;
    let args = caps.get(1).map_or("", |m| m.as_str());
    let ret = caps.get(2).map_or("", |m| m.as_str());
    Ok((args, ret))
}

/// Iterates the individual argument descriptors of an argument string.
pub(crate) fn arguments(mut args: &str) -> impl Iterator<Item = Result<&str>> {
    std::iter::from_fn(move || {
        if args.is_empty() {
            return None;
        }
        match descriptor_length(args) {
            Ok(len) => {
                let (head, rest) = args.split_at(len);
                args = rest;
                Some(Ok(head))
            }
            Err(err) => {
                args = "";
                Some(Err(err))
            }
        }
    })
}

/// Length in characters of the first descriptor in `s`.
fn descriptor_length(s: &str) -> Result<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i] == b'[' {
        i += 1;
    }
    match bytes.get(i) {
        Some(b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b'V') => Ok(i + 1),
        Some(b'L') => {
            let end = s[i..]
                .find(';')
                .ok_or_else(|| Error::malformed(format!("unterminated descriptor {s}")))?;
            Ok(i + end + 1)
        }
        _ => Err(Error::malformed(format!("invalid descriptor {s}"))),
    }
}

/// Number of stack or local slots a single descriptor occupies.
pub(crate) fn descriptor_size(descriptor: &str) -> u32 {
    match descriptor {
        "J" | "D" => 2,
        "V" => 0,
        _ => 1,
    }
}

/// Total argument slots and return slots of a method descriptor.
pub(crate) fn method_descriptor_sizes(descriptor: &str) -> Result<(u32, u32)> {
    let (args, ret) = split_method_descriptor(descriptor)?;
    let mut arg_slots = 0;
    for arg in arguments(args) {
        arg_slots += descriptor_size(arg?);
    }
    Ok((arg_slots, descriptor_size(ret)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_descriptor() {
        let (args, ret) = split_method_descriptor("(I[JLjava/lang/String;)V").unwrap();
        assert_eq!(args, "I[JLjava/lang/String;");
        assert_eq!(ret, "V");
    }

    #[test]
    fn splits_inner_class_return_types() {
        assert_eq!(
            split_method_descriptor("()Ljava/util/Map$Entry;").unwrap(),
            ("", "Ljava/util/Map$Entry;")
        );
        assert_eq!(
            split_method_descriptor("(Ljava/util/Map$Entry;)Ljava/util/AbstractMap$SimpleEntry;")
                .unwrap(),
            (
                "Ljava/util/Map$Entry;",
                "Ljava/util/AbstractMap$SimpleEntry;"
            )
        );
    }

    #[test]
    fn iterates_arguments() {
        let parts: Vec<_> = arguments("I[JLjava/lang/String;[[D")
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(parts, vec!["I", "[J", "Ljava/lang/String;", "[[D"]);
    }

    #[test]
    fn computes_slot_sizes() {
        assert_eq!(method_descriptor_sizes("(IJ)V").unwrap(), (3, 0));
        assert_eq!(method_descriptor_sizes("()D").unwrap(), (0, 2));
        assert_eq!(
            method_descriptor_sizes("([[ILjava/lang/Object;)J").unwrap(),
            (2, 2)
        );
        assert_eq!(
            method_descriptor_sizes("(J)Ljava/util/Map$Entry;").unwrap(),
            (2, 1)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(split_method_descriptor("()").is_err());
        assert!(split_method_descriptor("IV").is_err());
        assert!(method_descriptor_sizes("(Q)V").is_err());
    }
}
