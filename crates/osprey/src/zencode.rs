//! Mangling of source identifiers into generated-C identifiers.
//!
//! Every generated global, local, register, and type name goes through
//! [`zencode`]: a `z` prefix, alphanumerics preserved, `z` doubled, and every
//! other byte escaped as `z` plus two uppercase hex digits. The scheme is
//! injective, so distinct source names can never collide with each other or
//! with C keywords (no keyword starts with `z`).

pub fn zencode(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    out.push('z');
    for byte in name.bytes() {
        match byte {
            b'z' => out.push_str("zz"),
            b'a'..=b'y' | b'A'..=b'Z' | b'0'..=b'9' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("z{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_get_a_prefix() {
        assert_eq!(zencode("execute"), "zexecute");
        assert_eq!(zencode("PC"), "zPC");
    }

    #[test]
    fn z_is_doubled() {
        assert_eq!(zencode("zero_reg"), "zzzero_reg");
    }

    #[test]
    fn punctuation_is_escaped() {
        assert_eq!(zencode("add'"), "zaddz27");
        assert_eq!(zencode("my.field"), "zmyz2Efield");
    }

    #[test]
    fn encoding_is_injective_on_lookalikes() {
        assert_ne!(zencode("a_b"), zencode("a.b"));
        assert_ne!(zencode("z"), zencode("zz"));
    }
}
