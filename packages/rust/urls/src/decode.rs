//! Partial percent-decoding.

/// Decode percent-escapes from the start of `input` until the output holds
/// at least `target_length` bytes, then copy the rest verbatim.
///
/// Decoding the whole path before slicing would also decode escapes that
/// belong to the untouched remainder (`/%2561` would become `/a`), so only
/// the prefix is decoded. A `%` not followed by two hex digits is copied
/// as-is. Decoding stops once fewer than three bytes remain.
pub fn urldecode_n(input: &str, target_length: usize) -> String {
    let bytes = input.as_bytes();
    let mut result: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut at = 0;

    while at + 3 <= bytes.len() {
        let percent = bytes[at..]
            .iter()
            .position(|&b| b == b'%')
            .map_or(bytes.len(), |offset| at + offset);
        result.extend_from_slice(&bytes[at..percent]);
        at = percent;

        if result.len() >= target_length || at >= bytes.len() {
            break;
        }

        at += 1;
        match (bytes.get(at), bytes.get(at + 1)) {
            (Some(&hi), Some(&lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                result.push((hex_value(hi) << 4) | hex_value(lo));
                at += 2;
            }
            _ => result.push(b'%'),
        }
    }

    if at < bytes.len() {
        result.extend_from_slice(&bytes[at..]);
    }
    String::from_utf8_lossy(&result).into_owned()
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

/// Fully percent-decode `input`; invalid escapes are kept.
pub fn urldecode(input: &str) -> String {
    urldecode_n(input, usize::MAX)
}
