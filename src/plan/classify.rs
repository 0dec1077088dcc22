pub(super) fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

pub(super) fn is_alnum(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

pub(super) fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// A `?` placeholder may only follow whitespace, an alphanumeric byte, `(`,
/// `]` or `,`. Anything else (quotes, operators) means the byte belongs to a
/// literal or operator and must be left alone.
pub(super) fn numbered_prev_ok(bytes: &[u8], pos: usize) -> bool {
    if pos == 0 {
        return true;
    }
    let prev = bytes[pos - 1];
    is_space(prev) || is_alnum(prev) || matches!(prev, b'(' | b']' | b',')
}

/// A `?` placeholder may only be followed by whitespace, an alphanumeric
/// byte, `:` (parameter typecasts like `?::int`), `)`, `]` or `,`.
pub(super) fn numbered_next_ok(bytes: &[u8], pos: usize) -> bool {
    if pos + 1 >= bytes.len() {
        return true;
    }
    let next = bytes[pos + 1];
    is_space(next) || is_alnum(next) || matches!(next, b':' | b')' | b']' | b',')
}

/// A `:name` placeholder may only follow whitespace, `(`, `[` or `,`; this
/// keeps `::int` casts and array slices intact.
pub(super) fn named_prev_ok(bytes: &[u8], pos: usize) -> bool {
    if pos == 0 {
        return true;
    }
    let prev = bytes[pos - 1];
    is_space(prev) || matches!(prev, b'(' | b'[' | b',')
}

/// Length of the name following a `:` at `pos`, 0 when the colon does not
/// start a placeholder.
pub(super) fn named_placeholder_length(bytes: &[u8], pos: usize) -> usize {
    if !named_prev_ok(bytes, pos) {
        return 0;
    }

    let mut end = pos + 1;
    while end < bytes.len() && is_name_char(bytes[end]) {
        end += 1;
    }

    end - pos - 1
}
