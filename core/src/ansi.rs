//! ANSI escape sequence stripping.
//!
//! Pty output is peppered with escape codes for colors, cursor movement and
//! window titles. Classification and log capture operate on clean text, so
//! every chunk passes through here before line splitting.

/// Strip ANSI escape sequences from a byte slice, returning clean UTF-8 text.
///
/// Handles CSI (`ESC [ .. final`), OSC (`ESC ] .. BEL|ST`), simple two-byte
/// escapes, and the bare CSI byte 0x9B. Idempotent on already-clean text.
/// Non-UTF-8 bytes are replaced with the Unicode replacement character.
pub fn strip_ansi(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            0x1B => {
                i += 1;
                if i >= input.len() {
                    break;
                }
                match input[i] {
                    b'[' => i = skip_csi_body(input, i + 1),
                    b']' => i = skip_osc_body(input, i + 1),
                    // Two-byte escape such as ESC M or ESC 7.
                    0x20..=0x7E => i += 1,
                    _ => i += 1,
                }
            }
            0x9B => i = skip_csi_body(input, i + 1),
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Advance past CSI parameter/intermediate bytes and the final byte.
fn skip_csi_body(input: &[u8], mut i: usize) -> usize {
    while i < input.len() && (0x20..=0x3F).contains(&input[i]) {
        i += 1;
    }
    if i < input.len() && (0x40..=0x7E).contains(&input[i]) {
        i += 1;
    }
    i
}

/// Advance past an OSC body terminated by BEL or `ESC \`.
fn skip_osc_body(input: &[u8], mut i: usize) -> usize {
    while i < input.len() {
        if input[i] == 0x07 {
            return i + 1;
        }
        if input[i] == 0x1B && i + 1 < input.len() && input[i + 1] == b'\\' {
            return i + 2;
        }
        i += 1;
    }
    i
}
