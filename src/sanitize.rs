//! Output sanitisation for raw PTY bytes
//!
//! Turns the byte stream read from a PTY master into clean text: ANSI
//! escape sequences and control characters are stripped, line endings are
//! normalised, and carriage-return overwrites are collapsed. The function
//! is pure; the only state between calls is the returned residue, which
//! holds an incomplete trailing escape sequence, an incomplete trailing
//! UTF-8 sequence, or a lone `\r` whose meaning depends on the next byte.

/// An unterminated OSC sequence longer than this is dropped instead of
/// carried forward forever.
const MAX_RESIDUE_BYTES: usize = 8192;

/// Sanitise one chunk of PTY output.
///
/// `input` must be the previous call's residue followed by the newly read
/// bytes. Returns the cleaned text and the residue to prepend next time.
pub fn sanitize(input: &[u8]) -> (String, Vec<u8>) {
    let mut out = String::with_capacity(input.len());
    let mut residue: Vec<u8> = Vec::new();
    let mut i = 0;

    while i < input.len() {
        let b = input[i];
        if b == 0x1b {
            match scan_escape(&input[i..]) {
                Scan::Complete(len) => i += len,
                Scan::Stray => i += 1,
                Scan::Incomplete => {
                    residue.extend_from_slice(&input[i..]);
                    break;
                }
            }
        } else if b < 0x80 {
            // \r survives to the normalisation pass below; other control
            // bytes besides \n and \t are dropped here.
            if b == b'\n' || b == b'\t' || b == b'\r' || (0x20..0x7f).contains(&b) {
                out.push(b as char);
            }
            i += 1;
        } else {
            let need = utf8_len(b);
            if need == 0 {
                // Continuation byte without a lead, or an invalid lead.
                out.push(char::REPLACEMENT_CHARACTER);
                i += 1;
            } else if i + need > input.len() {
                residue.extend_from_slice(&input[i..]);
                break;
            } else {
                match std::str::from_utf8(&input[i..i + need]) {
                    Ok(s) => {
                        out.push_str(s);
                        i += need;
                    }
                    Err(_) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        i += 1;
                    }
                }
            }
        }
    }

    // A trailing \r cannot be resolved yet: the next chunk decides whether
    // it is half of a \r\n or the start of a line overwrite.
    while out.ends_with('\r') {
        out.pop();
        residue.insert(0, b'\r');
    }

    if residue.len() > MAX_RESIDUE_BYTES {
        residue.clear();
    }

    (normalize_line_endings(&out), residue)
}

enum Scan {
    /// A full escape sequence of the given byte length.
    Complete(usize),
    /// The chunk ends mid-sequence.
    Incomplete,
    /// ESC followed by nothing recognisable; drop the ESC alone.
    Stray,
}

/// Scan an escape sequence starting at `bytes[0] == ESC`.
fn scan_escape(bytes: &[u8]) -> Scan {
    if bytes.len() < 2 {
        return Scan::Incomplete;
    }
    match bytes[1] {
        // CSI: ESC [ , parameters 0x30-0x3F, intermediates 0x20-0x2F,
        // final byte 0x40-0x7E.
        b'[' => {
            let mut j = 2;
            while j < bytes.len() && (0x30..=0x3f).contains(&bytes[j]) {
                j += 1;
            }
            while j < bytes.len() && (0x20..=0x2f).contains(&bytes[j]) {
                j += 1;
            }
            if j >= bytes.len() {
                Scan::Incomplete
            } else if (0x40..=0x7e).contains(&bytes[j]) {
                Scan::Complete(j + 1)
            } else {
                // Malformed: drop the introducer and parameters, leave the
                // offending byte for the main loop.
                Scan::Complete(j)
            }
        }
        // OSC: ESC ] ... terminated by BEL or ESC \.
        b']' => {
            let mut j = 2;
            while j < bytes.len() {
                if bytes[j] == 0x07 {
                    return Scan::Complete(j + 1);
                }
                if bytes[j] == 0x1b {
                    return if j + 1 >= bytes.len() {
                        Scan::Incomplete
                    } else if bytes[j + 1] == b'\\' {
                        Scan::Complete(j + 2)
                    } else {
                        // A new escape begins; treat the OSC as ended.
                        Scan::Complete(j)
                    };
                }
                j += 1;
            }
            Scan::Incomplete
        }
        // Two-byte escapes (single shifts, index, etc). The CSI and OSC
        // introducers sit in this range but matched above.
        c if (0x40..=0x5f).contains(&c) => Scan::Complete(2),
        _ => Scan::Stray,
    }
}

/// Expected encoded length for a UTF-8 lead byte, or 0 if invalid.
fn utf8_len(lead: u8) -> usize {
    match lead {
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => 0,
    }
}

/// Collapse carriage returns: `\r\n` becomes `\n`, and within each
/// pre-newline run only the text after the last `\r` survives.
fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, piece) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let piece = piece.strip_suffix('\r').unwrap_or(piece);
        if let Some(last) = piece.rsplit('\r').next() {
            out.push_str(last);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(input: &[u8]) -> String {
        let (text, residue) = sanitize(input);
        assert!(residue.is_empty(), "unexpected residue: {residue:?}");
        text
    }

    #[test]
    fn test_plain_text_passthrough() {
        assert_eq!(clean(b"hello world\n"), "hello world\n");
    }

    #[test]
    fn test_csi_color_stripped() {
        assert_eq!(clean(b"\x1b[31mRED\x1b[0m\n"), "RED\n");
    }

    #[test]
    fn test_csi_cursor_movement_stripped() {
        assert_eq!(clean(b"\x1b[2J\x1b[10;5Htext"), "text");
    }

    #[test]
    fn test_csi_private_params_stripped() {
        // DEC private mode set/reset uses '?' parameters.
        assert_eq!(clean(b"\x1b[?25lbusy\x1b[?25h"), "busy");
    }

    #[test]
    fn test_osc_bel_terminated() {
        assert_eq!(clean(b"\x1b]0;window title\x07prompt$"), "prompt$");
    }

    #[test]
    fn test_osc_st_terminated() {
        assert_eq!(clean(b"\x1b]0;title\x1b\\after"), "after");
    }

    #[test]
    fn test_two_byte_escape_stripped() {
        // ESC M (reverse index) and ESC D (index).
        assert_eq!(clean(b"a\x1bMb"), "ab");
        assert_eq!(clean(b"a\x1bDb"), "ab");
    }

    #[test]
    fn test_stray_escape_dropped_alone() {
        // The follower is outside every recognised sequence, so only the
        // ESC itself is removed.
        assert_eq!(clean(b"a\x1b1b"), "a1b");
        assert_eq!(clean(b"a\x1b=b"), "a=b");
    }

    #[test]
    fn test_control_characters_stripped() {
        assert_eq!(clean(b"a\x00b\x08c\x7fd"), "abcd");
        assert_eq!(clean(b"keep\ttabs\nand newlines\n"), "keep\ttabs\nand newlines\n");
    }

    #[test]
    fn test_crlf_is_single_terminator() {
        assert_eq!(clean(b"one\r\ntwo\r\n"), "one\ntwo\n");
    }

    #[test]
    fn test_cr_overwrite() {
        assert_eq!(clean(b"Progress: 10%\rProgress: 100%\n"), "Progress: 100%\n");
    }

    #[test]
    fn test_cr_overwrite_multiple() {
        assert_eq!(clean(b"aaaa\rbb\rc\n"), "c\n");
    }

    #[test]
    fn test_trailing_cr_goes_to_residue() {
        let (text, residue) = sanitize(b"spinner\r");
        assert_eq!(text, "spinner");
        assert_eq!(residue, b"\r");
        // Followed by a newline the pair normalises away.
        let mut next = residue;
        next.extend_from_slice(b"\n");
        let (text, residue) = sanitize(&next);
        assert_eq!(text, "\n");
        assert!(residue.is_empty());
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let (text, residue) = sanitize(b"ok\x1b[3");
        assert_eq!(text, "ok");
        assert_eq!(residue, b"\x1b[3");
        let mut next = residue;
        next.extend_from_slice(b"1mred");
        let (text, residue) = sanitize(&next);
        assert_eq!(text, "red");
        assert!(residue.is_empty());
    }

    #[test]
    fn test_osc_split_across_chunks() {
        let (text, residue) = sanitize(b"\x1b]0;tit");
        assert_eq!(text, "");
        assert_eq!(residue, b"\x1b]0;tit");
        let mut next = residue;
        next.extend_from_slice(b"le\x07done");
        let (text, residue) = sanitize(&next);
        assert_eq!(text, "done");
        assert!(residue.is_empty());
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let bytes = "héllo".as_bytes();
        let (text, residue) = sanitize(&bytes[..2]);
        assert_eq!(text, "h");
        assert_eq!(residue, &bytes[1..2]);
        let mut next = residue;
        next.extend_from_slice(&bytes[2..]);
        let (text, residue) = sanitize(&next);
        assert_eq!(text, "éllo");
        assert!(residue.is_empty());
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        assert_eq!(clean(b"a\xffb"), "a\u{fffd}b");
        // Lead byte followed by a non-continuation byte.
        assert_eq!(clean(b"a\xe0Ab"), "a\u{fffd}Ab");
    }

    #[test]
    fn test_unterminated_osc_capped() {
        let mut input = vec![0x1b, b']'];
        input.extend(std::iter::repeat(b'x').take(MAX_RESIDUE_BYTES + 10));
        let (text, residue) = sanitize(&input);
        assert_eq!(text, "");
        assert!(residue.is_empty());
    }

    #[test]
    fn test_output_is_clean() {
        // Clause used by the read pump's contract: no control bytes other
        // than \n and \t, no ESC, no \r remain after sanitisation.
        let input: Vec<u8> = (0u8..=0x7f).collect();
        let (text, _) = sanitize(&input);
        for b in text.bytes() {
            assert!(
                b == b'\n' || b == b'\t' || (0x20..0x7f).contains(&b),
                "dirty byte {b:#04x} in output"
            );
        }
    }
}
