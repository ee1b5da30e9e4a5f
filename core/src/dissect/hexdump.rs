//! Hex rendering.

/// Renders the canonical 16-byte-per-line hex+ASCII view.
///
/// Offsets are 4-digit hex; a single extra space separates the first 8 hex
/// bytes from the last 8; printable bytes (0x20..=0x7E) render as themselves
/// in the ASCII column, everything else as `.`.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4);
    for (i, chunk) in data.chunks(16).enumerate() {
        let mut hex = String::with_capacity(49);
        for (j, byte) in chunk.iter().enumerate() {
            if j == 8 {
                hex.push(' ');
            }
            if j > 0 {
                hex.push(' ');
            }
            hex.push_str(&format!("{:02x}", byte));
        }
        // pad short lines so the ASCII column lines up
        let width = 16 * 3; // "xx " per byte plus the mid-line gap
        while hex.len() < width {
            hex.push(' ');
        }

        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if (0x20..=0x7e).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();

        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!("{:04x}  {} |{}|", i * 16, hex, ascii));
    }
    out
}

/// Concatenated lowercase hex of the whole frame.
pub fn raw_hex(data: &[u8]) -> String {
    hex::encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_line_layout() {
        let data: Vec<u8> = (0x41..0x51).collect(); // 'A'..'P'
        let dump = hex_dump(&data);
        assert!(dump.starts_with("0000  "));
        // extra space between byte 8 and byte 9
        assert!(dump.contains("48  49"), "{}", dump);
        assert!(dump.ends_with("|ABCDEFGHIJKLMNOP|"), "{}", dump);
    }

    #[test]
    fn non_printable_as_dots() {
        let dump = hex_dump(&[0x00, 0x1f, 0x20, 0x7e, 0x7f]);
        assert!(dump.ends_with("|.. ~.|"), "{}", dump);
    }

    #[test]
    fn second_line_offset() {
        let data = vec![0u8; 20];
        let dump = hex_dump(&data);
        let mut lines = dump.lines();
        assert!(lines.next().unwrap().starts_with("0000"));
        assert!(lines.next().unwrap().starts_with("0010"));
    }

    #[test]
    fn raw_hex_lowercase() {
        assert_eq!(raw_hex(&[0xDE, 0xAD, 0xBE, 0xEF]), "deadbeef");
    }
}
