//! A1-style cell references.

/// Rows a worksheet can hold.
pub const MAX_ROWS: u32 = 1_048_576;
/// Columns a worksheet can hold (`A` through `XFD`).
pub const MAX_COLUMNS: u32 = 16_384;

/// Builds the reference for a zero-based column and one-based row, e.g.
/// `(0, 1)` → `A1`, `(26, 3)` → `AA3`.
pub fn to_reference(column: u32, row: u32) -> String {
    let mut reference = column_name(column);
    reference.push_str(&row.to_string());
    reference
}

/// Bijective base-26 column letters for a zero-based column index.
pub fn column_name(column: u32) -> String {
    let mut dividend = u64::from(column) + 1;
    let mut letters = Vec::new();
    while dividend > 0 {
        let modulo = (dividend - 1) % 26;
        letters.push(b'A' + modulo as u8);
        dividend = (dividend - modulo) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Splits a reference into a zero-based column and a one-based row. Returns
/// `None` for anything that is not letters followed by a positive row number,
/// or that lies outside the worksheet grid.
pub fn parse_reference(reference: &str) -> Option<(u32, u32)> {
    let split = reference
        .find(|c: char| c.is_ascii_digit())
        .filter(|split| *split > 0)?;
    let (letters, digits) = reference.split_at(split);

    let mut column: u64 = 0;
    for letter in letters.chars() {
        if !letter.is_ascii_alphabetic() {
            return None;
        }
        let digit = u64::from(letter.to_ascii_uppercase() as u8 - b'A') + 1;
        column = column.checked_mul(26)?.checked_add(digit)?;
    }

    let row: u32 = digits
        .parse()
        .ok()
        .filter(|row| (1..=MAX_ROWS).contains(row))?;
    let column = u32::try_from(column - 1)
        .ok()
        .filter(|column| *column < MAX_COLUMNS)?;
    Some((column, row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_over_at_letter_boundaries() {
        assert_eq!(to_reference(0, 1), "A1");
        assert_eq!(to_reference(25, 1), "Z1");
        assert_eq!(to_reference(26, 1), "AA1");
        assert_eq!(to_reference(701, 5), "ZZ5");
        assert_eq!(to_reference(702, 5), "AAA5");
    }

    #[test]
    fn parsing_is_symmetric() {
        for column in [0, 1, 25, 26, 27, 51, 52, 701, 702, 16_383] {
            for row in [1, 9, 10, 1_048_576] {
                assert_eq!(parse_reference(&to_reference(column, row)), Some((column, row)));
            }
        }
    }

    #[test]
    fn rejects_malformed_references() {
        assert_eq!(parse_reference(""), None);
        assert_eq!(parse_reference("12"), None);
        assert_eq!(parse_reference("A"), None);
        assert_eq!(parse_reference("A0"), None);
        assert_eq!(parse_reference("A1B"), None);
        assert_eq!(parse_reference("$A$1"), None);
    }

    #[test]
    fn rejects_references_outside_the_grid() {
        assert_eq!(parse_reference("XFD1048576"), Some((MAX_COLUMNS - 1, MAX_ROWS)));
        assert_eq!(parse_reference("XFE1"), None);
        assert_eq!(parse_reference("ZZZZZZ1"), None);
        assert_eq!(parse_reference("A1048577"), None);
        assert_eq!(parse_reference("B4294967295"), None);
    }
}
