//! Hand-written CSV tokenizer.
//!
//! Handles double-quote escaping (`""` inside a quoted field), commas and
//! newlines inside quotes, and both `\n` and `\r\n` line endings. Blank
//! lines are skipped.

/// Split raw CSV content into rows of fields.
pub fn parse_csv(content: &str) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => {
                row.push(std::mem::take(&mut field));
            }
            '\r' => {
                // Swallow; the following \n ends the row.
            }
            '\n' => {
                row.push(std::mem::take(&mut field));
                if !(row.len() == 1 && row[0].trim().is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => field.push(c),
        }
    }

    // Trailing row without a final newline.
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        if !(row.len() == 1 && row[0].trim().is_empty()) {
            rows.push(row);
        }
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_rows() {
        let rows = parse_csv("a,b,c\nd,e,f\n");
        assert_eq!(rows, vec![vec!["a", "b", "c"], vec!["d", "e", "f"]]);
    }

    #[test]
    fn test_quoted_fields() {
        let rows = parse_csv("name,venue\n\"Smith, John\",\"The \"\"Blue\"\" Bar\"\n");
        assert_eq!(rows[1][0], "Smith, John");
        assert_eq!(rows[1][1], "The \"Blue\" Bar");
    }

    #[test]
    fn test_newline_inside_quotes() {
        let rows = parse_csv("notes\n\"line one\nline two\"\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "line one\nline two");
    }

    #[test]
    fn test_blank_lines_skipped() {
        let rows = parse_csv("a,b\n\n  \nc,d\n");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_crlf_and_missing_trailing_newline() {
        let rows = parse_csv("a,b\r\nc,d");
        assert_eq!(rows, vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[test]
    fn test_empty_fields_preserved() {
        let rows = parse_csv("a,,c\n");
        assert_eq!(rows, vec![vec!["a", "", "c"]]);
    }
}
