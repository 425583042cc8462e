/// Iterator over the space-separated fields of one message.
///
/// A field starting with a double quote runs through its closing quote, so
/// quoted values may contain spaces. A quote preceded by a backslash does not
/// close the field. Consecutive spaces produce empty fields. Leading and
/// trailing line breaks around the message are ignored.
#[derive(Debug, Clone)]
pub struct Fields<'a> {
    rest: Option<&'a [u8]>,
}

impl<'a> Fields<'a> {
    pub fn new(message: &'a [u8]) -> Self {
        Self {
            rest: Some(trim_line_breaks(message)),
        }
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let data = self.rest?;

        let scan_from = if data.first() == Some(&b'"') {
            closing_quote(data).map_or(0, |i| i + 1)
        } else {
            0
        };

        match data[scan_from..].iter().position(|b| *b == b' ') {
            Some(p) => {
                let end = scan_from + p;
                self.rest = Some(&data[end + 1..]);
                Some(&data[..end])
            }
            None => {
                self.rest = None;
                Some(data)
            }
        }
    }
}

/// Index of the quote closing the one at `data[0]`.
fn closing_quote(data: &[u8]) -> Option<usize> {
    (1..data.len()).find(|&i| data[i] == b'"' && data[i - 1] != b'\\')
}

fn trim_line_breaks(mut data: &[u8]) -> &[u8] {
    while let [b'\r' | b'\n', rest @ ..] = data {
        data = rest;
    }
    while let [rest @ .., b'\r' | b'\n'] = data {
        data = rest;
    }
    data
}
