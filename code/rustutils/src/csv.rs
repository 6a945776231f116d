/// Non-allocating CSV tokenizer.
///
/// The dialect:
///
///  - UTF-8 / ASCII input, one record per line, lines end with 0x0A (optional at EOF)
///  - blank lines are empty records, there is no header line
///  - fields are separated by 0x2C and their number can vary between lines
///  - fields may be double-quoted, in which case they may contain commas and doubled double-quotes;
///    newlines and EOF are not allowed inside a quoted field
///  - a line is at most MAXLINE bytes
///
/// `get()` returns `Token::Field`, `Token::EOL`, or `Token::EOF`.  A field is a span [start,lim) in
/// the tokenizer's buffer plus `eqloc`, the index of the byte following the first '=' in the field
/// if there is one, otherwise `CSV_EQ_SENTINEL`.  Spans are valid until the next `get()`.  Tagged
/// fields ("tag=value") are matched in place with `match_tag()`, so the hot path allocates nothing.
use anyhow::{bail, Result};
use std::io;

#[derive(Debug, PartialEq, Eq)]
pub enum CsvToken {
    Field { start: usize, lim: usize, eqloc: usize },
    EOL,
    EOF,
}

pub const CSV_EQ_SENTINEL: usize = usize::MAX;

const BUFSIZ: usize = 65536;
const MAXLINE: usize = 8192;

pub struct CsvTokenizer<R: io::Read> {
    ix: usize,
    lim: usize,
    start_of_line: bool,
    reader: R,
    buf: Box<[u8]>,
    #[cfg(test)]
    fail_refill: bool,
}

impl<R: io::Read> CsvTokenizer<R> {
    pub fn new(reader: R) -> CsvTokenizer<R> {
        CsvTokenizer {
            ix: 0,
            lim: 0,
            start_of_line: true,
            reader,
            buf: vec![0u8; BUFSIZ].into_boxed_slice(),
            #[cfg(test)]
            fail_refill: false,
        }
    }

    pub fn get_str(&self, start: usize, lim: usize) -> &str {
        // Invalid UTF-8 makes the field read as empty; the record parsers then reject the value.
        std::str::from_utf8(&self.buf[start..lim]).unwrap_or("")
    }

    pub fn get_bytes(&self, start: usize, lim: usize) -> &[u8] {
        &self.buf[start..lim]
    }

    pub fn buf_at(&self, loc: usize) -> u8 {
        self.buf[loc]
    }

    /// Next token, or an error for malformed input or I/O failure.  An I/O failure is an
    /// `io::Error` inside the anyhow error, syntax errors are not, so callers can tell them apart.
    pub fn get(&mut self) -> Result<CsvToken> {
        self.maybe_refill()?;

        // There is always a '\n' sentinel at self.buf[self.lim].

        if self.buf[self.ix] == b'\n' {
            if self.ix == self.lim {
                return Ok(CsvToken::EOF);
            }
            self.ix += 1;
            self.start_of_line = true;
            return Ok(CsvToken::EOL);
        }

        if !self.start_of_line {
            // Separator left over from the previous field.
            self.ix += 1;
        }
        self.start_of_line = false;

        let mut eqloc = CSV_EQ_SENTINEL;
        match self.buf[self.ix] {
            b'\n' | b',' => Ok(CsvToken::Field {
                start: self.ix,
                lim: self.ix,
                eqloc,
            }),
            b'"' => {
                // Doubled quotes are collapsed in place, so the field may shrink.
                self.ix += 1;
                let start = self.ix;
                let mut dest = start;
                loop {
                    match self.buf[self.ix] {
                        b'\n' => {
                            self.skip_line();
                            bail!("Unexpected end of line or end of file in quoted field")
                        }
                        b'"' => {
                            self.ix += 1;
                            if self.buf[self.ix] != b'"' {
                                if self.buf[self.ix] != b',' && self.buf[self.ix] != b'\n' {
                                    self.skip_line();
                                    bail!("Expected comma or newline after quoted field")
                                }
                                return Ok(CsvToken::Field {
                                    start,
                                    lim: dest,
                                    eqloc,
                                });
                            }
                        }
                        b'=' if eqloc == CSV_EQ_SENTINEL => {
                            eqloc = dest + 1;
                        }
                        _ => {}
                    }
                    self.buf[dest] = self.buf[self.ix];
                    dest += 1;
                    self.ix += 1;
                }
            }
            _ => {
                let start = self.ix;
                loop {
                    match self.buf[self.ix] {
                        b'\n' | b',' => {
                            return Ok(CsvToken::Field {
                                start,
                                lim: self.ix,
                                eqloc,
                            })
                        }
                        b'=' if eqloc == CSV_EQ_SENTINEL => {
                            eqloc = self.ix + 1;
                        }
                        b'"' => {
                            self.skip_line();
                            bail!("Unexpected '\"' in unquoted field")
                        }
                        _ => {}
                    }
                    self.ix += 1;
                }
            }
        }
    }

    /// True iff the field at `start` with non-sentinel `eqloc` is "<tag>=...".
    pub fn match_tag(&self, tag: &[u8], start: usize, eqloc: usize) -> bool {
        eqloc != CSV_EQ_SENTINEL
            && start + tag.len() + 1 == eqloc
            && &self.buf[start..start + tag.len()] == tag
    }

    // After a syntax error, position at the newline so that the next get() returns EOL or EOF and
    // the caller can resynchronize on the next record.
    fn skip_line(&mut self) {
        while self.buf[self.ix] != b'\n' {
            self.ix += 1;
        }
    }

    fn maybe_refill(&mut self) -> Result<()> {
        while self.lim - self.ix < MAXLINE {
            if self.ix != 0 {
                let n = self.lim - self.ix;
                self.buf.copy_within(self.ix..self.lim + 1, 0);
                self.ix = 0;
                self.lim = n;
            }
            #[cfg(test)]
            if self.fail_refill {
                return Err(io::Error::new(io::ErrorKind::Other, "Test failure").into());
            }
            let nread = self.reader.read(&mut self.buf[self.lim..BUFSIZ - 1])?;
            self.lim += nread;
            self.buf[self.lim] = b'\n';
            if nread == 0 {
                break;
            }
        }
        Ok(())
    }
}

// Drain the tokenizer into a readable transcript: fields as "text" or "text@k" where k is the
// offset of eqloc from start, then "|" for EOL and "$" for EOF, "!" for an error.
#[cfg(test)]
fn transcript(text: &str) -> Vec<String> {
    let mut t = CsvTokenizer::new(text.as_bytes());
    let mut out = vec![];
    loop {
        match t.get() {
            Ok(CsvToken::Field { start, lim, eqloc }) => {
                let s = t.get_str(start, lim).to_string();
                if eqloc == CSV_EQ_SENTINEL {
                    out.push(s);
                } else {
                    out.push(format!("{s}@{}", eqloc - start));
                }
            }
            Ok(CsvToken::EOL) => out.push("|".to_string()),
            Ok(CsvToken::EOF) => {
                out.push("$".to_string());
                break;
            }
            Err(_) => out.push("!".to_string()),
        }
    }
    out
}

#[test]
fn test_fields_and_quotes() {
    let text = "a,b=1,cc=2,,e,\"f=1,2,3\",\"g,\"\"y\"\",z\",\n\nA,B";
    assert_eq!(
        transcript(text),
        vec![
            "a", "b=1@2", "cc=2@3", "", "e", "f=1,2,3@2", "g,\"y\",z", "", "|", "|", "A", "B", "$"
        ]
    );
    assert_eq!(transcript("a,"), vec!["a", "", "$"]);
}

#[test]
fn test_syntax_errors_resync() {
    // newline in quoted field, junk after quote, quote in unquoted field: each error drops the rest
    // of the line and parsing continues on the next.
    assert_eq!(transcript("a,\"hi\nho"), vec!["a", "!", "|", "ho", "$"]);
    assert_eq!(transcript("a,\"hi\"x,y\nz"), vec!["a", "!", "|", "z", "$"]);
    assert_eq!(transcript("a,hi\"x,y\nz"), vec!["a", "!", "|", "z", "$"]);
}

#[test]
fn test_match_tag() {
    let mut t = CsvTokenizer::new("cpu%=12,cputime_sec=3".as_bytes());
    if let CsvToken::Field { start, eqloc, .. } = t.get().unwrap() {
        assert!(t.match_tag(b"cpu%", start, eqloc));
        assert!(!t.match_tag(b"cpu", start, eqloc));
    } else {
        panic!("Expected field")
    }
    if let CsvToken::Field { start, eqloc, lim } = t.get().unwrap() {
        assert!(t.match_tag(b"cputime_sec", start, eqloc));
        assert_eq!(t.get_str(eqloc, lim), "3");
    } else {
        panic!("Expected field")
    }
}

// Lines of 27 bytes straddle the buffer boundary in various ways, exercising the refill logic.
#[test]
fn test_refill() {
    assert!(BUFSIZ % 27 != 0 && BUFSIZ % 27 != 1 && BUFSIZ % 27 != 26);
    let count = BUFSIZ * 3 / 27;
    let text = "abcdefghijklmnopqrstuvwxyz\n".repeat(count);
    let mut t = CsvTokenizer::new(text.as_bytes());
    let mut found = 0;
    loop {
        match t.get().unwrap() {
            CsvToken::Field { start, lim, .. } => {
                assert_eq!(t.get_str(start, lim), "abcdefghijklmnopqrstuvwxyz");
                found += 1;
            }
            CsvToken::EOL => {}
            CsvToken::EOF => break,
        }
    }
    assert_eq!(found, count);

    let mut t = CsvTokenizer::new(text.as_bytes());
    t.get().unwrap();
    t.fail_refill = true;
    let err = loop {
        match t.get() {
            Ok(CsvToken::EOF) => panic!("Should have failed"),
            Ok(_) => {}
            Err(e) => break e,
        }
    };
    assert!(err.downcast_ref::<io::Error>().is_some());
}
