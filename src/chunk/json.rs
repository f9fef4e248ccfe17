//! Hand-written decoder for JSON result chunks.
//!
//! A chunk is an array of rows, each row an array whose cells are either `null` or a JSON
//! string. Anything else is rejected as a corrupt chunk.

use std::io::Read;

use crate::{Error, Result};

const BUFFER_SIZE: usize = 8 * 1024;
const REPLACEMENT: char = '\u{FFFD}';

pub(crate) type JsonRows = Vec<Vec<Option<String>>>;

/// Decodes a bracketed chunk. `row_hint` and `cell_hint` pre-size the output.
pub(crate) fn decode_chunk<R: Read>(reader: R, row_hint: usize, cell_hint: usize) -> Result<JsonRows> {
    ChunkJsonDecoder::new(reader, cell_hint).decode(row_hint)
}

fn corrupt(reason: impl Into<String>) -> Error {
    Error::CorruptChunk(reason.into())
}

struct ChunkJsonDecoder<R> {
    reader: R,
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
    eof: bool,
    cell_hint: usize,
}

impl<R: Read> ChunkJsonDecoder<R> {
    fn new(reader: R, cell_hint: usize) -> Self {
        Self {
            reader,
            buf: vec![0; BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            len: 0,
            eof: false,
            cell_hint,
        }
    }

    fn decode(mut self, row_hint: usize) -> Result<JsonRows> {
        let mut rows = Vec::with_capacity(row_hint);
        self.skip_whitespace()?;
        self.expect(b'[', "chunk must start with '['")?;
        self.skip_whitespace()?;
        if self.peek()? == Some(b']') {
            self.pos += 1;
            return self.finish(rows);
        }
        loop {
            rows.push(self.row()?);
            self.skip_whitespace()?;
            match self.next_byte()? {
                Some(b',') => continue,
                Some(b']') => break,
                Some(other) => {
                    return Err(corrupt(format!(
                        "unexpected '{}' after row {}",
                        other as char,
                        rows.len()
                    )));
                }
                None => return Err(corrupt("unexpected end of chunk")),
            }
        }
        self.finish(rows)
    }

    fn finish(mut self, rows: JsonRows) -> Result<JsonRows> {
        self.skip_whitespace()?;
        match self.peek()? {
            None => Ok(rows),
            Some(other) => Err(corrupt(format!(
                "trailing '{}' after chunk",
                other as char
            ))),
        }
    }

    fn row(&mut self) -> Result<Vec<Option<String>>> {
        self.skip_whitespace()?;
        self.expect(b'[', "row must start with '['")?;
        let mut cells = Vec::with_capacity(self.cell_hint);
        self.skip_whitespace()?;
        if self.peek()? == Some(b']') {
            self.pos += 1;
            return Ok(cells);
        }
        loop {
            self.skip_whitespace()?;
            cells.push(self.cell()?);
            self.skip_whitespace()?;
            match self.next_byte()? {
                Some(b',') => continue,
                Some(b']') => break,
                Some(other) => {
                    return Err(corrupt(format!(
                        "unexpected '{}' after cell {}",
                        other as char,
                        cells.len()
                    )));
                }
                None => return Err(corrupt("unexpected end of row")),
            }
        }
        self.cell_hint = self.cell_hint.max(cells.len());
        Ok(cells)
    }

    fn cell(&mut self) -> Result<Option<String>> {
        match self.peek()? {
            Some(b'n') => {
                for expected in b"null" {
                    if self.next_byte()? != Some(*expected) {
                        return Err(corrupt("invalid literal, expected null"));
                    }
                }
                Ok(None)
            }
            Some(b'"') => {
                self.pos += 1;
                self.string().map(Some)
            }
            Some(other) => Err(corrupt(format!(
                "expected a string or null, found '{}'",
                other as char
            ))),
            None => Err(corrupt("unexpected end of row")),
        }
    }

    fn string(&mut self) -> Result<String> {
        let mut out: Vec<u8> = Vec::new();
        loop {
            if !self.fill(1)? {
                return Err(corrupt("unterminated string"));
            }
            let available = &self.buf[self.pos..self.len];
            match available.iter().position(|b| *b == b'"' || *b == b'\\') {
                Some(stop) => {
                    out.extend_from_slice(&available[..stop]);
                    let special = available[stop];
                    self.pos += stop + 1;
                    if special == b'"' {
                        break;
                    }
                    self.escape(&mut out)?;
                }
                None => {
                    out.extend_from_slice(available);
                    self.pos = self.len;
                }
            }
        }
        String::from_utf8(out).map_err(|e| corrupt(format!("invalid utf-8 in string: {e}")))
    }

    fn escape(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let escaped = match self.next_byte()? {
            Some(b'b') => '\u{0008}',
            Some(b'f') => '\u{000C}',
            Some(b'n') => '\n',
            Some(b'r') => '\r',
            Some(b't') => '\t',
            Some(b'\\') => '\\',
            Some(b'/') => '/',
            Some(b'"') => '"',
            Some(b'\'') => '\'',
            Some(b'u') => return self.unicode_escape(out),
            Some(_) => REPLACEMENT,
            None => return Err(corrupt("unterminated escape")),
        };
        push_char(out, escaped);
        Ok(())
    }

    /// Decodes the code unit after `\u`, pairing a high surrogate with a following `\uXXXX`.
    ///
    /// A lone surrogate becomes U+FFFD; a non-surrogate escape after an unpaired high
    /// surrogate is kept.
    fn unicode_escape(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let Some(unit) = self.hex4()? else {
            push_char(out, REPLACEMENT);
            return Ok(());
        };
        match unit {
            0xD800..=0xDBFF => {
                if self.peek_at(0)? != Some(b'\\') || self.peek_at(1)? != Some(b'u') {
                    push_char(out, REPLACEMENT);
                    return Ok(());
                }
                self.pos += 2;
                match self.hex4()? {
                    Some(low @ 0xDC00..=0xDFFF) => {
                        let code = 0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00);
                        push_char(out, char::from_u32(code).unwrap_or(REPLACEMENT));
                    }
                    Some(other) => {
                        push_char(out, REPLACEMENT);
                        push_char(out, char::from_u32(other).unwrap_or(REPLACEMENT));
                    }
                    None => push_char(out, REPLACEMENT),
                }
            }
            0xDC00..=0xDFFF => push_char(out, REPLACEMENT),
            other => push_char(out, char::from_u32(other).unwrap_or(REPLACEMENT)),
        }
        Ok(())
    }

    /// Reads up to four hex digits; `None` if a non-hex byte comes first.
    fn hex4(&mut self) -> Result<Option<u32>> {
        let mut value = 0u32;
        for _ in 0..4 {
            let digit = match self.peek()? {
                Some(b) => (b as char).to_digit(16),
                None => None,
            };
            match digit {
                Some(d) => {
                    value = value * 16 + d;
                    self.pos += 1;
                }
                None => return Ok(None),
            }
        }
        Ok(Some(value))
    }

    fn expect(&mut self, expected: u8, reason: &str) -> Result<()> {
        match self.next_byte()? {
            Some(b) if b == expected => Ok(()),
            _ => Err(corrupt(reason)),
        }
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        while let Some(b) = self.peek()? {
            if !matches!(b, b' ' | b'\t' | b'\n' | b'\r') {
                break;
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        let b = self.peek()?;
        if b.is_some() {
            self.pos += 1;
        }
        Ok(b)
    }

    fn peek(&mut self) -> Result<Option<u8>> {
        self.peek_at(0)
    }

    fn peek_at(&mut self, offset: usize) -> Result<Option<u8>> {
        if self.fill(offset + 1)? {
            Ok(Some(self.buf[self.pos + offset]))
        } else {
            Ok(None)
        }
    }

    /// Ensures at least `need` unread bytes are buffered; `false` on end of input.
    fn fill(&mut self, need: usize) -> Result<bool> {
        if self.len - self.pos >= need {
            return Ok(true);
        }
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.len, 0);
            self.len -= self.pos;
            self.pos = 0;
        }
        while self.len < need && !self.eof {
            let read = self.reader.read(&mut self.buf[self.len..])?;
            if read == 0 {
                self.eof = true;
            }
            self.len += read;
        }
        Ok(self.len - self.pos >= need)
    }
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut encoded = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
}
