//! Lazy, resumable record readers.
//!
//! Offsets are stable positions usable for checkpointing: byte offsets for
//! JSONL and text input, element indices for JSON arrays.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use facestat_core::{Record, RecordParseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const READ_BUFFER_BYTES: usize = 256 * 1024;
/// Bytes inspected when sniffing the layout of a `.json` file.
const SNIFF_BYTES: u64 = 4096;
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("cannot open input {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("input read failed: {0}")]
    Read(#[from] io::Error),
    #[error("input format error: {0}")]
    Format(String),
}

/// Layout of the input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// A single top-level JSON array of objects.
    JsonArray,
    /// One JSON object per line.
    JsonLines,
    /// One object per line, tolerating array punctuation left by dumps.
    Text,
}

impl InputFormat {
    /// Guess the layout from the file extension, sniffing `.json` content.
    pub fn detect(path: &Path) -> Result<Self, ReaderError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("jsonl") | Some("ndjson") => return Ok(Self::JsonLines),
            Some("txt") => return Ok(Self::Text),
            _ => {}
        }

        let file = File::open(path).map_err(|source| ReaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut head = Vec::new();
        file.take(SNIFF_BYTES).read_to_end(&mut head)?;
        let body = head.strip_prefix(UTF8_BOM).unwrap_or(&head);
        match body.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'[') => Ok(Self::JsonArray),
            _ => Ok(Self::JsonLines),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JsonArray => "json_array",
            Self::JsonLines => "json_lines",
            Self::Text => "text",
        }
    }

    fn is_line_based(&self) -> bool {
        !matches!(self, Self::JsonArray)
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "array" | "json_array" => Ok(Self::JsonArray),
            "jsonl" | "ndjson" | "json_lines" => Ok(Self::JsonLines),
            "text" | "txt" => Ok(Self::Text),
            other => Err(format!("unknown input format: {other}")),
        }
    }
}

/// One position in the input together with its decode result.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    /// Position of this record.
    pub offset: u64,
    /// Position to resume from once this record has been accounted for.
    pub next_offset: u64,
    pub result: Result<Record, RecordParseError>,
}

/// Streaming reader over one input file.
///
/// Malformed records come back as entries carrying a [`RecordParseError`];
/// only I/O failures end the stream with a [`ReaderError`].
pub struct RecordReader<R = BufReader<File>> {
    inner: R,
    format: InputFormat,
    offset: u64,
    finished: bool,
    buf: Vec<u8>,
}

impl RecordReader<BufReader<File>> {
    pub fn open(path: &Path, format: InputFormat) -> Result<Self, ReaderError> {
        Self::open_at(path, format, 0)
    }

    /// Open `path` positioned at a previously returned offset.
    pub fn open_at(path: &Path, format: InputFormat, offset: u64) -> Result<Self, ReaderError> {
        let mut file = File::open(path).map_err(|source| ReaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        if format.is_line_based() && offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
            let inner = BufReader::with_capacity(READ_BUFFER_BYTES, file);
            return Ok(Self::positioned(inner, format, offset));
        }

        let inner = BufReader::with_capacity(READ_BUFFER_BYTES, file);
        Self::from_reader_at(inner, format, offset)
    }
}

impl<R: BufRead> RecordReader<R> {
    pub fn from_reader(inner: R, format: InputFormat) -> Result<Self, ReaderError> {
        Self::from_reader_at(inner, format, 0)
    }

    /// Wrap a reader positioned at the start of the input and skip to `offset`.
    pub fn from_reader_at(inner: R, format: InputFormat, offset: u64) -> Result<Self, ReaderError> {
        let mut reader = Self::positioned(inner, format, 0);
        match format {
            InputFormat::JsonArray => {
                reader.open_array()?;
                for _ in 0..offset {
                    if !reader.skip_element()? {
                        break;
                    }
                }
                reader.offset = offset;
            }
            InputFormat::JsonLines | InputFormat::Text => {
                io::copy(&mut (&mut reader.inner).take(offset), &mut io::sink())?;
                reader.offset = offset;
            }
        }
        Ok(reader)
    }

    fn positioned(inner: R, format: InputFormat, offset: u64) -> Self {
        Self {
            inner,
            format,
            offset,
            finished: false,
            buf: Vec::new(),
        }
    }

    pub fn format(&self) -> InputFormat {
        self.format
    }

    /// Position of the next record to be returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Return the next entry, or `None` at end of input.
    pub fn advance(&mut self) -> Result<Option<RawEntry>, ReaderError> {
        if self.finished {
            return Ok(None);
        }
        let entry = match self.format {
            InputFormat::JsonArray => self.next_element()?,
            InputFormat::JsonLines | InputFormat::Text => self.next_line()?,
        };
        if entry.is_none() {
            self.finished = true;
        }
        Ok(entry)
    }

    fn next_line(&mut self) -> Result<Option<RawEntry>, ReaderError> {
        loop {
            self.buf.clear();
            let start = self.offset;
            let n = self.inner.read_until(b'\n', &mut self.buf)?;
            if n == 0 {
                return Ok(None);
            }
            self.offset += n as u64;

            let mut body = trim_ascii(&self.buf);
            if start == 0 {
                body = trim_ascii(body.strip_prefix(UTF8_BOM).unwrap_or(body));
            }
            if self.format == InputFormat::Text {
                body = text_body(body);
            }
            if body.is_empty() {
                continue;
            }

            return Ok(Some(RawEntry {
                offset: start,
                next_offset: self.offset,
                result: Record::from_slice(body),
            }));
        }
    }

    fn open_array(&mut self) -> Result<(), ReaderError> {
        if self.inner.fill_buf()?.starts_with(UTF8_BOM) {
            self.inner.consume(UTF8_BOM.len());
        }
        match self.skip_whitespace()? {
            Some(b'[') => {
                self.inner.consume(1);
                Ok(())
            }
            Some(other) => Err(ReaderError::Format(format!(
                "expected '[' at start of JSON array input, found {:?}",
                other as char
            ))),
            None => {
                self.finished = true;
                Ok(())
            }
        }
    }

    fn next_element(&mut self) -> Result<Option<RawEntry>, ReaderError> {
        if !self.seek_element_start()? {
            return Ok(None);
        }

        self.buf.clear();
        let complete = scan_element(&mut self.inner, &mut self.buf, true)?;
        let offset = self.offset;
        self.offset += 1;

        let result = if complete {
            Record::from_slice(&self.buf)
        } else {
            tracing::warn!(offset, "JSON array input ends inside an element");
            self.finished = true;
            Err(RecordParseError::Truncated)
        };

        Ok(Some(RawEntry {
            offset,
            next_offset: self.offset,
            result,
        }))
    }

    /// Skip one element without decoding it. Returns `false` at end of array.
    fn skip_element(&mut self) -> Result<bool, ReaderError> {
        if !self.seek_element_start()? {
            return Ok(false);
        }
        let mut scratch = Vec::new();
        Ok(scan_element(&mut self.inner, &mut scratch, false)?)
    }

    /// Move past separators to the first byte of the next element.
    fn seek_element_start(&mut self) -> Result<bool, ReaderError> {
        if self.finished {
            return Ok(false);
        }
        loop {
            match self.skip_whitespace()? {
                Some(b',') => self.inner.consume(1),
                Some(b']') => {
                    self.inner.consume(1);
                    self.finished = true;
                    return Ok(false);
                }
                Some(_) => return Ok(true),
                None => {
                    tracing::warn!(offset = self.offset, "JSON array input has no closing ']'");
                    self.finished = true;
                    return Ok(false);
                }
            }
        }
    }

    fn skip_whitespace(&mut self) -> io::Result<Option<u8>> {
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Ok(None);
            }
            match buf.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(pos) => {
                    let byte = buf[pos];
                    self.inner.consume(pos);
                    return Ok(Some(byte));
                }
                None => {
                    let len = buf.len();
                    self.inner.consume(len);
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<RawEntry, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

/// Tracks nesting while scanning one JSON value byte by byte.
#[derive(Default)]
struct ElementScanner {
    depth: u32,
    in_string: bool,
    escaped: bool,
    started: bool,
}

impl ElementScanner {
    /// Feed the next chunk. Returns the number of bytes of `chunk` that
    /// belong to the element once its end is found.
    fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        for (i, &b) in chunk.iter().enumerate() {
            let first = !self.started;
            self.started = true;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' if self.depth == 0 => {
                    // Stray closer: emit it alone so decoding reports it.
                    return Some(if first { i + 1 } else { i });
                }
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                b',' if self.depth == 0 => return Some(i),
                b if b.is_ascii_whitespace() && self.depth == 0 => return Some(i),
                _ => {}
            }
        }
        None
    }
}

/// Consume one element from `reader`, copying it into `out` when `keep` is set.
/// Returns `false` if the input ended before the element did.
fn scan_element<R: BufRead>(reader: &mut R, out: &mut Vec<u8>, keep: bool) -> io::Result<bool> {
    let mut scanner = ElementScanner::default();
    loop {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            return Ok(false);
        }
        match scanner.feed(chunk) {
            Some(n) => {
                if keep {
                    out.extend_from_slice(&chunk[..n]);
                }
                reader.consume(n);
                return Ok(true);
            }
            None => {
                let len = chunk.len();
                if keep {
                    out.extend_from_slice(chunk);
                }
                reader.consume(len);
            }
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end.max(start)]
}

/// Strip array punctuation from a text-format line.
fn text_body(line: &[u8]) -> &[u8] {
    let mut body = line;
    if let Some(rest) = body.strip_suffix(b",") {
        body = trim_ascii(rest);
    }
    if body == b"[" || body == b"]" {
        return &[];
    }
    if let Some(rest) = body.strip_prefix(b"[") {
        if trim_ascii(rest).starts_with(b"{") {
            body = trim_ascii(rest);
        }
    }
    if let Some(rest) = body.strip_suffix(b"]") {
        if trim_ascii(rest).ends_with(b"}") {
            body = trim_ascii(rest);
        }
    }
    body
}
