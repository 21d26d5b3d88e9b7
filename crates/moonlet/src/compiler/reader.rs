// Buffered source reader (lzio's role): the host supplies source text in
// chunks through a callback; the lexer pulls one byte at a time.

/// End-of-stream marker returned by `next_byte`.
pub const EOZ: i32 = -1;

/// Host-side chunk supplier. Called on demand; `None` ends the stream.
pub type ReaderFn<'a> = Box<dyn FnMut() -> Option<Vec<u8>> + 'a>;

pub struct SourceReader<'a> {
    reader: ReaderFn<'a>,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> SourceReader<'a> {
    pub fn new(reader: ReaderFn<'a>) -> Self {
        SourceReader {
            reader,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Whole-buffer convenience used by `LuaVM::load`.
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        let mut given = false;
        SourceReader::new(Box::new(move || {
            if given {
                None
            } else {
                given = true;
                Some(bytes.to_vec())
            }
        }))
    }

    /// zgetc: next byte or EOZ.
    pub fn next_byte(&mut self) -> i32 {
        loop {
            if self.pos < self.buf.len() {
                let b = self.buf[self.pos];
                self.pos += 1;
                return b as i32;
            }
            match (self.reader)() {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                None => return EOZ,
            }
        }
    }
}
