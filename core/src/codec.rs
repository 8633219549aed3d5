//! Line protocol spoken with the verifier in `--in` mode.
//!
//! Outgoing commands are newline framed. A checking attempt is `#push`, the
//! region text, then `#end #ok #fail`, which tells the verifier to print `#ok`
//! or `#fail` once it has decided. `#pop` discards the most recent pushed
//! context.
//!
//! Incoming bytes are split into lines by [`OutputDecoder`], which also
//! recognizes the sentinels and keeps the text printed since the previous one.

use bytes::BytesMut;

pub const PUSH: &str = "#push";
pub const POP: &str = "#pop";
pub const END: &str = "#end #ok #fail";
pub const OK_SENTINEL: &str = "#ok";
pub const FAIL_SENTINEL: &str = "#fail";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Push,
    Source(String),
    End,
    Pop,
}

impl Command {
    /// Wire form, always newline terminated.
    pub fn encode(&self) -> String {
        match self {
            Command::Push => format!("{PUSH}\n"),
            Command::Source(text) => format!("{text}\n"),
            Command::End => format!("{END}\n"),
            Command::Pop => format!("{POP}\n"),
        }
    }

    /// The three commands making up one checking attempt.
    pub fn attempt(text: impl Into<String>) -> [Command; 3] {
        [Command::Push, Command::Source(text.into()), Command::End]
    }
}

/// Concatenated wire form of a command sequence.
pub fn encode_all<'a>(commands: impl IntoIterator<Item = &'a Command>) -> String {
    commands.into_iter().map(Command::encode).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// An ordinary output line, trailing whitespace removed.
    Line(String),
    /// The attempt was accepted. `output` holds everything printed since the
    /// previous sentinel, this line included.
    Accepted { output: String },
    /// The attempt was rejected. `output` is the text to mine for diagnostics.
    Rejected { output: String },
}

/// Incremental decoder for the verifier's stdout.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: BytesMut,
    output: String,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every line they completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.pending.extend_from_slice(chunk);
        let mut decoded = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line = self.pending.split_to(newline + 1);
            decoded.push(self.classify(&line[..newline]));
        }
        decoded
    }

    /// Appends an out-of-band line (stderr) to the running output without
    /// looking for sentinels in it.
    pub fn append_line(&mut self, line: &str) {
        self.output.push_str(line.trim_end());
        self.output.push('\n');
    }

    /// Flushes an unterminated trailing fragment, used at end of stream.
    pub fn finish(&mut self) -> Option<Decoded> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split();
        Some(self.classify(&rest))
    }

    /// Text accumulated since the last sentinel.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Drops the running output. Partial lines are kept since they belong to
    /// a stream that is still open.
    pub fn clear_output(&mut self) {
        self.output.clear();
    }

    /// Forgets everything, used when a new process is started.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.output.clear();
    }

    fn classify(&mut self, raw: &[u8]) -> Decoded {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end();
        self.output.push_str(line);
        self.output.push('\n');
        if line.ends_with(OK_SENTINEL) {
            Decoded::Accepted {
                output: std::mem::take(&mut self.output),
            }
        } else if line.ends_with(FAIL_SENTINEL) {
            Decoded::Rejected {
                output: std::mem::take(&mut self.output),
            }
        } else {
            Decoded::Line(line.to_string())
        }
    }
}
