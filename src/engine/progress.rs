use regex::Regex;
use std::sync::OnceLock;

fn percent_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)%").expect("valid percent regex"))
}

/// Last well-formed percentage in a chunk of transfer output.
///
/// rsync `--info=progress2` prints lines like `  1,234,567  25%  1.23MB/s  0:00:04`.
/// Digits must be immediately followed by `%`; values that overflow or exceed 100 are
/// ignored.
pub fn parse_progress(chunk: &str) -> Option<u8> {
    percent_token()
        .captures_iter(chunk)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .filter(|v| *v <= 100)
        .last()
        .map(|v| v as u8)
}

/// Scans a stream for progress tokens across reads.
///
/// A pipe read can end in the middle of a token (`2` then `5%`). The trailing digit run
/// of each chunk is held back and prefixed to the next one, so a token is only parsed
/// once it is complete.
#[derive(Debug, Default)]
pub(crate) struct ProgressScanner {
    digits: String,
}

impl ProgressScanner {
    pub(crate) fn feed(&mut self, chunk: &str) -> Option<u8> {
        let mut text = std::mem::take(&mut self.digits);
        text.push_str(chunk);
        let settled = text.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        self.digits = text[settled..].to_string();
        parse_progress(&text[..settled])
    }
}

/// Carries incomplete UTF-8 sequences from one read to the next.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let out = text.to_owned();
                self.pending.clear();
                out
            }
            // Only a truncated sequence at the end; keep it for the next read.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                out
            }
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }

    pub(crate) fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
